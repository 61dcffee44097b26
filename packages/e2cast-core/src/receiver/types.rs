//! Wire types for the receiver's Web API.

use serde::{Deserialize, Serialize};

/// A bouquet (receiver-side channel grouping).
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Bouquet {
    /// Bouquet service reference.
    pub service_ref: String,
    /// Display name.
    pub name: String,
}

/// One service (channel) inside a bouquet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceEntry {
    /// Opaque service reference used for tuning.
    #[serde(rename = "servicereference")]
    pub service_ref: String,
    /// Display name.
    #[serde(rename = "servicename")]
    pub name: String,
}

/// One EPG event for a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EpgEvent {
    /// Event id on the receiver.
    #[serde(rename = "id")]
    pub id: i64,
    /// Title.
    #[serde(rename = "title", default)]
    pub title: String,
    /// Short description.
    #[serde(rename = "shortdesc", default)]
    pub short_desc: String,
    /// Start (Unix seconds).
    #[serde(rename = "begin_timestamp", default)]
    pub begin: i64,
    /// Duration (seconds).
    #[serde(rename = "duration_sec", default)]
    pub duration: i64,
}

/// Response shape of `/api/bouquets`: an array of `[sRef, name]` pairs.
#[derive(Debug, Deserialize)]
pub(crate) struct BouquetsResponse {
    pub bouquets: Vec<(String, String)>,
}

/// Response shape of `/api/getservices`.
#[derive(Debug, Deserialize)]
pub(crate) struct ServicesResponse {
    pub services: Vec<ServiceEntry>,
}

/// Response shape of `/api/epgservice`.
#[derive(Debug, Deserialize)]
pub(crate) struct EpgResponse {
    pub events: Vec<EpgEvent>,
}
