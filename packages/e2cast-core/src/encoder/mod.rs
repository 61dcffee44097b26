//! Encoder subprocess management.
//!
//! Three concerns, three files:
//!
//! - [`args`]: pure construction of the encoder command line per strategy.
//! - [`classifier`]: stderr pattern catalog mapped to reason codes and
//!   retry hints, driving the fallback ladder.
//! - [`supervisor`]: spawn, progress tracking, stall detection, kill
//!   escalation and guaranteed cleanup.

pub mod args;
pub mod classifier;
pub mod supervisor;

pub use args::{build_args, EncoderOutput, Strategy};
pub use classifier::{classify_exit, RetryHint, Verdict};
pub use supervisor::{run_encoder, EncoderError, EncoderRun, EncoderSpec, SupervisorTimeouts};
