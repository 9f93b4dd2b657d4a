// =============================================================================
// Microstructure signal pipeline
// =============================================================================

pub mod flow;
pub mod micro;
pub mod rolling;
pub mod zscore;

pub use flow::SecondBucketFlow;
pub use micro::{EntrySignal, ExitReason, ExitSignal, MicroSignals};
