//! Persistent boot environment: the record model and its crash-safe log store.

pub mod record;
pub mod store;

pub use record::{BootFlag, EnvRecord, ImageDescriptor, SlotState, SwapPhase, SwapProgress};
pub use store::{EnvError, EnvStore, Loaded, RecordSource, SaveOutcome};
