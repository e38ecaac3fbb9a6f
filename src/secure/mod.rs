pub mod handle;

pub use handle::{Fingerprint, HandleId, HandleState, SecureHandle, WipeOutcome};
