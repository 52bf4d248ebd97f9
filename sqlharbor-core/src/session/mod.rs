pub mod id;
pub mod registry;

pub use id::TxId;
pub use registry::{SessionRegistrySnapshot, TxSession, TxSessionRegistry};
