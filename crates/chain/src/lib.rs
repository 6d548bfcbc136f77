//! Header chain validation, storage, and checkpoint seeding.

use ltcspv_log as logging;

macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if crate::logging::enabled($level) {
            crate::logging::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

macro_rules! log_warn {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Warn, $($arg)*);
    }};
}

macro_rules! log_info {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Info, $($arg)*);
    }};
}

macro_rules! log_debug {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Debug, $($arg)*);
    }};
}

pub mod checkpoints;
pub mod engine;
pub mod notify;
pub mod spv_store;
pub mod store;

pub use checkpoints::{CheckpointError, CheckpointManager};
pub use engine::{Acceptance, ChainEngine, ChainError, VerificationError};
pub use notify::ChainListener;
pub use spv_store::SpvFileStore;
pub use store::{BlockStore, MemoryBlockStore, StorageError, StoredBlock};
