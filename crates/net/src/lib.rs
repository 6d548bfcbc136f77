//! Outbound peer connections and the peer-group orchestrator.

use ltcspv_log as logging;

macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if crate::logging::enabled($level) {
            crate::logging::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

macro_rules! log_error {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Error, $($arg)*);
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

pub mod cancel;
pub mod discovery;
pub mod error;
pub mod peer;
pub mod peer_book;
pub mod peer_group;

pub use cancel::CancelToken;
pub use discovery::{DnsSeedDiscovery, FixedAddresses, HttpSeedDiscovery, PeerDiscovery};
pub use error::NetError;
pub use peer::{DisconnectReason, PeerConnection, PeerEvent, PeerState};
pub use peer_book::PeerBook;
pub use peer_group::{PeerGroup, PeerGroupConfig};
