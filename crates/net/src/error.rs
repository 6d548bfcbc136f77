//! The network-layer error taxonomy.

use ltcspv_primitives::encoding::DecodeError;
use ltcspv_primitives::Transaction;

#[derive(Debug)]
pub enum NetError {
    /// Bad framing or payload; recovered at the message boundary.
    Codec(DecodeError),
    Io(String),
    /// The remote broke the protocol contract.
    Protocol(&'static str),
    /// A ping or tracked request deadline expired.
    PeerTimeout,
    /// Dependency download hit its depth or wall-clock bound; carries the
    /// transactions resolved so far, children first.
    DependencyLimit(Vec<Transaction>),
    /// The peer's mempool does not advertise the requested transaction.
    NotInMempool,
    Cancelled,
    /// No discovery source produced a usable address.
    NetworkUnavailable,
    /// The connection is closing or closed.
    Closed,
}

impl std::fmt::Display for NetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetError::Codec(err) => write!(f, "{err}"),
            NetError::Io(message) => write!(f, "{message}"),
            NetError::Protocol(message) => write!(f, "protocol violation: {message}"),
            NetError::PeerTimeout => write!(f, "peer timed out"),
            NetError::DependencyLimit(partial) => write!(
                f,
                "dependency download limit hit after {} transaction(s)",
                partial.len()
            ),
            NetError::NotInMempool => write!(f, "transaction not in peer mempool"),
            NetError::Cancelled => write!(f, "operation cancelled"),
            NetError::NetworkUnavailable => write!(f, "no peer addresses discovered"),
            NetError::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for NetError {}

impl From<DecodeError> for NetError {
    fn from(err: DecodeError) -> Self {
        NetError::Codec(err)
    }
}

impl From<std::io::Error> for NetError {
    fn from(err: std::io::Error) -> Self {
        NetError::Io(err.to_string())
    }
}
