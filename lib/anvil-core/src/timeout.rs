//! Call timeouts.

use std::time::Duration;

/// Timeouts applied to a remote call.
///
/// `read` bounds the whole exchange, `connect` only the connection setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HttpTimeout {
    /// Total timeout of the request.
    pub read: Duration,
    /// Connection timeout.
    pub connect: Duration,
}

impl HttpTimeout {
    /// Create a timeout from whole seconds.
    #[must_use]
    pub const fn from_secs(read: u64, connect: u64) -> Self {
        Self {
            read: Duration::from_secs(read),
            connect: Duration::from_secs(connect),
        }
    }
}

impl Default for HttpTimeout {
    fn default() -> Self {
        Self::from_secs(30, 15)
    }
}
