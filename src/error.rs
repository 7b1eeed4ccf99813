/*! Error kinds for the LCC node stack.

Recoverable conditions (a rejected datagram, a failed memory read) are
never exceptions: they become arguments to a memo's `on_fail`/`on_reject`
callback. Only conditions that can't be attributed to a single in-flight
operation (a malformed frame at the transport boundary, a dead
connection) are returned as `Result::Err` to the caller driving the
event loop.
*/

/// Error returned by the LCC node stack.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A `NodeID` string or byte sequence did not parse.
    #[error("invalid node ID: {0}")]
    InvalidNodeID(String),

    /// GridConnect input could not be parsed as a frame.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The GridConnect receive buffer overflowed and was dropped.
    #[error("framing lost: receive buffer overflowed")]
    FramingLost,

    /// Alias arbitration saw a conflicting claim for the candidate alias.
    #[error("alias collision on {0:#05x}")]
    AliasCollision(u16),

    /// No alias could be arbitrated within the retry bound.
    #[error("alias arbitration exhausted after {0} attempts")]
    AliasExhausted(u32),

    /// A peer rejected a datagram.
    #[error("datagram rejected by peer: code {code:#06x}")]
    DatagramRejected {
        /// Reason code from the `Datagram_Rejected` message.
        code: u16,
    },

    /// No reply was received for a datagram within the timeout.
    #[error("datagram timed out waiting for reply")]
    DatagramTimeout,

    /// A datagram-receive listener raised while handling an inbound datagram.
    #[error("permanent error handling inbound datagram: {0}")]
    PermanentError(String),

    /// A memory-configuration operation failed.
    #[error("memory fault: code {code:#06x}")]
    MemoryFault {
        /// Error code from the read/write reply.
        code: u16,
    },

    /// A value did not fit in the requested serialized width.
    #[error("value out of range for {bytes}-byte field")]
    OutOfRange {
        /// Width, in bytes, that was requested.
        bytes: usize,
    },

    /// A write target overflowed its fixed-size buffer.
    #[error("buffer overflow")]
    BufferOverflow,

    /// The transport signalled that the connection is gone.
    #[error("connection broken")]
    ConnectionBroken,

    /// An in-flight memo was cancelled by its caller.
    #[error("cancelled")]
    Cancelled,
}

/// Convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
