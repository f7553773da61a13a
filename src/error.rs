use std::fmt;

/// Errors surfaced by the task dispatcher.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum DispatchError {
    /// Construction parameter out of range.
    #[error("{0}")]
    InvalidArgument(&'static str),
    /// The executor could not take the item.
    #[error("{0}")]
    Rejected(&'static str),
}

/// Errors surfaced by the connector on the synchronous connect path.
#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
    #[error("the connection fails: {0}")]
    Failed(String),
    #[error("connect timed out")]
    Timeout,
    #[error("endpoint is closed")]
    Closed,
}

impl From<std::io::Error> for ConnectError {
    #[inline]
    fn from(e: std::io::Error) -> Self {
        Self::Failed(e.to_string())
    }
}

/// "rpc_" prefix is reserved for internal errors carried back to a pending
/// invocation.
#[derive(strum::Display, strum::EnumString, strum::AsRefStr, PartialEq, Clone, Copy, thiserror::Error)]
#[repr(u8)]
pub enum InvokeError {
    /// Connect failed, or the channel went away before the response
    #[strum(serialize = "rpc_unreachable")]
    Unreachable = 0,
    /// IO error on the stream
    #[strum(serialize = "rpc_io_err")]
    IO = 1,
    /// The invocation out-waited its deadline
    #[strum(serialize = "rpc_timeout")]
    Timeout = 2,
    /// Response payload could not be deserialized
    #[strum(serialize = "rpc_decode")]
    Decode = 3,
    /// The endpoint was shut down
    #[strum(serialize = "rpc_closed")]
    Closed = 4,
}

// The default Debug derive would ignore the strum serialization.
impl fmt::Debug for InvokeError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl InvokeError {
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.as_ref().as_bytes()
    }
}

impl From<std::io::Error> for InvokeError {
    #[inline(always)]
    fn from(_e: std::io::Error) -> Self {
        Self::IO
    }
}

/// Framing errors raised by the decoder; every kind closes the stream.
#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    #[error("wrong magic in frame head")]
    BadMagic,
    #[error("frame version {0} not supported")]
    BadVersion(u8),
    #[error("unknown frame kind {0}")]
    BadKind(u8),
    #[error("frame body of {0} bytes exceeds limit")]
    TooLarge(u32),
    #[error("read timed out inside a frame")]
    Timeout,
    #[error("stream closed")]
    Eof,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_invoke_error_wire_names() {
        let s = InvokeError::Unreachable.as_ref();
        assert_eq!(s, "rpc_unreachable");
        let e = InvokeError::from_str(s).expect("parse");
        assert_eq!(e, InvokeError::Unreachable);
        assert!(InvokeError::from_str("not_an_error").is_err());
        println!("{} {:?}", InvokeError::Decode, InvokeError::Decode);
    }

    #[test]
    fn test_dispatch_error_messages() {
        let e = DispatchError::Rejected("ring buffer is full");
        assert_eq!(format!("{}", e), "ring buffer is full");
    }
}
