use std::io;
use std::net;

/// Identity assigned to this client by the server during the handshake.
pub type ClientId = u16;

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Two-level error plumbing for the transport. `Wait` means the operation
/// cannot make progress right now and should be retried on the next
/// readiness event; everything else is fatal for the current session.
#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorType {
    AlreadyConnected,
    NotConnected,
    HandshakeTimeout,
    MalformedMessage,
    PayloadTooLarge,
    AddrParse,
    Disconnecting,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorType::AddrParse)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}

/// Selects the channel a message travels on.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendMode {
    /// Ordered, loss-free delivery over the stream channel.
    Reliable,
    /// Best-effort low-latency delivery over the datagram channel. Messages
    /// may be lost, duplicated or reordered.
    Unreliable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_folds_to_wait() {
        let err: NetworkError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, NetworkError::Wait);
    }

    #[test]
    fn test_io_error_is_fatal() {
        let err: NetworkError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert_eq!(err, NetworkError::Fatal(ErrorType::Io(io::ErrorKind::ConnectionReset)));
    }

    #[test]
    fn test_has_failed() {
        assert!(!Ok::<(), NetworkError>(()).has_failed());
        assert!(!Err::<(), _>(NetworkError::Wait).has_failed());
        assert!(Err::<(), _>(NetworkError::Fatal(ErrorType::NotConnected)).has_failed());
    }
}
