//! SSH Error types

use thiserror::Error;

use crate::error::{Classify, ErrorClass};

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Host key changed: expected {expected}, got {actual}")]
    HostKeyMismatch { expected: String, actual: String },

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    /// The remote end refused a direct-tcpip channel (nothing listening yet)
    #[error("Channel open refused: {0}")]
    ChannelOpenRefused(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("SFTP error: {0}")]
    SftpError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Disconnected")]
    Disconnected,

    #[error("Not supported: {0}")]
    Unsupported(String),
}

impl Classify for SshError {
    fn class(&self) -> ErrorClass {
        match self {
            SshError::AuthenticationFailed(_)
            | SshError::HostKeyMismatch { .. }
            | SshError::KeyError(_) => ErrorClass::Unauthorized,
            SshError::Disconnected | SshError::ProtocolError(_) => ErrorClass::ConnectionLost,
            SshError::ConnectionFailed(_)
            | SshError::ChannelError(_)
            | SshError::ChannelOpenRefused(_)
            | SshError::IoError(_)
            | SshError::Timeout(_) => ErrorClass::Transient,
            SshError::SftpError(_) | SshError::Unsupported(_) => ErrorClass::Fatal,
        }
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::Disconnect | russh::Error::HUP => SshError::Disconnected,
            russh::Error::ChannelOpenFailure(reason) => {
                SshError::ChannelOpenRefused(format!("{:?}", reason))
            }
            russh::Error::IO(e) => SshError::IoError(e),
            other => SshError::ProtocolError(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

impl From<russh_sftp::client::error::Error> for SshError {
    fn from(err: russh_sftp::client::error::Error) -> Self {
        SshError::SftpError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failures_fail_fast() {
        assert_eq!(
            SshError::AuthenticationFailed("denied".into()).class(),
            ErrorClass::Unauthorized
        );
        assert_eq!(
            SshError::HostKeyMismatch {
                expected: "a".into(),
                actual: "b".into()
            }
            .class(),
            ErrorClass::Unauthorized
        );
    }

    #[test]
    fn test_refused_is_transient() {
        let io = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(SshError::from(io).class(), ErrorClass::Transient);
        assert_eq!(SshError::Timeout("slow".into()).class(), ErrorClass::Transient);
    }

    #[test]
    fn test_russh_mapping() {
        assert!(matches!(
            SshError::from(russh::Error::Disconnect),
            SshError::Disconnected
        ));
        let io = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert!(matches!(
            SshError::from(russh::Error::IO(io)),
            SshError::IoError(_)
        ));
    }
}
