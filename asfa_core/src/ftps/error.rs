use std::io;
use thiserror::Error;

use super::reply::Reply;

#[derive(Debug, Error)]
pub enum FtpError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    /// 5xx reply: permission, authentication or missing-file errors
    #[error("{code} {text}")]
    Permanent { code: u16, text: String },
    /// 4xx reply
    #[error("{code} {text}")]
    Transient { code: u16, text: String },
    #[error("Unexpected reply: {code} {text}")]
    Unexpected { code: u16, text: String },
    #[error("Malformed reply: {0}")]
    Protocol(String),
    #[error("Connection closed by server")]
    Closed,
    #[error("Invalid host '{0}'")]
    InvalidHost(String),
}

impl FtpError {
    pub fn from_reply(reply: Reply) -> Self {
        let Reply { code, text } = reply;
        match code / 100 {
            5 => FtpError::Permanent { code, text },
            4 => FtpError::Transient { code, text },
            _ => FtpError::Unexpected { code, text },
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, FtpError::Permanent { .. })
    }

    pub fn is_connection_refused(&self) -> bool {
        matches!(self, FtpError::Io(e) if e.kind() == io::ErrorKind::ConnectionRefused)
    }
}
