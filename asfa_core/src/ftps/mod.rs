//! Explicit-TLS FTP: the client used by downloads and browsing, and the
//! server that shares local folders with peers.

mod client;
mod error;
pub mod reply;
mod server;
mod tls;

pub use client::{DataStream, FtpsClient};
pub use error::FtpError;
pub use reply::Reply;
pub use server::{AuthFailure, AuthorizeError, Authorizer, SERVER_BANNER, Throttle, TransferServer};

use serde::{Deserialize, Serialize};

/// Login details for a peer's server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
}

impl Credentials {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            host: host.into(),
            port,
        }
    }

    /// Open a session, log in and protect the data channel
    pub async fn open_session(&self) -> Result<FtpsClient, FtpError> {
        let mut client = FtpsClient::connect(&self.host, self.port).await?;
        client.login(&self.username, &self.password).await?;
        client.prot_p().await?;
        Ok(client)
    }
}
