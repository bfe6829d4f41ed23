use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use super::error::FtpError;
use super::reply::{Reply, parse_pasv, read_reply};
use super::tls;

/// TLS-protected data connection of a running retrieval
pub type DataStream = TlsStream<TcpStream>;

/// Explicit-TLS FTP client session.
///
/// Opening a session performs `AUTH TLS` right after the greeting; every
/// later command, credentials included, travels over TLS.
pub struct FtpsClient {
    control: BufReader<TlsStream<TcpStream>>,
    connector: TlsConnector,
    host: String,
}

async fn send_line<W: AsyncWrite + Unpin>(writer: &mut W, command: &str) -> Result<(), FtpError> {
    writer.write_all(command.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await?;
    Ok(())
}

fn expect(reply: Reply, accepted: &[u16]) -> Result<Reply, FtpError> {
    if accepted.contains(&reply.code) {
        Ok(reply)
    } else {
        Err(FtpError::from_reply(reply))
    }
}

impl FtpsClient {
    /// Connect, read the greeting and upgrade the control channel
    pub async fn connect(host: &str, port: u16) -> Result<Self, FtpError> {
        let tcp = TcpStream::connect((host, port)).await?;
        let mut plain = BufReader::new(tcp);

        expect(read_reply(&mut plain).await?, &[220])?;
        send_line(&mut plain, "AUTH TLS").await?;
        expect(read_reply(&mut plain).await?, &[234])?;

        let connector = tls::make_connector()?;
        let stream = connector
            .connect(tls::server_name(host)?, plain.into_inner())
            .await?;
        debug!("Control channel to {}:{} secured", host, port);

        Ok(Self {
            control: BufReader::new(stream),
            connector,
            host: host.to_string(),
        })
    }

    async fn command(&mut self, command: &str) -> Result<Reply, FtpError> {
        send_line(&mut self.control, command).await?;
        read_reply(&mut self.control).await
    }

    pub async fn login(&mut self, username: &str, password: &str) -> Result<(), FtpError> {
        let reply = expect(self.command(&format!("USER {}", username)).await?, &[230, 331])?;
        if reply.code == 230 {
            return Ok(());
        }
        expect(self.command(&format!("PASS {}", password)).await?, &[202, 230])?;
        Ok(())
    }

    /// Require TLS on data connections
    pub async fn prot_p(&mut self) -> Result<(), FtpError> {
        expect(self.command("PBSZ 0").await?, &[200])?;
        expect(self.command("PROT P").await?, &[200])?;
        Ok(())
    }

    pub async fn cwd(&mut self, path: &str) -> Result<(), FtpError> {
        if path.is_empty() {
            return Ok(());
        }
        expect(self.command(&format!("CWD {}", path)).await?, &[250])?;
        Ok(())
    }

    pub async fn pwd(&mut self) -> Result<String, FtpError> {
        let reply = expect(self.command("PWD").await?, &[257])?;
        let path = reply
            .text
            .split('"')
            .nth(1)
            .ok_or_else(|| FtpError::Protocol(reply.text.clone()))?;
        Ok(path.to_string())
    }

    pub async fn size(&mut self, name: &str) -> Result<u64, FtpError> {
        let reply = expect(self.command(&format!("SIZE {}", name)).await?, &[213])?;
        reply
            .text
            .trim()
            .parse()
            .map_err(|_| FtpError::Protocol(reply.text.clone()))
    }

    /// Enter passive mode and connect the (still plain) data socket
    async fn open_passive(&mut self) -> Result<TcpStream, FtpError> {
        let reply = expect(self.command("PASV").await?, &[227])?;
        let advertised = parse_pasv(&reply.text)?;
        // The advertised address may be private to the server's network
        let peer = self.control.get_ref().get_ref().0.peer_addr()?;
        let addr = SocketAddr::new(peer.ip(), advertised.port());
        Ok(TcpStream::connect(addr).await?)
    }

    async fn start_data_command(&mut self, command: &str) -> Result<DataStream, FtpError> {
        let data = self.open_passive().await?;
        let reply = self.command(command).await?;
        if !reply.is_preliminary() {
            return Err(FtpError::from_reply(reply));
        }
        Ok(self
            .connector
            .connect(tls::server_name(&self.host)?, data)
            .await?)
    }

    /// Start a binary retrieval. Read the returned stream to EOF, then call
    /// [`finish_transfer`](Self::finish_transfer), or [`abort`](Self::abort).
    pub async fn retrieve(&mut self, name: &str) -> Result<DataStream, FtpError> {
        expect(self.command("TYPE I").await?, &[200])?;
        self.start_data_command(&format!("RETR {}", name)).await
    }

    /// Close the data connection and read the transfer-complete reply
    pub async fn finish_transfer(&mut self, data: DataStream) -> Result<(), FtpError> {
        drop(data);
        expect(read_reply(&mut self.control).await?, &[226, 250])?;
        Ok(())
    }

    /// Drop the data connection and abort the transfer on the server
    pub async fn abort(&mut self, data: DataStream) -> Result<(), FtpError> {
        drop(data);
        let mut reply = self.command("ABOR").await?;
        if reply.code == 426 {
            reply = read_reply(&mut self.control).await?;
        }
        expect(reply, &[225, 226])?;
        Ok(())
    }

    /// Raw MLSD lines of `path` (the working directory when `None`)
    pub async fn mlsd(&mut self, path: Option<&str>) -> Result<Vec<String>, FtpError> {
        // Not every server understands it; the listing still works
        let _ = self.command("OPTS MLST type;size;").await?;

        let command = match path {
            Some(path) if !path.is_empty() => format!("MLSD {}", path),
            _ => "MLSD".to_string(),
        };
        let mut data = self.start_data_command(&command).await?;
        let mut raw = Vec::new();
        data.read_to_end(&mut raw).await?;
        self.finish_transfer(data).await?;

        Ok(String::from_utf8_lossy(&raw)
            .lines()
            .map(|l| l.trim_end_matches('\r').to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    pub async fn quit(mut self) -> Result<(), FtpError> {
        let result = self.command("QUIT").await.map(|_| ());
        let _ = self.control.get_mut().shutdown().await;
        result
    }
}
