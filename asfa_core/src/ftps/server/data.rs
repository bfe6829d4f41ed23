use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::throttle::Throttle;

/// How long a passive listener waits for the client to connect
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Write size on the data channel
const DATA_CHUNK_SIZE: usize = 64 * 1024;

pub(super) enum Payload {
    File(File),
    Listing(Vec<u8>),
}

/// Accept the client on the passive listener, secure the connection and send
/// `payload`. Only a connection from `client_ip` is taken. Returns early with
/// `Interrupted` once `cancel` fires.
pub(super) async fn send(
    listener: TcpListener,
    client_ip: IpAddr,
    acceptor: TlsAcceptor,
    payload: Payload,
    throttle: Throttle,
    cancel: CancellationToken,
) -> io::Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(io::Error::new(io::ErrorKind::Interrupted, "transfer aborted")),
        result = send_inner(listener, client_ip, acceptor, payload, throttle) => result,
    }
}

/// Accept until a connection arrives from `client_ip`; others are closed
async fn accept_from(listener: &TcpListener, client_ip: IpAddr) -> io::Result<(TcpStream, SocketAddr)> {
    let client_ip = client_ip.to_canonical();
    loop {
        let (tcp, peer) = listener.accept().await?;
        if peer.ip().to_canonical() == client_ip {
            return Ok((tcp, peer));
        }
        warn!(%peer, expected = %client_ip, "Dropping data connection from another host");
    }
}

async fn send_inner(
    listener: TcpListener,
    client_ip: IpAddr,
    acceptor: TlsAcceptor,
    payload: Payload,
    mut throttle: Throttle,
) -> io::Result<()> {
    let (tcp, peer) = tokio::time::timeout(ACCEPT_TIMEOUT, accept_from(&listener, client_ip))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no data connection"))??;
    drop(listener);
    debug!(%peer, "Data connection accepted");

    let mut stream = acceptor.accept(tcp).await?;
    let mut sent: u64 = 0;

    match payload {
        Payload::Listing(bytes) => {
            for chunk in bytes.chunks(DATA_CHUNK_SIZE) {
                throttle.consume(chunk.len()).await;
                stream.write_all(chunk).await?;
                sent += chunk.len() as u64;
            }
        }
        Payload::File(mut file) => {
            let mut buffer = vec![0u8; DATA_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buffer).await?;
                if n == 0 {
                    break;
                }
                throttle.consume(n).await;
                stream.write_all(&buffer[..n]).await?;
                sent += n as u64;
            }
        }
    }

    stream.shutdown().await?;
    debug!(%peer, "Data connection closed after {} bytes", sent);
    Ok(())
}
