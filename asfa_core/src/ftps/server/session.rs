use anyhow::Context;
use futures_util::StreamExt;
use std::io;
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinError, JoinHandle};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::auth::Authorizer;
use super::data::{self, Payload};
use super::path::{contained, resolve_virtual, to_real};
use super::throttle::Throttle;
use crate::ftps::reply::{
    MAX_LINE_LENGTH, format_mlsd_line, format_multiline_reply, format_pasv, format_reply,
    split_command,
};

pub const SERVER_BANNER: &str = "asfa server";

const FEATURES: [&str; 7] = [
    "AUTH TLS",
    "PBSZ",
    "PROT",
    "PASV",
    "SIZE",
    "MLST type*;size*;",
    "UTF8",
];

const NEEDS_LOGIN: [&str; 11] = [
    "PWD", "XPWD", "CWD", "XCWD", "CDUP", "XCUP", "SIZE", "PASV", "MLSD", "RETR", "ABOR",
];

/// The share is read-only
const WRITE_COMMANDS: [&str; 8] = ["STOR", "STOU", "APPE", "DELE", "RMD", "MKD", "RNFR", "RNTO"];

pub(super) struct SessionContext {
    pub acceptor: TlsAcceptor,
    pub authorizer: Authorizer,
    pub bandwidth: Arc<AtomicU64>,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

struct LoggedIn {
    username: String,
    root: PathBuf,
}

struct Transfer {
    task: JoinHandle<io::Result<()>>,
    cancel: CancellationToken,
}

impl Drop for Transfer {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

async fn write_raw<W: AsyncWrite + Unpin>(writer: &mut W, text: &str) -> io::Result<()> {
    writer.write_all(text.as_bytes()).await?;
    writer.flush().await
}

fn features_reply() -> String {
    format_multiline_reply(211, "Features supported:", &FEATURES, "End FEAT.")
}

/// Serve one control connection until QUIT, disconnect or server shutdown
pub(super) async fn run(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<SessionContext>,
    shutdown: CancellationToken,
) {
    tokio::select! {
        _ = shutdown.cancelled() => debug!(%peer, "Session closed by server shutdown"),
        result = serve(stream, peer, ctx) => match result {
            Ok(()) => debug!(%peer, "Session ended"),
            Err(e) => debug!(%peer, "Session ended with error: {:#}", e),
        },
    }
}

async fn serve(stream: TcpStream, peer: SocketAddr, ctx: Arc<SessionContext>) -> anyhow::Result<()> {
    let local_ip = stream.local_addr()?.ip();
    let Some(stream) = negotiate_tls(stream).await? else {
        return Ok(());
    };
    let tls = ctx
        .acceptor
        .accept(stream)
        .await
        .context("TLS handshake failed")?;
    debug!(%peer, "Control channel secured");

    let (reader, writer) = tokio::io::split(tls);
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let mut session = Session::new(writer, ctx, local_ip, peer);

    loop {
        tokio::select! {
            result = wait_transfer(&mut session.transfer) => {
                session.transfer = None;
                session.transfer_done(result).await?;
            }
            line = lines.next() => match line {
                Some(Ok(line)) => {
                    if session.handle(&line).await? == Flow::Quit {
                        break;
                    }
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    session.reply(500, "Command too long.").await?;
                }
                Some(Err(LinesCodecError::Io(e))) => return Err(e.into()),
                None => break,
            },
        }
    }

    if let Some(user) = &session.user {
        info!(%peer, username = %user.username, "User logged out");
    }
    let _ = session.writer.shutdown().await;
    Ok(())
}

/// Plain-text phase: only `AUTH TLS` (and a few harmless commands) are
/// accepted. Returns the stream to upgrade, or `None` if the client left.
async fn negotiate_tls(stream: TcpStream) -> io::Result<Option<TcpStream>> {
    let mut framed = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    write_raw(framed.get_mut(), &format_reply(220, SERVER_BANNER)).await?;

    while let Some(line) = framed.next().await {
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                write_raw(framed.get_mut(), &format_reply(500, "Command too long.")).await?;
                continue;
            }
            Err(LinesCodecError::Io(e)) => return Err(e),
        };
        let (cmd, arg) = split_command(&line);
        let reply = match cmd.as_str() {
            "AUTH" => match arg.to_ascii_uppercase().as_str() {
                "TLS" | "TLS-C" | "SSL" => {
                    write_raw(framed.get_mut(), &format_reply(234, "AUTH TLS successful."))
                        .await?;
                    return Ok(Some(framed.into_inner()));
                }
                _ => format_reply(504, "Unrecognized AUTH type."),
            },
            "QUIT" => {
                write_raw(framed.get_mut(), &format_reply(221, "Goodbye.")).await?;
                return Ok(None);
            }
            "FEAT" => features_reply(),
            "SYST" => format_reply(215, "UNIX Type: L8"),
            "NOOP" => format_reply(200, "NOOP ok."),
            _ => format_reply(550, "SSL/TLS required on the control channel."),
        };
        write_raw(framed.get_mut(), &reply).await?;
    }
    Ok(None)
}

async fn wait_transfer(transfer: &mut Option<Transfer>) -> Result<io::Result<()>, JoinError> {
    match transfer {
        Some(transfer) => (&mut transfer.task).await,
        None => std::future::pending().await,
    }
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// MLSD body for `dir`, sorted by name
async fn build_listing(dir: &Path) -> io::Result<String> {
    let mut rows = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        // Follows symlinks; dangling ones are left out
        let Ok(meta) = tokio::fs::metadata(entry.path()).await else {
            continue;
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        rows.push((name, meta.is_dir(), meta.len()));
    }
    rows.sort();
    Ok(rows
        .iter()
        .map(|(name, is_dir, size)| format_mlsd_line(name, *is_dir, *size))
        .collect())
}

struct Session {
    writer: WriteHalf<TlsStream<TcpStream>>,
    ctx: Arc<SessionContext>,
    local_ip: IpAddr,
    peer: SocketAddr,
    pending_user: Option<String>,
    user: Option<LoggedIn>,
    cwd: String,
    protected: bool,
    passive: Option<TcpListener>,
    transfer: Option<Transfer>,
}

impl Session {
    fn new(
        writer: WriteHalf<TlsStream<TcpStream>>,
        ctx: Arc<SessionContext>,
        local_ip: IpAddr,
        peer: SocketAddr,
    ) -> Self {
        Self {
            writer,
            ctx,
            local_ip,
            peer,
            pending_user: None,
            user: None,
            cwd: "/".to_string(),
            protected: false,
            passive: None,
            transfer: None,
        }
    }

    async fn reply(&mut self, code: u16, text: &str) -> io::Result<()> {
        write_raw(&mut self.writer, &format_reply(code, text)).await
    }

    async fn handle(&mut self, line: &str) -> io::Result<Flow> {
        let (cmd, arg) = split_command(line);
        if cmd == "PASS" {
            debug!(peer = %self.peer, "<- PASS ****");
        } else {
            debug!(peer = %self.peer, "<- {}", line);
        }

        let cmd = cmd.as_str();
        if self.user.is_none() && (NEEDS_LOGIN.contains(&cmd) || WRITE_COMMANDS.contains(&cmd)) {
            self.reply(530, "Log in with USER and PASS first.").await?;
            return Ok(Flow::Continue);
        }

        match cmd {
            "USER" => self.cmd_user(arg).await?,
            "PASS" => self.cmd_pass(arg).await?,
            "AUTH" => self.reply(503, "Already using TLS.").await?,
            "PBSZ" => self.reply(200, "PBSZ=0 successful.").await?,
            "PROT" => self.cmd_prot(arg).await?,
            "SYST" => self.reply(215, "UNIX Type: L8").await?,
            "FEAT" => write_raw(&mut self.writer, &features_reply()).await?,
            "OPTS" => self.cmd_opts(arg).await?,
            "NOOP" => self.reply(200, "NOOP ok.").await?,
            "TYPE" => self.cmd_type(arg).await?,
            "PWD" | "XPWD" => {
                let text = format!("\"{}\" is the current directory.", self.cwd);
                self.reply(257, &text).await?
            }
            "CWD" | "XCWD" => self.cmd_cwd(arg).await?,
            "CDUP" | "XCUP" => self.cmd_cwd("..").await?,
            "SIZE" => self.cmd_size(arg).await?,
            "PASV" => self.cmd_pasv().await?,
            "MLSD" => self.cmd_mlsd(arg).await?,
            "RETR" => self.cmd_retr(arg).await?,
            "ABOR" => self.cmd_abor().await?,
            "QUIT" => {
                self.reply(221, "Goodbye.").await?;
                return Ok(Flow::Quit);
            }
            c if WRITE_COMMANDS.contains(&c) => self.reply(550, "Not enough privileges.").await?,
            _ => self.reply(502, "Command not implemented.").await?,
        }
        Ok(Flow::Continue)
    }

    async fn cmd_user(&mut self, username: &str) -> io::Result<()> {
        // A new USER starts the login over
        self.user = None;
        self.cwd = "/".to_string();
        self.pending_user = Some(username.to_string());
        self.reply(331, "Username ok, send password.").await
    }

    async fn cmd_pass(&mut self, password: &str) -> io::Result<()> {
        let Some(username) = self.pending_user.take() else {
            return self.reply(503, "Login with USER first.").await;
        };
        match self.ctx.authorizer.validate(&username, password) {
            Ok(root) => {
                info!(peer = %self.peer, username = %username, "User logged in");
                self.user = Some(LoggedIn { username, root });
                self.cwd = "/".to_string();
                self.reply(230, "Login successful.").await
            }
            Err(failure) => {
                info!(peer = %self.peer, "Login failed: {}", failure);
                self.reply(530, &failure.to_string()).await
            }
        }
    }

    async fn cmd_prot(&mut self, level: &str) -> io::Result<()> {
        match level.to_ascii_uppercase().as_str() {
            "P" => {
                self.protected = true;
                self.reply(200, "Protection set to Private").await
            }
            "C" => {
                self.protected = false;
                self.reply(200, "Protection set to Clear").await
            }
            _ => {
                let text = format!("PROT {} unsupported (use C or P).", level);
                self.reply(504, &text).await
            }
        }
    }

    async fn cmd_opts(&mut self, arg: &str) -> io::Result<()> {
        let upper = arg.to_ascii_uppercase();
        if upper.starts_with("MLST") {
            self.reply(200, "MLST OPTS type;size;").await
        } else if upper.starts_with("UTF8") {
            self.reply(200, "Always in UTF8 mode.").await
        } else {
            self.reply(501, "Invalid OPTS argument.").await
        }
    }

    async fn cmd_type(&mut self, arg: &str) -> io::Result<()> {
        match arg.to_ascii_uppercase().as_str() {
            "I" | "L8" | "L 8" => self.reply(200, "Type set to: Binary.").await,
            "A" | "A N" => self.reply(200, "Type set to: ASCII.").await,
            _ => {
                let text = format!("Unsupported type '{}'.", arg);
                self.reply(504, &text).await
            }
        }
    }

    /// Virtual and canonical real path of `arg`, if it exists inside the root
    async fn resolve(&self, arg: &str) -> Option<(String, PathBuf)> {
        let user = self.user.as_ref()?;
        let virtual_path = resolve_virtual(&self.cwd, arg);
        let real = to_real(&user.root, &virtual_path)?;
        let real = contained(&user.root, &real).await?;
        Some((virtual_path, real))
    }

    async fn cmd_cwd(&mut self, arg: &str) -> io::Result<()> {
        match self.resolve(arg).await {
            Some((virtual_path, real)) if is_dir(&real).await => {
                let text = format!("\"{}\" is the current directory.", virtual_path);
                self.cwd = virtual_path;
                self.reply(250, &text).await
            }
            _ => self.reply(550, "No such file or directory.").await,
        }
    }

    async fn cmd_size(&mut self, arg: &str) -> io::Result<()> {
        let size = match self.resolve(arg).await {
            Some((_, real)) => tokio::fs::metadata(&real)
                .await
                .ok()
                .filter(|m| m.is_file())
                .map(|m| m.len()),
            None => None,
        };
        match size {
            Some(size) => self.reply(213, &size.to_string()).await,
            None => self.reply(550, "No such file or directory.").await,
        }
    }

    async fn cmd_pasv(&mut self) -> io::Result<()> {
        if !self.protected {
            return self.reply(522, "SSL/TLS required on the data channel.").await;
        }
        let ip = match self.local_ip {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(ip) => ip.to_ipv4_mapped(),
        };
        let Some(ip) = ip else {
            return self.reply(425, "Can't open passive connection.").await;
        };
        match TcpListener::bind((ip, 0)).await {
            Ok(listener) => {
                let port = listener.local_addr()?.port();
                self.passive = Some(listener);
                self.reply(227, &format_pasv(SocketAddrV4::new(ip, port)))
                    .await
            }
            Err(e) => {
                warn!(peer = %self.peer, "Passive listener failed: {}", e);
                self.reply(425, "Can't open passive connection.").await
            }
        }
    }

    /// Checks shared by data commands; hands out the passive listener
    async fn take_data_listener(&mut self) -> io::Result<Option<TcpListener>> {
        if !self.protected {
            self.reply(522, "SSL/TLS required on the data channel.").await?;
            return Ok(None);
        }
        if self.transfer.is_some() {
            self.reply(425, "Another transfer is in progress.").await?;
            return Ok(None);
        }
        match self.passive.take() {
            Some(listener) => Ok(Some(listener)),
            None => {
                self.reply(425, "Use PASV first.").await?;
                Ok(None)
            }
        }
    }

    async fn cmd_mlsd(&mut self, arg: &str) -> io::Result<()> {
        let Some(listener) = self.take_data_listener().await? else {
            return Ok(());
        };
        let dir = match self.resolve(arg).await {
            Some((_, real)) if is_dir(&real).await => real,
            _ => return self.reply(550, "No such file or directory.").await,
        };
        let listing = match build_listing(&dir).await {
            Ok(listing) => listing,
            Err(e) => {
                debug!(peer = %self.peer, "Listing {:?} failed: {}", dir, e);
                return self.reply(550, "No such file or directory.").await;
            }
        };
        self.reply(150, "File status okay. About to open data connection.")
            .await?;
        self.start_transfer(listener, Payload::Listing(listing.into_bytes()));
        Ok(())
    }

    async fn open_file(&self, arg: &str) -> Option<File> {
        let (_, real) = self.resolve(arg).await?;
        let meta = tokio::fs::metadata(&real).await.ok()?;
        if !meta.is_file() {
            return None;
        }
        File::open(&real).await.ok()
    }

    async fn cmd_retr(&mut self, arg: &str) -> io::Result<()> {
        let Some(listener) = self.take_data_listener().await? else {
            return Ok(());
        };
        let Some(file) = self.open_file(arg).await else {
            return self.reply(550, "No such file or directory.").await;
        };
        if let Some(user) = &self.user {
            info!(peer = %self.peer, username = %user.username, "Sending {}", resolve_virtual(&self.cwd, arg));
        }
        self.reply(150, "File status okay. About to open data connection.")
            .await?;
        self.start_transfer(listener, Payload::File(file));
        Ok(())
    }

    fn start_transfer(&mut self, listener: TcpListener, payload: Payload) {
        let cancel = CancellationToken::new();
        let throttle = Throttle::new(self.ctx.bandwidth.load(Ordering::Relaxed));
        let task = tokio::spawn(data::send(
            listener,
            self.peer.ip(),
            self.ctx.acceptor.clone(),
            payload,
            throttle,
            cancel.clone(),
        ));
        self.transfer = Some(Transfer { task, cancel });
    }

    async fn transfer_done(&mut self, result: Result<io::Result<()>, JoinError>) -> io::Result<()> {
        match result {
            Ok(Ok(())) => self.reply(226, "Transfer complete.").await,
            Ok(Err(e)) => {
                debug!(peer = %self.peer, "Transfer failed: {}", e);
                self.reply(426, "Connection closed; transfer aborted.").await
            }
            Err(e) => {
                warn!(peer = %self.peer, "Transfer task failed: {}", e);
                self.reply(426, "Connection closed; transfer aborted.").await
            }
        }
    }

    async fn cmd_abor(&mut self) -> io::Result<()> {
        match self.transfer.take() {
            Some(mut transfer) => {
                transfer.cancel.cancel();
                let _ = (&mut transfer.task).await;
                self.reply(426, "Transfer aborted.").await?;
                self.reply(226, "ABOR successful.").await
            }
            None => {
                self.passive = None;
                self.reply(225, "No transfer to abort.").await
            }
        }
    }
}
