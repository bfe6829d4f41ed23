//! Control-channel framing shared by the client and the server: reply lines,
//! passive-mode addresses and MLSD facts.

use std::net::{Ipv4Addr, SocketAddrV4};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use super::error::FtpError;

/// Longest control line either side accepts
pub const MAX_LINE_LENGTH: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub text: String,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }
}

pub fn format_reply(code: u16, text: &str) -> String {
    format!("{} {}\r\n", code, text)
}

/// Multi-line reply: `ddd-first`, indented body lines, `ddd last`
pub fn format_multiline_reply(code: u16, first: &str, body: &[&str], last: &str) -> String {
    let mut out = format!("{}-{}\r\n", code, first);
    for line in body {
        out.push(' ');
        out.push_str(line);
        out.push_str("\r\n");
    }
    out.push_str(&format_reply(code, last));
    out
}

fn parse_code(line: &str) -> Result<(u16, bool), FtpError> {
    let bytes = line.as_bytes();
    if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_digit) {
        return Err(FtpError::Protocol(line.to_string()));
    }
    let code = line[..3]
        .parse()
        .map_err(|_| FtpError::Protocol(line.to_string()))?;
    Ok((code, bytes.get(3) == Some(&b'-')))
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String, FtpError> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(FtpError::Closed);
    }
    if line.len() > MAX_LINE_LENGTH {
        return Err(FtpError::Protocol("reply line too long".to_string()));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Read one (possibly multi-line) reply
pub async fn read_reply<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Reply, FtpError> {
    let first = read_line(reader).await?;
    let (code, multiline) = parse_code(&first)?;
    let mut text = first.get(4..).unwrap_or("").to_string();

    if multiline {
        let terminator = format!("{} ", &first[..3]);
        loop {
            let line = read_line(reader).await?;
            text.push('\n');
            if let Some(last) = line.strip_prefix(&terminator) {
                text.push_str(last);
                break;
            }
            text.push_str(line.trim_start());
        }
    }
    Ok(Reply { code, text })
}

/// Split a command line into its upper-cased verb and its argument
pub fn split_command(line: &str) -> (String, &str) {
    let line = line.trim_end_matches(['\r', '\n']);
    match line.split_once(' ') {
        Some((cmd, arg)) => (cmd.to_ascii_uppercase(), arg.trim()),
        None => (line.trim().to_ascii_uppercase(), ""),
    }
}

pub fn format_pasv(addr: SocketAddrV4) -> String {
    let [h1, h2, h3, h4] = addr.ip().octets();
    let port = addr.port();
    format!(
        "Entering passive mode ({},{},{},{},{},{}).",
        h1,
        h2,
        h3,
        h4,
        port >> 8,
        port & 0xff
    )
}

/// Parse the `(h1,h2,h3,h4,p1,p2)` part of a 227 reply
pub fn parse_pasv(text: &str) -> Result<SocketAddrV4, FtpError> {
    let malformed = || FtpError::Protocol(format!("bad PASV reply: {}", text));
    let start = text.find('(').ok_or_else(malformed)?;
    let end = text[start..].find(')').ok_or_else(malformed)? + start;
    let numbers: Vec<u8> = text[start + 1..end]
        .split(',')
        .map(|n| n.trim().parse::<u8>())
        .collect::<Result<_, _>>()
        .map_err(|_| malformed())?;
    let [h1, h2, h3, h4, p1, p2] = numbers[..] else {
        return Err(malformed());
    };
    Ok(SocketAddrV4::new(
        Ipv4Addr::new(h1, h2, h3, h4),
        u16::from(p1) << 8 | u16::from(p2),
    ))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MlsdEntry {
    pub name: String,
    /// Lower-cased `type` fact (`file`, `dir`, `cdir`, `pdir`, ...)
    pub kind: String,
    pub size: Option<u64>,
}

pub fn format_mlsd_line(name: &str, is_dir: bool, size: u64) -> String {
    let kind = if is_dir { "dir" } else { "file" };
    format!("type={};size={}; {}\r\n", kind, size, name)
}

/// Parse `fact=value;fact=value; name`
pub fn parse_mlsd_line(line: &str) -> Option<MlsdEntry> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (facts, name) = line.split_once(' ')?;
    if name.is_empty() {
        return None;
    }
    let mut kind = String::new();
    let mut size = None;
    for fact in facts.split(';').filter(|f| !f.is_empty()) {
        let Some((key, value)) = fact.split_once('=') else {
            continue;
        };
        match key.to_ascii_lowercase().as_str() {
            "type" => kind = value.to_ascii_lowercase(),
            "size" => size = value.parse().ok(),
            _ => {}
        }
    }
    Some(MlsdEntry {
        name: name.to_string(),
        kind,
        size,
    })
}
