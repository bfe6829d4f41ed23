//! Local machine identity: the announced username, LAN address and a free
//! server port.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::ops::Range;

/// Machine hostname, used as the default announced username
pub fn default_username() -> String {
    hostname::get()
        .ok()
        .and_then(|s| s.into_string().ok())
        .unwrap_or_else(|| "Unknown-PC".to_string())
}

/// Get local IP, prioritizing LAN ranges (192.168.x.x, 10.x.x.x, 172.16.x.x)
pub fn local_lan_ip() -> IpAddr {
    local_ip_address::list_afinet_netifas()
        .ok()
        .and_then(|ips| best_lan_ip(ips.into_iter().map(|(_name, ip)| ip)))
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn best_lan_ip(ips: impl IntoIterator<Item = IpAddr>) -> Option<IpAddr> {
    let mut best_ip = None;
    let mut best_rank = 0;
    for ip in ips {
        let IpAddr::V4(v4) = ip else { continue };
        if v4.is_loopback() {
            continue;
        }
        let rank = match v4.octets() {
            [192, 168, ..] => return Some(ip),
            [10, ..] => 3,
            [172, ..] => 2,
            _ => 1,
        };
        if rank > best_rank {
            best_rank = rank;
            best_ip = Some(ip);
        }
    }
    best_ip
}

/// First port in `range` that nothing is listening on
pub fn find_available_port(range: Range<u16>) -> Option<u16> {
    range.into_iter().find(|&port| {
        TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).is_ok()
    })
}
