use std::{
    io,
    net::{IpAddr, SocketAddr, TcpStream},
    time::Duration,
};

use log::debug;

const DEFAULT_PORT: u16 = 443;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens the transport connection for a requested `host:port` address.
pub trait Dialer {
    fn dial(&self, addr: &str) -> io::Result<TcpStream>;
}

impl<F> Dialer for F
where
    F: Fn(&str) -> io::Result<TcpStream>,
{
    fn dial(&self, addr: &str) -> io::Result<TcpStream> {
        self(addr)
    }
}

/// Connects to one fixed IP whatever host was asked for. Only the port of
/// the requested address is kept, 443 when it has none.
#[derive(Clone, Debug)]
pub struct FixedIpDialer {
    ip: IpAddr,
}

impl FixedIpDialer {
    pub fn new(ip: IpAddr) -> Self {
        Self { ip }
    }

    fn target(&self, addr: &str) -> SocketAddr {
        SocketAddr::new(self.ip, requested_port(addr).unwrap_or(DEFAULT_PORT))
    }
}

impl Dialer for FixedIpDialer {
    fn dial(&self, addr: &str) -> io::Result<TcpStream> {
        let target = self.target(addr);
        debug!("dialing {target} in place of {addr}");
        TcpStream::connect_timeout(&target, CONNECT_TIMEOUT)
    }
}

fn requested_port(addr: &str) -> Option<u16> {
    let (host, port) = addr.rsplit_once(':')?;
    // bare IPv6 literal, no port
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return None;
    }
    port.parse().ok()
}
