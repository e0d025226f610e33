//! Host/port value type: a resolved numeric IP (v4 or v6) plus a port.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// An endpoint address. Invalid until both the address and the port are
/// set; the two halves can arrive independently (resolution, config).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Debug)]
pub struct HostPort {
    ip: Option<IpAddr>,
    port: Option<u16>,
}

impl HostPort {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip: Some(ip), port: Some(port) }
    }

    /// Parses `ip:port` with a numeric IPv4 or IPv6 address. Returns an
    /// invalid value on any miss.
    pub fn parse(text: &str) -> Self {
        match text.parse::<SocketAddr>() {
            Ok(addr) => Self::from(addr),
            Err(_) => Self::default(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.ip.is_some() && self.port.is_some()
    }

    pub fn is_invalid(&self) -> bool {
        !self.is_valid()
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn set_ip(&mut self, ip: IpAddr) {
        self.ip = Some(ip);
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = Some(port);
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self.ip, Some(IpAddr::V6(_)))
    }

    /// A connectable address, when both halves are present.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        Some(SocketAddr::new(self.ip?, self.port?))
    }
}

impl From<SocketAddr> for HostPort {
    fn from(addr: SocketAddr) -> Self {
        Self { ip: Some(addr.ip()), port: Some(addr.port()) }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_socket_addr() {
            Some(addr) => write!(f, "{addr}"),
            None => f.write_str("<invalid>"),
        }
    }
}
