//! Validated network addresses.
//!
//! An [`Endpoint`] is what a client connects to; servers only need a [`Port`]
//! and bind the wildcard address.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::num::NonZeroU16;
use std::str::FromStr;

/// IPv4 address accepted as either `localhost` or a dotted quad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpAddress(Ipv4Addr);

impl IpAddress {
    pub const LOCALHOST: IpAddress = IpAddress(Ipv4Addr::LOCALHOST);

    pub fn parse(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("localhost") {
            return Ok(Self::LOCALHOST);
        }
        s.parse::<Ipv4Addr>()
            .map(IpAddress)
            .map_err(|_| Error::InvalidAddress(s.to_string()))
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.0
    }
}

impl From<Ipv4Addr> for IpAddress {
    fn from(addr: Ipv4Addr) -> Self {
        IpAddress(addr)
    }
}

/// Servers bind IPv4 only, so a peer is either IPv4 or IPv4-mapped IPv6.
impl TryFrom<IpAddr> for IpAddress {
    type Error = Error;

    fn try_from(addr: IpAddr) -> Result<Self> {
        match addr {
            IpAddr::V4(v4) => Ok(IpAddress(v4)),
            IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .map(IpAddress)
                .ok_or_else(|| Error::InvalidAddress(v6.to_string())),
        }
    }
}

impl FromStr for IpAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A TCP port in `1..=65535`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Port(NonZeroU16);

impl Port {
    pub fn new(port: u16) -> Result<Self> {
        NonZeroU16::new(port)
            .map(Port)
            .ok_or_else(|| Error::InvalidPort(port.to_string()))
    }

    pub fn get(&self) -> u16 {
        self.0.get()
    }
}

impl TryFrom<u16> for Port {
    type Error = Error;

    fn try_from(port: u16) -> Result<Self> {
        Port::new(port)
    }
}

impl From<Port> for u16 {
    fn from(port: Port) -> u16 {
        port.get()
    }
}

impl FromStr for Port {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let raw: u16 = s.parse().map_err(|_| Error::InvalidPort(s.to_string()))?;
        Port::new(raw)
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: IpAddress,
    pub port: Port,
}

impl Endpoint {
    pub fn new(ip: IpAddress, port: Port) -> Self {
        Self { ip, port }
    }

    /// Loopback endpoint for the given port.
    pub fn localhost(port: Port) -> Self {
        Self::new(IpAddress::LOCALHOST, port)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip.addr(), self.port.get()))
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (ip, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidEndpoint(s.to_string()))?;
        Ok(Self::new(ip.parse()?, port.parse()?))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}
