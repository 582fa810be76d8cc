//! IPv4 endpoint value type
//!
//! An [`Endpoint`] is the unit every discovery mechanism produces and the
//! transport aims at: four address bytes plus a port. IPv6 is not supported;
//! converting an IPv6 socket address fails instead of truncating it.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{NetworkError, NetworkResult};

/// IPv4 address + UDP port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Address octets in network order
    pub address: [u8; 4],
    /// UDP port
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint
    pub const fn new(address: [u8; 4], port: u16) -> Self {
        Self { address, port }
    }

    /// Address as [`Ipv4Addr`]
    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.address)
    }

    /// Convert to a socket address usable with `send_to`
    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip(), self.port))
    }

    /// Whether the address is 0.0.0.0
    pub fn is_unspecified(&self) -> bool {
        self.ip().is_unspecified()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip(), self.port)
    }
}

impl FromStr for Endpoint {
    type Err = NetworkError;

    fn from_str(s: &str) -> NetworkResult<Self> {
        let addr: SocketAddrV4 = s
            .trim()
            .parse()
            .map_err(|_| NetworkError::InvalidEndpoint(format!("expected a.b.c.d:port, got '{}'", s)))?;
        Ok(addr.into())
    }
}

impl From<SocketAddrV4> for Endpoint {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(addr.ip().octets(), addr.port())
    }
}

impl TryFrom<SocketAddr> for Endpoint {
    type Error = NetworkError;

    fn try_from(addr: SocketAddr) -> NetworkResult<Self> {
        match addr {
            SocketAddr::V4(v4) => Ok(v4.into()),
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(ip) => Ok(Self::new(ip.octets(), v6.port())),
                None => Err(NetworkError::InvalidEndpoint(format!(
                    "IPv6 endpoints are not supported: {}",
                    addr
                ))),
            },
        }
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_socket_addr()
    }
}
