use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::error::Error;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Relay destination, carried as the first bytes of every stream and of every
/// datagram payload: `atyp(1) || body || port(2, big-endian)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Address {
    /// Read one wire-format address record from `r`.
    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, Error> {
        let mut atyp = [0u8; 1];
        r.read_exact(&mut atyp).await.map_err(map_eof)?;
        match atyp[0] {
            ATYP_IPV4 => {
                let mut body = [0u8; 6];
                r.read_exact(&mut body).await.map_err(map_eof)?;
                let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
                let port = u16::from_be_bytes([body[4], body[5]]);
                Ok(Address::Ip(SocketAddr::new(IpAddr::V4(ip), port)))
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                r.read_exact(&mut len).await.map_err(map_eof)?;
                let len = len[0] as usize;
                if len == 0 {
                    return Err(Error::ShortRead);
                }
                let mut body = vec![0u8; len + 2];
                r.read_exact(&mut body).await.map_err(map_eof)?;
                let port = u16::from_be_bytes([body[len], body[len + 1]]);
                let domain = String::from_utf8(body[..len].to_vec())
                    .map_err(|_| Error::Params("domain is not valid UTF-8".into()))?;
                Ok(Address::Domain(domain, port))
            }
            ATYP_IPV6 => {
                let mut body = [0u8; 18];
                r.read_exact(&mut body).await.map_err(map_eof)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&body[..16]);
                let port = u16::from_be_bytes([body[16], body[17]]);
                Ok(Address::Ip(SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(octets)),
                    port,
                )))
            }
            other => Err(Error::BadAtyp(other)),
        }
    }

    /// Parse an address record at the start of `buf` without copying the rest.
    /// Returns the address and how many bytes it occupied.
    pub fn split(buf: &[u8]) -> Result<(Self, usize), Error> {
        let atyp = *buf.first().ok_or(Error::ShortRead)?;
        match atyp {
            ATYP_IPV4 => {
                if buf.len() < 1 + 4 + 2 {
                    return Err(Error::ShortRead);
                }
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok((Address::Ip(SocketAddr::new(IpAddr::V4(ip), port)), 7))
            }
            ATYP_DOMAIN => {
                let len = *buf.get(1).ok_or(Error::ShortRead)? as usize;
                if len == 0 {
                    return Err(Error::ShortRead);
                }
                let end = 2 + len + 2;
                if buf.len() < end {
                    return Err(Error::ShortRead);
                }
                let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
                let domain = String::from_utf8(buf[2..2 + len].to_vec())
                    .map_err(|_| Error::Params("domain is not valid UTF-8".into()))?;
                Ok((Address::Domain(domain, port), end))
            }
            ATYP_IPV6 => {
                if buf.len() < 1 + 16 + 2 {
                    return Err(Error::ShortRead);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok((
                    Address::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)),
                    19,
                ))
            }
            other => Err(Error::BadAtyp(other)),
        }
    }

    /// Parse a "host:port" string the way reply encapsulation needs it.
    pub fn parse(s: &str) -> Result<Self, Error> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::Ip(addr));
        }
        if let Some((host, port_str)) = s.rsplit_once(':') {
            if let Ok(port) = port_str.parse::<u16>() {
                if host.is_empty() || host.len() > 255 {
                    return Err(Error::Params(format!("invalid host in address: {s}")));
                }
                return Ok(Address::Domain(host.to_string(), port));
            }
        }
        Err(Error::Params(format!("invalid address: {s}")))
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Address::Ip(addr)
    }

    /// Wire-encode into `buf`.
    pub fn write_to(&self, buf: &mut BytesMut) {
        match self {
            Address::Ip(SocketAddr::V4(a)) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&a.ip().octets());
                buf.put_u16(a.port());
            }
            Address::Ip(SocketAddr::V6(a)) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&a.ip().octets());
                buf.put_u16(a.port());
            }
            Address::Domain(domain, port) => {
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.write_to(&mut buf);
        buf.to_vec()
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Address::Ip(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// The literal IP for policy checks; None for domain targets.
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ip(addr) => Some(addr.ip()),
            Address::Domain(..) => None,
        }
    }

    pub fn domain(&self) -> Option<&str> {
        match self {
            Address::Domain(domain, _) => Some(domain),
            Address::Ip(_) => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

fn map_eof(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::ShortRead
    } else {
        Error::Io(e)
    }
}
