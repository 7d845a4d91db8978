use core::fmt;
use core::net::Ipv4Addr;

use crate::net::error::NetError;

const DEFAULT_PORT: u16 = 80;

/// The parts of an `http://` URL needed to issue a GET
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Url<'a> {
    pub host: &'a str,
    pub port: u16,
    /// Path and query as written, possibly empty
    pub path: &'a str,
}

impl<'a> Url<'a> {
    pub fn parse(url: &'a str) -> Result<Self, NetError> {
        let (scheme, rest) = url.split_once("://").ok_or(NetError::InvalidUrl)?;
        if scheme.is_empty() || !scheme.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'+') {
            return Err(NetError::InvalidUrl);
        }
        if !scheme.eq_ignore_ascii_case("http") {
            return Err(NetError::SchemeNotSupported);
        }

        // Fragments never reach the server
        let rest = rest.split_once('#').map_or(rest, |(before, _)| before);

        let (authority, path) = match rest.find(['/', '?']) {
            Some(idx) => rest.split_at(idx),
            None => (rest, ""),
        };

        if authority.contains('@') {
            return Err(NetError::InvalidUrl);
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, "")) => (host, DEFAULT_PORT),
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| NetError::InvalidUrl)?;
                if port == 0 {
                    return Err(NetError::InvalidUrl);
                }
                (host, port)
            }
            None => (authority, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(NetError::InvalidUrl);
        }

        Ok(Self { host, port, path })
    }

    /// Write the request target, which always starts with `/`
    pub fn write_target(&self, out: &mut impl fmt::Write) -> fmt::Result {
        if !self.path.starts_with('/') {
            out.write_char('/')?;
        }
        out.write_str(self.path)
    }

    /// The host as an address, when it is a literal IPv4 address
    pub fn literal_ip(&self) -> Option<Ipv4Addr> {
        self.host.parse().ok()
    }
}
