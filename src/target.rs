// SPDX-License-Identifier: MIT OR Apache-2.0

//! Addressing for a TCP Modbus target (host, port, and default unit id).

use crate::error::{Error, ErrorCode};

const DEFAULT_PORT: u16 = 502;
const DEFAULT_SERVER_ID: u8 = 1;

/// A TCP Modbus target: the host/port to connect to, and the unit id placed
/// in the MBAP header for requests that do not override it explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16, unit_id: u8) -> Self {
        Self { host: host.into(), port, unit_id }
    }

    /// Parses a `host[:port[:server_id]]` descriptor, the form a command-line
    /// tool would accept for a Modbus TCP target. `host` may be a dotted
    /// IPv4 address or a plain hostname; `port` defaults to 502 and
    /// `server_id` to 1 when omitted.
    pub fn parse(descriptor: &str) -> Result<Self, Error> {
        let mut parts = descriptor.splitn(3, ':');
        let host = parts.next().filter(|h| !h.is_empty()).ok_or_else(|| {
            Error::with_detail(ErrorCode::IllegalIpOrPort, "empty target descriptor")
        })?;
        if !is_valid_host(host) {
            return Err(Error::with_detail(ErrorCode::IllegalIpOrPort, "not a valid host or IP"));
        }

        let port = match parts.next() {
            Some(raw) => raw
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| Error::with_detail(ErrorCode::IllegalIpOrPort, "invalid port"))?,
            None => DEFAULT_PORT,
        };

        let unit_id = match parts.next() {
            Some(raw) => raw
                .parse::<u8>()
                .ok()
                .filter(|id| (1..=247).contains(id))
                .ok_or_else(|| Error::with_detail(ErrorCode::IllegalIpOrPort, "invalid server id"))?,
            None => DEFAULT_SERVER_ID,
        };

        Ok(Self { host: host.to_owned(), port, unit_id })
    }
}

fn is_valid_host(host: &str) -> bool {
    if host.parse::<std::net::Ipv4Addr>().is_ok() {
        return true;
    }
    host.split('.')
        .all(|label| !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'))
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} (unit {})", self.host, self.port, self.unit_id)
    }
}
