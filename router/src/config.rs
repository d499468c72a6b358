//! Router configuration, read once at startup.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, UdpSocket};
use std::path::Path;
use std::str::FromStr;

use crate::error::{Result, RouterError};
use crate::packet::MacAddr;

/// Locally administered address spelling "NUBUS".
pub const DEFAULT_GATEWAY_MAC: MacAddr = MacAddr([0x02, 0x4e, 0x55, 0x42, 0x55, 0x53]);
pub const DEFAULT_FTP_PORT: u16 = 21;
pub const MAX_FTP_PORTS: usize = 100;
pub const DEFAULT_MAX_TCP_CONNECTIONS: usize = 64;
pub const DEFAULT_MAX_SESSIONS: usize = 1024;

/// An inbound TCP port to pre-register, written `port[,bind-ip]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ListenPort {
    pub port: u16,
    pub bind: Option<Ipv4Addr>,
}

impl FromStr for ListenPort {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || RouterError::Config(format!("invalid listen port '{}'", s));
        let mut parts = s.split(',').map(str::trim);
        let port: u16 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .filter(|p| *p != 0)
            .ok_or_else(invalid)?;
        let bind = match parts.next() {
            Some(ip) if !ip.is_empty() => Some(ip.parse::<Ipv4Addr>().map_err(|_| invalid())?),
            _ => None,
        };
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(ListenPort { port, bind })
    }
}

impl TryFrom<String> for ListenPort {
    type Error = RouterError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ListenPort> for String {
    fn from(p: ListenPort) -> String {
        p.to_string()
    }
}

impl fmt::Display for ListenPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bind {
            Some(ip) => write!(f, "{},{}", self.port, ip),
            None => write!(f, "{}", self.port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Synthetic MAC the gateway answers ARP with.
    pub gateway_mac: MacAddr,
    /// Guest MAC; learned from guest frames when unset.
    pub guest_mac: Option<MacAddr>,
    /// Seed for the guest IP, normally learned from its ARP traffic.
    pub guest_ip: Option<Ipv4Addr>,
    /// Source address of synthesized ICMP errors.
    pub router_ip: Option<Ipv4Addr>,
    pub tcp_ports: Vec<ListenPort>,
    pub ftp_ports: Vec<u16>,
    pub max_tcp_connections: usize,
    pub max_sessions: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            gateway_mac: DEFAULT_GATEWAY_MAC,
            guest_mac: None,
            guest_ip: None,
            router_ip: None,
            tcp_ports: Vec::new(),
            ftp_ports: vec![DEFAULT_FTP_PORT],
            max_tcp_connections: DEFAULT_MAX_TCP_CONNECTIONS,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

impl RouterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: RouterConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ftp_ports.len() > MAX_FTP_PORTS {
            return Err(RouterError::Config(format!(
                "at most {} FTP ports are supported, got {}",
                MAX_FTP_PORTS,
                self.ftp_ports.len()
            )));
        }
        if self.ftp_ports.contains(&0) {
            return Err(RouterError::Config("FTP port 0 is not valid".into()));
        }
        if self.max_tcp_connections == 0 || self.max_sessions == 0 {
            return Err(RouterError::Config(
                "table capacities must be at least 1".into(),
            ));
        }
        if self.gateway_mac.is_zero() || self.gateway_mac.0[0] & 1 != 0 {
            return Err(RouterError::Config(format!(
                "gateway MAC {} must be a unicast address",
                self.gateway_mac
            )));
        }
        Ok(())
    }

    /// The configured router IP, else the host's primary IPv4 address,
    /// else loopback.
    pub fn resolve_router_ip(&self) -> Ipv4Addr {
        self.router_ip
            .or_else(primary_ipv4)
            .unwrap_or(Ipv4Addr::LOCALHOST)
    }
}

/// Address the host would use to reach the internet. A connected UDP
/// socket sends nothing; it only selects a route.
fn primary_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    match socket.local_addr().ok()?.ip() {
        std::net::IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_listen_port_parse() {
        assert_eq!(
            "8080".parse::<ListenPort>().unwrap(),
            ListenPort {
                port: 8080,
                bind: None
            }
        );
        assert_eq!(
            "21, 192.168.0.1".parse::<ListenPort>().unwrap(),
            ListenPort {
                port: 21,
                bind: Some(Ipv4Addr::new(192, 168, 0, 1))
            }
        );
        assert!("0".parse::<ListenPort>().is_err());
        assert!("http".parse::<ListenPort>().is_err());
        assert!("21,not-an-ip".parse::<ListenPort>().is_err());
        assert!("21,1.2.3.4,5".parse::<ListenPort>().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = RouterConfig::default();
        assert_eq!(config.ftp_ports, vec![21]);
        assert_eq!(config.max_tcp_connections, 64);
        assert_eq!(config.max_sessions, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "gateway_mac": "02:00:00:00:00:01",
                "tcp_ports": ["8080", "2121,127.0.0.1"],
                "ftp_ports": [21, 2121]
            }}"#
        )
        .unwrap();

        let config = RouterConfig::load(file.path()).unwrap();
        assert_eq!(config.gateway_mac, MacAddr([2, 0, 0, 0, 0, 1]));
        assert_eq!(config.tcp_ports.len(), 2);
        assert_eq!(config.tcp_ports[1].bind, Some(Ipv4Addr::LOCALHOST));
        assert_eq!(config.ftp_ports, vec![21, 2121]);
        // unspecified fields keep their defaults
        assert_eq!(config.max_sessions, DEFAULT_MAX_SESSIONS);
    }

    #[test]
    fn test_load_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"gateway_mac": "ff:ff:ff:ff:ff:ff"}}"#).unwrap();
        assert!(matches!(
            RouterConfig::load(file.path()),
            Err(RouterError::Config(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"tcp_ports": ["nope"]}}"#).unwrap();
        assert!(matches!(
            RouterConfig::load(file.path()),
            Err(RouterError::Json(_))
        ));
    }

    #[test]
    fn test_router_ip_prefers_config() {
        let config = RouterConfig {
            router_ip: Some(Ipv4Addr::new(10, 1, 2, 3)),
            ..RouterConfig::default()
        };
        assert_eq!(config.resolve_router_ip(), Ipv4Addr::new(10, 1, 2, 3));
    }
}
