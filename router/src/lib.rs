//! User-space IPv4 NAT gateway for an emulated guest.
//!
//! The guest sees one Ethernet peer, the gateway, behind which the whole
//! internet appears to live. Guest TCP, UDP and ICMP traffic is terminated
//! here and re-issued through ordinary host sockets; replies are wrapped
//! back into Ethernet frames for the guest.

mod arp;
pub mod config;
mod context;
pub mod error;
mod ftp;
mod gateway;
mod host;
mod icmp;
pub mod packet;
mod registry;
mod tcp;
mod udp;

#[cfg(test)]
pub(crate) mod testkit;

pub use config::{ListenPort, RouterConfig};
pub use context::{Context, FrameSink, SYNTHETIC_TTL};
pub use error::{Result, RouterError};
pub use gateway::{Gateway, GatewayStats, SWEEP_INTERVAL};
pub use icmp::HostFailure;
pub use tcp::{MAX_SEGMENT_SIZE, TcpState};
