//! ARP handling.
//!
//! The gateway answers every ARP request with its own synthetic MAC, so the
//! whole internet appears to sit one hop behind it.

use std::net::Ipv4Addr;

use crate::context::Context;
use crate::packet::{ARP_PACKET_LEN, ArpPacket, ETH_HEADER_LEN, ETHERTYPE_ARP, ETHERTYPE_IPV4, EthernetHeader};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArpOutcome {
    /// Not an Ethernet/IPv4 ARP request.
    Ignored,
    /// RFC 5227 probe from an unconfigured sender; never answered.
    Probe,
    /// Sender and target address match: the guest announced its address.
    Announcement(Ipv4Addr),
    Reply(Vec<u8>),
}

impl ArpOutcome {
    pub fn handled(&self) -> bool {
        !matches!(self, ArpOutcome::Ignored)
    }
}

/// Handle ARP request and return response if applicable.
pub fn handle_arp(ctx: &Context, eth: &EthernetHeader, payload: &[u8]) -> ArpOutcome {
    let request = match ArpPacket::parse(payload) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(error = %e, "dropping malformed ARP");
            return ArpOutcome::Ignored;
        }
    };
    if request.hw_type != ArpPacket::HW_ETHERNET
        || request.proto_type != ETHERTYPE_IPV4
        || request.op != ArpPacket::OP_REQUEST
        || request.hw_len != 6
        || request.proto_len != 4
    {
        return ArpOutcome::Ignored;
    }

    if request.sender_ip.is_unspecified() {
        tracing::debug!(target = %request.target_ip, "ARP probe");
        return ArpOutcome::Probe;
    }
    if request.sender_ip == request.target_ip {
        ctx.set_guest_ip(request.sender_ip);
        return ArpOutcome::Announcement(request.sender_ip);
    }
    ctx.set_guest_ip(request.sender_ip);

    tracing::debug!(target = %request.target_ip, "ARP request");
    let reply = ArpPacket {
        op: ArpPacket::OP_REPLY,
        sender_mac: ctx.gateway_mac(),
        sender_ip: request.target_ip,
        target_mac: request.sender_mac,
        target_ip: request.sender_ip,
        ..request
    };
    let eth = EthernetHeader {
        dst: eth.src,
        src: ctx.gateway_mac(),
        ethertype: ETHERTYPE_ARP,
    };
    let mut frame = Vec::with_capacity(ETH_HEADER_LEN + ARP_PACKET_LEN);
    frame.extend_from_slice(&eth.to_bytes());
    frame.extend_from_slice(&reply.to_bytes());
    ArpOutcome::Reply(frame)
}
