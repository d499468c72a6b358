//! FTP application-level gateway.
//!
//! FTP announces data-channel endpoints in-band. A guest acting as client
//! sends `PORT h1,h2,h3,h4,p1,p2`; a guest acting as server replies
//! `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`. Both name the guest's
//! private address, so the gateway listens on the host in its place and
//! rewrites the numbers before they reach the peer.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::ops::Range;

/// Only the start of a segment is scanned.
const SCAN_LIMIT: usize = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtpDirection {
    /// Guest is the server; look for a `227` passive-mode reply.
    PassiveReply,
    /// Guest is the client; look for a `PORT` command.
    PortCommand,
}

/// An endpoint announced in a control-channel segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpEndpoint {
    pub addr: SocketAddrV4,
    /// Byte range of the six numbers within the segment.
    span: Range<usize>,
}

/// Finds the data endpoint announced in `payload`, if any.
pub fn parse(payload: &[u8], direction: FtpDirection) -> Option<FtpEndpoint> {
    let text: Vec<u8> = payload
        .iter()
        .take(SCAN_LIMIT)
        .map(|&b| if b < b' ' || b > b'z' { b' ' } else { b.to_ascii_lowercase() })
        .collect();
    let mut pos = text.iter().position(|&b| b != b' ')?;

    match direction {
        FtpDirection::PassiveReply => {
            let line = &text[pos..];
            if !line.starts_with(b"227") || line.get(3).is_some_and(u8::is_ascii_digit) {
                return None;
            }
            if !line.windows(7).any(|w| w == b"passive") {
                return None;
            }
            pos += line.iter().position(|&b| b == b'(')? + 1;
        }
        FtpDirection::PortCommand => {
            if !text[pos..].starts_with(b"port ") {
                return None;
            }
            pos += 5;
        }
    }

    let mut numbers = [0u8; 6];
    let mut start = None;
    let mut end = pos;
    for (i, slot) in numbers.iter_mut().enumerate() {
        while text.get(pos) == Some(&b' ') {
            pos += 1;
        }
        let digits = text[pos..].iter().take_while(|b| b.is_ascii_digit()).count();
        if digits == 0 || digits > 3 {
            return None;
        }
        start.get_or_insert(pos);
        let value: u16 = std::str::from_utf8(&text[pos..pos + digits]).ok()?.parse().ok()?;
        *slot = u8::try_from(value).ok()?;
        pos += digits;
        end = pos;

        if i < 5 {
            while text.get(pos) == Some(&b' ') {
                pos += 1;
            }
            if text.get(pos) != Some(&b',') {
                return None;
            }
            pos += 1;
        }
    }

    let ip = Ipv4Addr::new(numbers[0], numbers[1], numbers[2], numbers[3]);
    let port = u16::from_be_bytes([numbers[4], numbers[5]]);
    if ip.is_unspecified() || port == 0 {
        return None;
    }
    Some(FtpEndpoint {
        addr: SocketAddrV4::new(ip, port),
        span: start?..end,
    })
}

/// Replaces the endpoint's numbers in `payload` with `addr`. The segment
/// grows or shrinks with the text.
pub fn rewrite(payload: &[u8], endpoint: &FtpEndpoint, addr: SocketAddrV4) -> Vec<u8> {
    let [a, b, c, d] = addr.ip().octets();
    let [p1, p2] = addr.port().to_be_bytes();
    let numbers = format!("{},{},{},{},{},{}", a, b, c, d, p1, p2);

    let mut out = Vec::with_capacity(payload.len() + numbers.len());
    out.extend_from_slice(&payload[..endpoint.span.start]);
    out.extend_from_slice(numbers.as_bytes());
    out.extend_from_slice(&payload[endpoint.span.end..]);
    out
}
