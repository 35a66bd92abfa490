//! STUN Binding codec (RFC 5389)
//!
//! Only the slice of STUN this system needs: encoding a Binding Request
//! and extracting MAPPED-ADDRESS / XOR-MAPPED-ADDRESS from a Binding
//! Response. IPv6 families are skipped.

use std::net::{Ipv4Addr, SocketAddrV4};

use rand::RngCore;

/// Binding Request message type
pub const BINDING_REQUEST: u16 = 0x0001;
/// Binding Response message type
pub const BINDING_RESPONSE: u16 = 0x0101;
/// Fixed magic cookie, bytes 4-7 of every RFC 5389 message
pub const MAGIC_COOKIE: u32 = 0x2112_A442;
/// Header length in bytes
pub const HEADER_LEN: usize = 20;
/// Transaction id length in bytes
pub const TRANSACTION_ID_LEN: usize = 12;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const FAMILY_IPV4: u8 = 0x01;

/// Generate a fresh cryptographically-random transaction id
pub fn new_transaction_id() -> [u8; TRANSACTION_ID_LEN] {
    let mut id = [0u8; TRANSACTION_ID_LEN];
    rand::rngs::OsRng.fill_bytes(&mut id);
    id
}

/// Encode a Binding Request with the given transaction id
pub fn encode_binding_request(transaction_id: &[u8; TRANSACTION_ID_LEN]) -> [u8; HEADER_LEN] {
    let mut msg = [0u8; HEADER_LEN];
    msg[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // attribute length 0: header only
    msg[2..4].copy_from_slice(&0u16.to_be_bytes());
    msg[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg[8..20].copy_from_slice(transaction_id);
    msg
}

/// Decode a Binding Response and extract the server-observed address
///
/// Returns `None` for anything that is not a well-formed response to the
/// given transaction: short datagrams, wrong message type, wrong cookie,
/// echoed transaction id mismatch, or a response carrying no usable
/// address attribute. XOR-MAPPED-ADDRESS wins over MAPPED-ADDRESS when
/// both are present.
pub fn decode_binding_response(
    buf: &[u8],
    transaction_id: &[u8; TRANSACTION_ID_LEN],
) -> Option<SocketAddrV4> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
    if msg_type != BINDING_RESPONSE {
        return None;
    }
    let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if cookie != MAGIC_COOKIE {
        return None;
    }
    if &buf[8..20] != transaction_id {
        return None;
    }

    let mut mapped = None;
    let mut xor_mapped = None;

    let mut offset = HEADER_LEN;
    while offset + 4 <= buf.len() {
        let attr_type = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        let attr_len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
        let value_start = offset + 4;
        let value_end = value_start + attr_len;
        if value_end > buf.len() {
            break;
        }
        let value = &buf[value_start..value_end];

        match attr_type {
            ATTR_MAPPED_ADDRESS => {
                if let Some(addr) = parse_address(value, false) {
                    mapped = Some(addr);
                }
            }
            ATTR_XOR_MAPPED_ADDRESS => {
                if let Some(addr) = parse_address(value, true) {
                    xor_mapped = Some(addr);
                }
            }
            _ => {}
        }

        // attributes are padded to a 4-byte boundary
        offset = value_end + padding(attr_len);
    }

    xor_mapped.or(mapped)
}

/// Encode a Binding Response carrying the given mapped address
///
/// Used by the loopback STUN servers in the test suite; real servers are
/// expected to be RFC 5389 compliant.
pub fn encode_binding_response(
    transaction_id: &[u8; TRANSACTION_ID_LEN],
    addr: SocketAddrV4,
    xor: bool,
) -> Vec<u8> {
    let attr_type = if xor {
        ATTR_XOR_MAPPED_ADDRESS
    } else {
        ATTR_MAPPED_ADDRESS
    };
    let (port, ip) = if xor {
        (
            addr.port() ^ (MAGIC_COOKIE >> 16) as u16,
            u32::from(*addr.ip()) ^ MAGIC_COOKIE,
        )
    } else {
        (addr.port(), u32::from(*addr.ip()))
    };

    let mut msg = Vec::with_capacity(HEADER_LEN + 12);
    msg.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
    msg.extend_from_slice(&12u16.to_be_bytes());
    msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg.extend_from_slice(transaction_id);
    msg.extend_from_slice(&attr_type.to_be_bytes());
    msg.extend_from_slice(&8u16.to_be_bytes());
    msg.push(0); // reserved
    msg.push(FAMILY_IPV4);
    msg.extend_from_slice(&port.to_be_bytes());
    msg.extend_from_slice(&ip.to_be_bytes());
    msg
}

fn parse_address(value: &[u8], xor: bool) -> Option<SocketAddrV4> {
    if value.len() < 8 {
        return None;
    }
    if value[1] != FAMILY_IPV4 {
        // IPv6 (0x02) and unknown families are skipped
        return None;
    }
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    let mut ip = u32::from_be_bytes([value[4], value[5], value[6], value[7]]);
    if xor {
        port ^= (MAGIC_COOKIE >> 16) as u16;
        ip ^= MAGIC_COOKIE;
    }
    Some(SocketAddrV4::new(Ipv4Addr::from(ip), port))
}

fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}
