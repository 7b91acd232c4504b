//! RIPv2 (RFC 2453) framing: plaintext-password authentication and response
//! entry parsing. This daemon never replies; it only ever consumes
//! responses carrying advertisements.

use std::net::Ipv4Addr;

use crate::error::RejectReason;

const ENTRY_LEN: usize = 20;
const HEADER_LEN: usize = 4;
const AF_INET: u16 = 2;
const AF_AUTH: u16 = 0xFFFF;
const AUTH_TYPE_PLAINTEXT: u16 = 2;
const CMD_RESPONSE: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RipResponse {
    pub ipaddr: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub next_hop: Ipv4Addr,
}

/// Parses one UDP datagram's worth of bytes into authenticated response
/// entries. A packet that isn't a response, doesn't parse, or fails
/// authentication yields a single [`RejectReason`] and no entries.
pub fn parse_packet(buf: &[u8], password: &[u8; 16]) -> Result<Vec<RipResponse>, RejectReason> {
    if buf.len() < HEADER_LEN {
        return Err(RejectReason::MalformedPacket("packet shorter than header".into()));
    }
    let command = buf[0];
    if command != CMD_RESPONSE {
        return Err(RejectReason::MalformedPacket(format!(
            "unsupported command {command}"
        )));
    }

    let body = &buf[HEADER_LEN..];
    if body.len() % ENTRY_LEN != 0 {
        return Err(RejectReason::MalformedPacket(
            "body length is not a multiple of the entry size".into(),
        ));
    }

    let mut entries = body.chunks_exact(ENTRY_LEN);
    let mut authenticated = false;
    let mut out = Vec::with_capacity(entries.len());

    for entry in &mut entries {
        let family = u16::from_be_bytes([entry[0], entry[1]]);
        if family == AF_AUTH {
            let auth_type = u16::from_be_bytes([entry[2], entry[3]]);
            if auth_type != AUTH_TYPE_PLAINTEXT {
                return Err(RejectReason::AuthenticationFailed);
            }
            if &entry[4..20] != password {
                return Err(RejectReason::AuthenticationFailed);
            }
            authenticated = true;
            continue;
        }
        if family != AF_INET {
            continue;
        }

        let ipaddr = read_addr(&entry[4..8]);
        let subnet_mask = read_addr(&entry[12..16]);
        let next_hop = read_addr(&entry[16..20]);

        if next_hop == Ipv4Addr::UNSPECIFIED {
            return Err(RejectReason::ZeroNextHop);
        }

        out.push(RipResponse {
            ipaddr,
            subnet_mask,
            next_hop,
        });
    }

    if !authenticated {
        return Err(RejectReason::AuthenticationFailed);
    }

    Ok(out)
}

fn read_addr(bytes: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])
}

/// Builds a password entry suitable for test fixtures (the daemon never
/// sends packets of its own, but tests need to construct input datagrams).
#[cfg(test)]
pub fn encode_test_packet(password: &[u8; 16], entries: &[RipResponse]) -> Vec<u8> {
    let mut buf = vec![CMD_RESPONSE, 2, 0, 0];

    buf.extend_from_slice(&AF_AUTH.to_be_bytes());
    buf.extend_from_slice(&AUTH_TYPE_PLAINTEXT.to_be_bytes());
    buf.extend_from_slice(password);

    for entry in entries {
        buf.extend_from_slice(&AF_INET.to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&entry.ipaddr.octets());
        buf.extend_from_slice(&[0, 0, 0, 0]);
        buf.extend_from_slice(&entry.subnet_mask.octets());
        buf.extend_from_slice(&entry.next_hop.octets());
    }

    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unauthenticated_packet() {
        let password = *b"TESTPASSWORD1234";
        let mut buf = vec![CMD_RESPONSE, 2, 0, 0];
        buf.extend_from_slice(&AF_INET.to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&Ipv4Addr::new(10, 0, 0, 0).octets());
        buf.extend_from_slice(&[0, 0, 0, 0]);
        buf.extend_from_slice(&Ipv4Addr::new(255, 0, 0, 0).octets());
        buf.extend_from_slice(&Ipv4Addr::new(192, 0, 2, 1).octets());

        assert_eq!(
            parse_packet(&buf, &password),
            Err(RejectReason::AuthenticationFailed)
        );
    }

    #[test]
    fn rejects_wrong_password() {
        let buf = encode_test_packet(
            b"TESTPASSWORD1234",
            &[RipResponse {
                ipaddr: Ipv4Addr::new(10, 0, 0, 0),
                subnet_mask: Ipv4Addr::new(255, 0, 0, 0),
                next_hop: Ipv4Addr::new(192, 0, 2, 1),
            }],
        );
        assert_eq!(
            parse_packet(&buf, b"OTHERPASSWORD123"),
            Err(RejectReason::AuthenticationFailed)
        );
    }

    #[test]
    fn parses_authenticated_entries() {
        let password = *b"TESTPASSWORD1234";
        let expected = RipResponse {
            ipaddr: Ipv4Addr::new(10, 1, 0, 0),
            subnet_mask: Ipv4Addr::new(255, 255, 0, 0),
            next_hop: Ipv4Addr::new(192, 0, 2, 1),
        };
        let buf = encode_test_packet(&password, std::slice::from_ref(&expected));

        let parsed = parse_packet(&buf, &password).unwrap();
        assert_eq!(parsed, vec![expected]);
    }

    #[test]
    fn rejects_zero_next_hop() {
        let password = *b"TESTPASSWORD1234";
        let entry = RipResponse {
            ipaddr: Ipv4Addr::new(10, 1, 0, 0),
            subnet_mask: Ipv4Addr::new(255, 255, 0, 0),
            next_hop: Ipv4Addr::UNSPECIFIED,
        };
        let buf = encode_test_packet(&password, std::slice::from_ref(&entry));

        assert_eq!(parse_packet(&buf, &password), Err(RejectReason::ZeroNextHop));
    }
}
