use std::net::Ipv4Addr;

use ampr_ripd::rip::{parse_packet, RipResponse};

const PASSWORD: &[u8; 16] = b"TESTPASSWORD1234";

fn encode(entries: &[RipResponse]) -> Vec<u8> {
    let mut buf = vec![2u8, 2, 0, 0];

    buf.extend_from_slice(&0xFFFFu16.to_be_bytes());
    buf.extend_from_slice(&2u16.to_be_bytes());
    buf.extend_from_slice(PASSWORD);

    for entry in entries {
        buf.extend_from_slice(&2u16.to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&entry.ipaddr.octets());
        buf.extend_from_slice(&[0, 0, 0, 0]);
        buf.extend_from_slice(&entry.subnet_mask.octets());
        buf.extend_from_slice(&entry.next_hop.octets());
    }

    buf
}

#[test]
fn parses_a_two_entry_authenticated_response() {
    let entries = [
        RipResponse {
            ipaddr: Ipv4Addr::new(44, 1, 0, 0),
            subnet_mask: Ipv4Addr::new(255, 255, 0, 0),
            next_hop: Ipv4Addr::new(203, 0, 113, 5),
        },
        RipResponse {
            ipaddr: Ipv4Addr::new(44, 2, 0, 0),
            subnet_mask: Ipv4Addr::new(255, 255, 0, 0),
            next_hop: Ipv4Addr::new(203, 0, 113, 5),
        },
    ];
    let buf = encode(&entries);

    let parsed = parse_packet(&buf, PASSWORD).unwrap();

    assert_eq!(parsed, entries);
}

#[test]
fn a_command_other_than_response_is_rejected() {
    let mut buf = vec![1u8, 2, 0, 0];
    buf.extend_from_slice(&0xFFFFu16.to_be_bytes());
    buf.extend_from_slice(&2u16.to_be_bytes());
    buf.extend_from_slice(PASSWORD);

    assert!(parse_packet(&buf, PASSWORD).is_err());
}

#[test]
fn a_truncated_entry_is_rejected() {
    let mut buf = vec![2u8, 2, 0, 0];
    buf.extend_from_slice(&0xFFFFu16.to_be_bytes());
    buf.extend_from_slice(&2u16.to_be_bytes());
    buf.extend_from_slice(PASSWORD);
    buf.push(0); // one stray byte, not a full entry

    assert!(parse_packet(&buf, PASSWORD).is_err());
}
