//! Explicit congestion notification marking.
//!
//! Packets that have to wait long for rate credit get the Congestion Experienced codepoint,
//! so ECN-capable senders back off before the flow starts dropping at the horizon.

use bytes::{Bytes, BytesMut};
use pnet::packet::{
    ethernet::{EtherType, EtherTypes, EthernetPacket},
    ipv4::{self, Ipv4Packet, MutableIpv4Packet},
    ipv6::{Ipv6Packet, MutableIpv6Packet},
};

/// Not ECN-capable transport.
const NOT_ECT: u8 = 0b00;
/// Congestion experienced.
const CE: u8 = 0b11;

fn codepoint(ethertype: EtherType, ip: &[u8]) -> Option<u8> {
    if ethertype == EtherTypes::Ipv4 {
        Ipv4Packet::new(ip).map(|packet| packet.get_ecn())
    } else if ethertype == EtherTypes::Ipv6 {
        Ipv6Packet::new(ip).map(|packet| packet.get_traffic_class() & CE)
    } else {
        None
    }
}

/// Sets CE on `frame` if it carries an ECN-capable IPv4 or IPv6 packet. Returns whether the
/// frame was marked; frames that are not ECN-capable or already marked are left untouched.
pub(crate) fn set_ce(frame: &mut Bytes) -> bool {
    let Some(ethertype) = EthernetPacket::new(&frame[..]).map(|eth| eth.get_ethertype()) else {
        return false;
    };
    let offset = EthernetPacket::minimum_packet_size();

    match codepoint(ethertype, &frame[offset..]) {
        Some(NOT_ECT | CE) | None => return false,
        Some(_) => {}
    }

    let mut buf = BytesMut::from(&frame[..]);
    let ip = &mut buf[offset..];

    if ethertype == EtherTypes::Ipv4 {
        let Some(mut packet) = MutableIpv4Packet::new(ip) else { return false };
        packet.set_ecn(CE);
        let checksum = ipv4::checksum(&packet.to_immutable());
        packet.set_checksum(checksum);
    } else {
        let Some(mut packet) = MutableIpv6Packet::new(ip) else { return false };
        let class = packet.get_traffic_class();
        packet.set_traffic_class(class | CE);
    }

    *frame = buf.freeze();
    true
}

#[cfg(test)]
pub(crate) mod tests {
    use pnet::{packet::ethernet::MutableEthernetPacket, util::MacAddr};

    use super::*;

    const ETH: usize = 14;

    /// An Ethernet frame carrying a minimal IPv4 header with `ecn`, with a valid checksum.
    pub(crate) fn ipv4_frame(ecn: u8, len: usize) -> Bytes {
        let mut buf = vec![0u8; len.max(ETH + 20)];
        {
            let mut eth = MutableEthernetPacket::new(&mut buf).unwrap();
            eth.set_source(MacAddr::new(0x02, 0, 0, 0, 0, 0x01));
            eth.set_ethertype(EtherTypes::Ipv4);
        }
        let total = (buf.len() - ETH) as u16;
        let mut ip = MutableIpv4Packet::new(&mut buf[ETH..]).unwrap();
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length(total);
        ip.set_ttl(64);
        ip.set_ecn(ecn);
        let checksum = ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(checksum);
        Bytes::from(buf)
    }

    fn ipv6_frame(traffic_class: u8) -> Bytes {
        let mut buf = vec![0u8; ETH + 40];
        MutableEthernetPacket::new(&mut buf).unwrap().set_ethertype(EtherTypes::Ipv6);
        let mut ip = MutableIpv6Packet::new(&mut buf[ETH..]).unwrap();
        ip.set_version(6);
        ip.set_traffic_class(traffic_class);
        Bytes::from(buf)
    }

    fn ipv4(frame: &Bytes) -> Ipv4Packet<'_> {
        Ipv4Packet::new(&frame[ETH..]).unwrap()
    }

    #[test]
    fn marks_ect_ipv4_and_fixes_the_checksum() {
        let mut frame = ipv4_frame(0b10, 100);
        assert!(set_ce(&mut frame));

        let packet = ipv4(&frame);
        assert_eq!(packet.get_ecn(), CE);
        assert_eq!(packet.get_checksum(), ipv4::checksum(&packet));
    }

    #[test]
    fn leaves_non_ect_and_marked_packets_alone() {
        for ecn in [NOT_ECT, CE] {
            let original = ipv4_frame(ecn, 100);
            let mut frame = original.clone();
            assert!(!set_ce(&mut frame));
            assert_eq!(frame, original);
        }

        let mut arp = ipv4_frame(0b10, 100).to_vec();
        MutableEthernetPacket::new(&mut arp).unwrap().set_ethertype(EtherTypes::Arp);
        let mut arp = Bytes::from(arp);
        assert!(!set_ce(&mut arp));
    }

    #[test]
    fn marks_ect_ipv6_keeping_dscp() {
        let mut frame = ipv6_frame(0b1011_1001);
        assert!(set_ce(&mut frame));

        let packet = Ipv6Packet::new(&frame[ETH..]).unwrap();
        assert_eq!(packet.get_traffic_class(), 0b1011_1011);
    }

    #[test]
    fn truncated_packets_are_not_marked() {
        let mut frame = ipv4_frame(0b10, 100).slice(..ETH + 8);
        assert!(!set_ce(&mut frame));
    }
}
