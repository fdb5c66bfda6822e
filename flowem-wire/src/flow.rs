use std::{cmp::Ordering, fmt, str::FromStr};

use bytes::{Buf, BufMut};
use pnet::util::MacAddr;

use crate::DecodeError;

/// The offset added to destination node IDs to compute class handle minor numbers.
///
/// For node ID `N`, the minor is `ID_OFFSET + N`. This keeps class 1:1 reserved as the
/// default (unshaped) class.
pub const ID_OFFSET: u32 = 10;

/// Compute the class handle for links towards a destination node.
///
/// # Handle Format
///
/// Returns `1:(10 + node_id)` as a 32-bit handle, major and minor being 16 bits each.
///
/// ```
/// use flowem_wire::link_class_handle;
/// assert_eq!(link_class_handle(7), 0x0001_0011); // 1:17
/// ```
pub fn link_class_handle(dest_node_id: u32) -> u32 {
    let minor = ID_OFFSET.wrapping_add(dest_node_id) & 0xFFFF;
    (1 << 16) | minor
}

/// Parses a colon-separated hardware address, e.g. `aa:bb:cc:dd:ee:ff`.
pub fn parse_mac(s: &str) -> Result<MacAddr, DecodeError> {
    MacAddr::from_str(s.trim()).map_err(|_| DecodeError::InvalidMac(s.to_string()))
}

#[inline]
fn octets(mac: MacAddr) -> [u8; 6] {
    let MacAddr(a, b, c, d, e, f) = mac;
    [a, b, c, d, e, f]
}

/// Identifies one shaped flow: the interface it leaves through and its source hardware
/// address.
///
/// # Encoding
///
/// 10 bytes, packed: the interface index as a native-endian `u32`, followed by the six
/// address octets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Index of the egress interface.
    pub if_index: u32,
    /// Source hardware address of the flow.
    pub source: MacAddr,
}

impl FlowKey {
    /// Length of the encoded key in bytes.
    pub const LEN: usize = 10;

    pub fn new(if_index: u32, source: MacAddr) -> Self {
        Self { if_index, source }
    }

    /// Returns the source address octets.
    #[inline]
    pub fn source_octets(&self) -> [u8; 6] {
        octets(self.source)
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        dst.put_u32_ne(self.if_index);
        dst.put_slice(&self.source_octets());
    }

    pub fn decode<B: Buf>(src: &mut B) -> Result<Self, DecodeError> {
        if src.remaining() < Self::LEN {
            return Err(DecodeError::Truncated { expected: Self::LEN, actual: src.remaining() });
        }

        let if_index = src.get_u32_ne();
        let mut mac = [0u8; 6];
        src.copy_to_slice(&mut mac);

        Ok(Self { if_index, source: MacAddr::new(mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]) })
    }
}

impl PartialOrd for FlowKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FlowKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.if_index
            .cmp(&other.if_index)
            .then_with(|| self.source_octets().cmp(&other.source_octets()))
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.if_index, self.source)
    }
}

/// Enforcement parameters bound to a [`FlowKey`].
///
/// A `rate_bps` of zero is a sentinel for "no rate limiting": packets pass with only the
/// fixed `delay_ms` applied. It never means "blocked".
///
/// # Encoding
///
/// 12 bytes: `handle`, `rate_bps` and `delay_ms` as native-endian `u32`s. The loss fraction
/// is not part of the stored layout and decodes as `0.0`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ShapingEntry {
    /// Class handle the flow is accounted under.
    pub handle: u32,
    /// Rate cap in bits per second, `0` for unlimited.
    pub rate_bps: u32,
    /// Fixed added latency in milliseconds.
    pub delay_ms: u32,
    /// Independent per-packet drop probability in `[0, 1]`.
    pub loss: f64,
}

impl ShapingEntry {
    /// Length of the encoded entry in bytes.
    pub const LEN: usize = 12;

    pub fn new(handle: u32, rate_bps: u32, delay_ms: u32) -> Self {
        Self { handle, rate_bps, delay_ms, loss: 0.0 }
    }

    /// Sets the loss fraction, clamped to `[0, 1]`.
    pub fn with_loss(mut self, loss: f64) -> Self {
        self.loss = if loss.is_nan() { 0.0 } else { loss.clamp(0.0, 1.0) };
        self
    }

    /// Returns `true` if packets of this flow are rate limited.
    #[inline]
    pub fn is_rate_limited(&self) -> bool {
        self.rate_bps != 0
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        dst.put_u32_ne(self.handle);
        dst.put_u32_ne(self.rate_bps);
        dst.put_u32_ne(self.delay_ms);
    }

    pub fn decode<B: Buf>(src: &mut B) -> Result<Self, DecodeError> {
        if src.remaining() < Self::LEN {
            return Err(DecodeError::Truncated { expected: Self::LEN, actual: src.remaining() });
        }

        Ok(Self::new(src.get_u32_ne(), src.get_u32_ne(), src.get_u32_ne()))
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    #[test]
    fn flow_key_layout() {
        let key = FlowKey::new(3, parse_mac("aa:bb:cc:dd:ee:ff").unwrap());

        let mut buf = BytesMut::new();
        key.encode(&mut buf);

        assert_eq!(buf.len(), FlowKey::LEN);
        assert_eq!(&buf[..4], &3u32.to_ne_bytes());
        assert_eq!(&buf[4..], &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(FlowKey::decode(&mut buf.freeze()).unwrap(), key);
    }

    #[test]
    fn short_buffers_are_rejected() {
        let mut short = &[0u8; 9][..];
        assert!(matches!(
            FlowKey::decode(&mut short),
            Err(DecodeError::Truncated { expected: 10, actual: 9 })
        ));

        let mut short = &[0u8; 11][..];
        assert!(ShapingEntry::decode(&mut short).is_err());
    }

    #[test]
    fn entry_layout_drops_loss() {
        let entry = ShapingEntry::new(0x0001_0011, 10_000_000, 20).with_loss(0.05);

        let mut buf = BytesMut::new();
        entry.encode(&mut buf);
        assert_eq!(buf.len(), ShapingEntry::LEN);

        let decoded = ShapingEntry::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, ShapingEntry::new(0x0001_0011, 10_000_000, 20));
        assert_eq!(decoded.loss, 0.0);
    }

    #[test]
    fn loss_is_clamped() {
        assert_eq!(ShapingEntry::default().with_loss(1.5).loss, 1.0);
        assert_eq!(ShapingEntry::default().with_loss(-0.1).loss, 0.0);
        assert_eq!(ShapingEntry::default().with_loss(f64::NAN).loss, 0.0);
    }

    #[test]
    fn keys_order_by_interface_then_address() {
        let a = FlowKey::new(1, parse_mac("ff:00:00:00:00:00").unwrap());
        let b = FlowKey::new(2, parse_mac("00:00:00:00:00:01").unwrap());
        let c = FlowKey::new(2, parse_mac("00:00:00:00:00:02").unwrap());

        let mut keys = vec![c, a, b];
        keys.sort();
        assert_eq!(keys, vec![a, b, c]);
    }

    #[test]
    fn invalid_mac() {
        assert!(matches!(parse_mac("aa:bb:cc"), Err(DecodeError::InvalidMac(_))));
        assert!(parse_mac(" 00:11:22:33:44:55 ").is_ok());
    }
}
