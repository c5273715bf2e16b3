//! Wire header for peer-format ("libudev") messages, and the netlink multicast group identity.

use std::mem;

use crate::{Error, Result};

/// Magic constant identifying peer-format messages, stored big-endian on the wire.
pub const MONITOR_MAGIC: u32 = 0xfeed_cafe;

/// Length of the ASCII prefix at the start of every peer-format message.
const PREFIX: [u8; 8] = *b"libudev\0";

/// Multicast group a [`crate::Monitor`] can join.
///
/// `none = 0`, `kernel = 1`, `peer = 2`, matching the wire/socket group identifiers.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Group {
    #[default]
    None = 0,
    Kernel = 1,
    Peer = 2,
}

impl Group {
    /// Parses a group name the way `from_group` callers pass it: `None` selects the sink group,
    /// `"kernel"` and `"peer"` (case-insensitively) select the matching multicast channel.
    pub fn from_name(name: Option<&str>) -> Result<Self> {
        match name.map(str::to_lowercase).as_deref() {
            None => Ok(Self::None),
            Some("kernel") => Ok(Self::Kernel),
            Some("peer") => Ok(Self::Peer),
            Some(other) => Err(Error::InvalidArgument(format!(
                "unknown netlink group: {other}"
            ))),
        }
    }
}

impl From<u32> for Group {
    fn from(val: u32) -> Self {
        match val {
            1 => Self::Kernel,
            2 => Self::Peer,
            _ => Self::None,
        }
    }
}

impl From<Group> for &'static str {
    fn from(val: Group) -> Self {
        match val {
            Group::None => "none",
            Group::Kernel => "kernel",
            Group::Peer => "peer",
        }
    }
}

/// Fixed-size, tightly packed wire header for peer-format messages. 40 bytes total.
///
/// Every multi-byte integer field is stored big-endian on the wire except `header_size`,
/// `properties_off`, and `properties_len`, which travel in native byte order (matching the
/// reference peer, which treats them as purely local bookkeeping never interpreted by the BPF
/// filter).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetlinkHeader {
    prefix: [u8; 8],
    magic: u32,
    header_size: u32,
    properties_off: u32,
    properties_len: u32,
    filter_subsystem_hash: u32,
    filter_devtype_hash: u32,
    filter_tag_bloom_hi: u32,
    filter_tag_bloom_lo: u32,
}

impl NetlinkHeader {
    /// Total encoded size of the header, in bytes.
    pub const SIZE: usize = mem::size_of::<Self>();

    /// `magic` field byte offset; used literally by the compiled BPF program.
    pub const MAGIC_OFFSET: u32 = 8;
    /// `filter_subsystem_hash` field byte offset.
    pub const FILTER_SUBSYSTEM_HASH_OFFSET: u32 = 24;
    /// `filter_devtype_hash` field byte offset.
    pub const FILTER_DEVTYPE_HASH_OFFSET: u32 = 28;
    /// `filter_tag_bloom_hi` field byte offset.
    pub const FILTER_TAG_BLOOM_HI_OFFSET: u32 = 32;
    /// `filter_tag_bloom_lo` field byte offset.
    pub const FILTER_TAG_BLOOM_LO_OFFSET: u32 = 36;

    /// Builds a fresh header ready to be filled in by the send path.
    pub fn new() -> Self {
        Self {
            prefix: PREFIX,
            magic: MONITOR_MAGIC.to_be(),
            header_size: Self::SIZE as u32,
            properties_off: 0,
            properties_len: 0,
            filter_subsystem_hash: 0,
            filter_devtype_hash: 0,
            filter_tag_bloom_hi: 0,
            filter_tag_bloom_lo: 0,
        }
    }

    pub fn set_properties_off(&mut self, val: u32) {
        self.properties_off = val;
    }

    pub fn set_properties_len(&mut self, val: u32) {
        self.properties_len = val;
    }

    pub fn set_filter_subsystem_hash(&mut self, hash: u32) {
        self.filter_subsystem_hash = hash.to_be();
    }

    pub fn set_filter_devtype_hash(&mut self, hash: u32) {
        self.filter_devtype_hash = hash.to_be();
    }

    pub fn set_filter_tag_bloom(&mut self, bloom: u64) {
        self.filter_tag_bloom_hi = ((bloom >> 32) as u32).to_be();
        self.filter_tag_bloom_lo = (bloom as u32).to_be();
    }

    pub const fn properties_off(&self) -> u32 {
        self.properties_off
    }

    pub const fn properties_len(&self) -> u32 {
        self.properties_len
    }

    /// Serializes the header to its 40-byte wire representation.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        // SAFETY: `NetlinkHeader` is `#[repr(C)]`, has no padding (every field is 4- or 8-byte
        // aligned and sized), and contains no interior pointers, so reinterpreting it as bytes
        // is sound.
        unsafe { mem::transmute_copy(self) }
    }

    /// Parses a peer-format header prefix out of a datagram buffer.
    ///
    /// Returns `Err` if the buffer is too short, the `prefix` bytes do not spell `"libudev\0"`,
    /// or `magic` does not match [`MONITOR_MAGIC`] once converted from big-endian. Kernel-format
    /// messages are expected to fail this parse; callers fall back to the kernel-format
    /// discriminator on error.
    pub fn try_parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::Again(format!(
                "buffer too short for netlink header: {} < {}",
                buf.len(),
                Self::SIZE
            )));
        }
        if buf[..8] != PREFIX {
            return Err(Error::Again("missing 'libudev' prefix".into()));
        }

        let mut idx = 8;
        let take = |buf: &[u8], idx: &mut usize| -> Result<u32> {
            let word = u32::from_ne_bytes(buf[*idx..*idx + 4].try_into()?);
            *idx += 4;
            Ok(word)
        };

        let magic = take(buf, &mut idx)?;
        let header_size = take(buf, &mut idx)?;
        let properties_off = take(buf, &mut idx)?;
        let properties_len = take(buf, &mut idx)?;
        let filter_subsystem_hash = take(buf, &mut idx)?;
        let filter_devtype_hash = take(buf, &mut idx)?;
        let filter_tag_bloom_hi = take(buf, &mut idx)?;
        let filter_tag_bloom_lo = take(buf, &mut idx)?;

        if u32::from_be(magic) != MONITOR_MAGIC {
            return Err(Error::Again(format!(
                "bad monitor magic: expected {MONITOR_MAGIC:#x}, have {:#x}",
                u32::from_be(magic)
            )));
        }

        Ok(Self {
            prefix: PREFIX,
            magic,
            header_size,
            properties_off,
            properties_len,
            filter_subsystem_hash,
            filter_devtype_hash,
            filter_tag_bloom_hi,
            filter_tag_bloom_lo,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_field_offsets_match_layout() {
        assert_eq!(NetlinkHeader::SIZE, 40);
        assert_eq!(NetlinkHeader::MAGIC_OFFSET, 8);
        assert_eq!(NetlinkHeader::FILTER_SUBSYSTEM_HASH_OFFSET, 24);
        assert_eq!(NetlinkHeader::FILTER_DEVTYPE_HASH_OFFSET, 28);
        assert_eq!(NetlinkHeader::FILTER_TAG_BLOOM_HI_OFFSET, 32);
        assert_eq!(NetlinkHeader::FILTER_TAG_BLOOM_LO_OFFSET, 36);
    }

    #[test]
    fn test_header_round_trip() {
        let mut hdr = NetlinkHeader::new();
        hdr.set_properties_off(NetlinkHeader::SIZE as u32);
        hdr.set_properties_len(64);
        hdr.set_filter_subsystem_hash(crate::hash32("net"));
        hdr.set_filter_tag_bloom(crate::bloom64("systemd"));

        let bytes = hdr.to_bytes();
        let parsed = NetlinkHeader::try_parse(&bytes).expect("valid header parses");

        assert_eq!(parsed, hdr);
        assert_eq!(parsed.properties_off(), NetlinkHeader::SIZE as u32);
        assert_eq!(parsed.properties_len(), 64);
    }

    #[test]
    fn test_header_rejects_bad_prefix() {
        let mut buf = [0u8; NetlinkHeader::SIZE];
        buf[..8].copy_from_slice(b"notudev\0");
        assert!(NetlinkHeader::try_parse(&buf).is_err());
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut hdr = NetlinkHeader::new();
        hdr.magic = 0u32.to_be();
        let bytes = hdr.to_bytes();
        assert!(NetlinkHeader::try_parse(&bytes).is_err());
    }

    #[test]
    fn test_header_rejects_short_buffer() {
        let buf = [0u8; 10];
        assert!(NetlinkHeader::try_parse(&buf).is_err());
    }

    #[test]
    fn test_group_from_name() {
        assert_eq!(Group::from_name(None).unwrap(), Group::None);
        assert_eq!(Group::from_name(Some("kernel")).unwrap(), Group::Kernel);
        assert_eq!(Group::from_name(Some("PEER")).unwrap(), Group::Peer);
        assert!(Group::from_name(Some("bogus")).is_err());
    }

    #[test]
    fn test_group_from_u32() {
        assert_eq!(Group::from(0), Group::None);
        assert_eq!(Group::from(1), Group::Kernel);
        assert_eq!(Group::from(2), Group::Peer);
        assert_eq!(Group::from(99), Group::None);
    }
}
