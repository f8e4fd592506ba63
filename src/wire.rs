//! Wire codec for the three message families.
//!
//! Every message starts with a one-byte protocol version and the 8-byte
//! transfer hash id. Control messages follow with a one-byte opcode, data
//! messages with the 8-byte little-endian stream offset. All multi-byte
//! integers on the wire are little-endian.

use std::fmt::{Debug, Display, Formatter};

use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::error::{Error, Result};
use crate::nak_regions::Region;

pub const PROTOCOL_VERSION: u8 = 1;
pub const HASH_SIZE: usize = 8;

/// version | hash id | opcode
pub const CONTROL_PREFIX_SIZE: usize = 1 + HASH_SIZE + 1;
/// version | hash id | offset (u64 LE)
pub const DATA_PREFIX_SIZE: usize = 1 + HASH_SIZE + 8;

/// Longest possible varuint64 encoding.
const MAX_VARINT_LEN: usize = 10;

/// The 8-byte non-cryptographic fingerprint identifying one transfer. Tags
/// every wire message so concurrent transfers on one multicast group can be
/// told apart.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashId([u8; HASH_SIZE]);

impl HashId {
    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> HashId {
        HashId(bytes)
    }

    pub fn from_raw(raw: u64) -> HashId {
        HashId(raw.to_le_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Parse the 16-hex-digit form accepted on the command line.
    pub fn from_hex(s: &str) -> Result<HashId> {
        if s.len() != 2 * HASH_SIZE || !s.is_ascii() {
            return Err(Error::BadMetadata);
        }
        let mut bytes = [0u8; HASH_SIZE];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = u8::from_str_radix(&s[2 * i..2 * i + 2], 16).map_err(|_| Error::BadMetadata)?;
        }
        Ok(HashId(bytes))
    }
}

impl Display for HashId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}
impl Debug for HashId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// Control messages from the sender to receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientBound {
    Announce,
    MetadataHeader { section_count: u16 },
    MetadataSection { index: u16, payload: Vec<u8> },
}

const OP_ANNOUNCE: u8 = 0;
const OP_RESPOND_METADATA_HEADER: u8 = 1;
const OP_RESPOND_METADATA_SECTION: u8 = 2;
/// Reserved - data flows on the data channel instead.
const OP_DELIVER_DATA_SECTION: u8 = 3;

const OP_REQUEST_METADATA_HEADER: u8 = 0;
const OP_REQUEST_METADATA_SECTION: u8 = 1;
const OP_ACK_DATA_SECTION: u8 = 2;

impl ClientBound {
    pub fn ser(&self, hash_id: HashId, buf: &mut BytesMut) {
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_slice(hash_id.as_bytes());
        match self {
            ClientBound::Announce => {
                buf.put_u8(OP_ANNOUNCE);
            }
            ClientBound::MetadataHeader { section_count } => {
                buf.put_u8(OP_RESPOND_METADATA_HEADER);
                buf.put_u16_le(*section_count);
            }
            ClientBound::MetadataSection { index, payload } => {
                buf.put_u8(OP_RESPOND_METADATA_SECTION);
                buf.put_u16_le(*index);
                buf.put_slice(payload);
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> Result<(HashId, ClientBound)> {
        let (hash_id, op) = deser_control_prefix(buf)?;

        let msg = match op {
            OP_ANNOUNCE => ClientBound::Announce,
            OP_RESPOND_METADATA_HEADER => {
                if buf.remaining() < 2 {
                    return Err(Error::MessageTooShort);
                }
                ClientBound::MetadataHeader {
                    section_count: buf.get_u16_le(),
                }
            }
            OP_RESPOND_METADATA_SECTION => {
                if buf.remaining() < 2 {
                    return Err(Error::MessageTooShort);
                }
                let index = buf.get_u16_le();
                let mut payload = vec![0u8; buf.remaining()];
                buf.copy_to_slice(&mut payload);
                ClientBound::MetadataSection { index, payload }
            }
            op @ OP_DELIVER_DATA_SECTION => return Err(Error::UnknownOpcode(op)),
            op => return Err(Error::UnknownOpcode(op)),
        };
        Ok((hash_id, msg))
    }
}

/// Control messages from receivers to the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerBound {
    RequestMetadataHeader,
    RequestMetadataSection { index: u16 },
    AckDataSection(AckDataSection),
}

impl ServerBound {
    pub fn ser(&self, hash_id: HashId, buf: &mut BytesMut) {
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_slice(hash_id.as_bytes());
        match self {
            ServerBound::RequestMetadataHeader => {
                buf.put_u8(OP_REQUEST_METADATA_HEADER);
            }
            ServerBound::RequestMetadataSection { index } => {
                buf.put_u8(OP_REQUEST_METADATA_SECTION);
                buf.put_u16_le(*index);
            }
            ServerBound::AckDataSection(ack) => {
                buf.put_u8(OP_ACK_DATA_SECTION);
                ack.ser(buf);
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> Result<(HashId, ServerBound)> {
        let (hash_id, op) = deser_control_prefix(buf)?;

        let msg = match op {
            OP_REQUEST_METADATA_HEADER => ServerBound::RequestMetadataHeader,
            OP_REQUEST_METADATA_SECTION => {
                if buf.remaining() < 2 {
                    return Err(Error::MessageTooShort);
                }
                ServerBound::RequestMetadataSection {
                    index: buf.get_u16_le(),
                }
            }
            OP_ACK_DATA_SECTION => ServerBound::AckDataSection(AckDataSection::deser(buf)?),
            op => return Err(Error::UnknownOpcode(op)),
        };
        Ok((hash_id, msg))
    }
}

fn deser_control_prefix(buf: &mut impl Buf) -> Result<(HashId, u8)> {
    if buf.remaining() < CONTROL_PREFIX_SIZE {
        return Err(Error::MessageTooShort);
    }
    let version = buf.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(Error::WrongProtocolVersion(version));
    }
    let mut hash = [0u8; HASH_SIZE];
    buf.copy_to_slice(&mut hash);
    Ok((HashId(hash), buf.get_u8()))
}

/// The receiver's per-datagram feedback: the most recently written contiguous
/// region plus as much of the receiver's NAK list as fits the datagram.
///
/// The 16-byte `last_ack` header is informational; the sender merges only the
/// NAK pair list into its interval set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckDataSection {
    pub last_ack: Region,
    pub naks: Vec<Region>,
}

impl AckDataSection {
    /// Build the feedback message for a receiver whose NAK list is `naks`
    /// (in set order). NAK pairs are emitted starting with the ranges at or
    /// after `last_ack.end_ex`, wrapping around to earlier ones, until less
    /// than two max-length varuints of `max_message_size` budget remain.
    pub fn for_receiver(last_ack: Region, naks: &[Region], max_message_size: usize) -> AckDataSection {
        let budget = max_message_size.saturating_sub(CONTROL_PREFIX_SIZE + 16);
        let mut used = 0;
        let mut out = Vec::new();

        let (earlier, at_or_after): (Vec<&Region>, Vec<&Region>) =
            naks.iter().partition(|k| k.end_ex < last_ack.end_ex);

        for k in at_or_after.iter().chain(earlier.iter()) {
            if budget - used < 2 * MAX_VARINT_LEN {
                break;
            }
            used += varint_len(k.start as u64) + varint_len(k.end_ex as u64);
            out.push(**k);
        }

        AckDataSection {
            last_ack,
            naks: out,
        }
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.last_ack.start as u64);
        buf.put_u64_le(self.last_ack.end_ex as u64);
        for k in &self.naks {
            buf.put_u64_varint(k.start as u64);
            buf.put_u64_varint(k.end_ex as u64);
        }
    }

    fn deser(buf: &mut impl Buf) -> Result<AckDataSection> {
        if buf.remaining() < 16 {
            return Err(Error::MessageTooShort);
        }
        let last_ack = Region::new(buf.get_u64_le() as i64, buf.get_u64_le() as i64);

        let mut naks = Vec::new();
        while buf.has_remaining() {
            // a truncated trailing pair ends the list, not the message
            let Ok(start) = buf.try_get_u64_varint() else {
                break;
            };
            let Ok(end_ex) = buf.try_get_u64_varint() else {
                break;
            };
            naks.push(Region::new(start as i64, end_ex as i64));
        }
        Ok(AckDataSection { last_ack, naks })
    }
}

fn varint_len(mut v: u64) -> usize {
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

/// One datagram's worth of stream bytes at `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSection {
    pub offset: i64,
    pub payload: Vec<u8>,
}

impl DataSection {
    pub fn ser_into(hash_id: HashId, offset: i64, payload: &[u8], buf: &mut BytesMut) {
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_slice(hash_id.as_bytes());
        buf.put_u64_le(offset as u64);
        buf.put_slice(payload);
    }

    pub fn ser(&self, hash_id: HashId, buf: &mut BytesMut) {
        Self::ser_into(hash_id, self.offset, &self.payload, buf);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<(HashId, DataSection)> {
        if buf.remaining() < DATA_PREFIX_SIZE {
            return Err(Error::MessageTooShort);
        }
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(Error::WrongProtocolVersion(version));
        }
        let mut hash = [0u8; HASH_SIZE];
        buf.copy_to_slice(&mut hash);
        let offset = buf.get_u64_le() as i64;

        let mut payload = vec![0u8; buf.remaining()];
        buf.copy_to_slice(&mut payload);

        Ok((HashId(hash), DataSection { offset, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn hash() -> HashId {
        HashId::from_bytes([1, 2, 3, 4, 5, 6, 7, 8])
    }

    #[rstest]
    #[case::announce(ClientBound::Announce)]
    #[case::header(ClientBound::MetadataHeader { section_count: 0 })]
    #[case::header_many(ClientBound::MetadataHeader { section_count: 513 })]
    #[case::section_empty(ClientBound::MetadataSection { index: 0, payload: vec![] })]
    #[case::section(ClientBound::MetadataSection { index: 7, payload: vec![1, 2, 3, 4] })]
    fn test_client_bound_round_trip(#[case] msg: ClientBound) {
        let mut buf = BytesMut::new();
        msg.ser(hash(), &mut buf);

        let mut b: &[u8] = &buf;
        let (hash_id, deser) = ClientBound::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(hash_id, hash());
        assert_eq!(deser, msg);
    }

    #[rstest]
    #[case::req_header(ServerBound::RequestMetadataHeader)]
    #[case::req_section(ServerBound::RequestMetadataSection { index: 3 })]
    #[case::ack_empty(ServerBound::AckDataSection(AckDataSection {
        last_ack: Region::new(0, 0),
        naks: vec![],
    }))]
    #[case::ack(ServerBound::AckDataSection(AckDataSection {
        last_ack: Region::new(100, 200),
        naks: vec![Region::new(0, 100), Region::new(200, 123_456_789)],
    }))]
    fn test_server_bound_round_trip(#[case] msg: ServerBound) {
        let mut buf = BytesMut::new();
        msg.ser(hash(), &mut buf);

        let mut b: &[u8] = &buf;
        let (hash_id, deser) = ServerBound::deser(&mut b).unwrap();
        assert_eq!(hash_id, hash());
        assert_eq!(deser, msg);
    }

    #[rstest]
    #[case::empty(DataSection { offset: 0, payload: vec![] })]
    #[case::payload(DataSection { offset: 99_999_999_999, payload: b"hello".to_vec() })]
    fn test_data_round_trip(#[case] msg: DataSection) {
        let mut buf = BytesMut::new();
        msg.ser(hash(), &mut buf);

        let mut b: &[u8] = &buf;
        let (hash_id, deser) = DataSection::deser(&mut b).unwrap();
        assert_eq!(hash_id, hash());
        assert_eq!(deser, msg);
    }

    #[test]
    fn test_too_short() {
        let mut buf = BytesMut::new();
        ClientBound::Announce.ser(hash(), &mut buf);
        for n in 0..CONTROL_PREFIX_SIZE {
            let mut b = &buf[..n];
            assert!(
                matches!(ClientBound::deser(&mut b), Err(Error::MessageTooShort)),
                "length {} should be too short",
                n
            );
        }

        let mut buf = BytesMut::new();
        DataSection { offset: 0, payload: vec![] }.ser(hash(), &mut buf);
        for n in 0..DATA_PREFIX_SIZE {
            let mut b = &buf[..n];
            assert!(matches!(DataSection::deser(&mut b), Err(Error::MessageTooShort)));
        }
    }

    #[rstest]
    #[case(0)]
    #[case(2)]
    #[case(255)]
    fn test_wrong_version(#[case] version: u8) {
        let mut buf = BytesMut::new();
        ServerBound::RequestMetadataHeader.ser(hash(), &mut buf);
        buf[0] = version;

        let mut b: &[u8] = &buf;
        assert!(matches!(
            ServerBound::deser(&mut b),
            Err(Error::WrongProtocolVersion(v)) if v == version
        ));
    }

    #[test]
    fn test_reserved_opcode_rejected() {
        let mut buf = BytesMut::new();
        ClientBound::Announce.ser(hash(), &mut buf);
        buf[CONTROL_PREFIX_SIZE - 1] = OP_DELIVER_DATA_SECTION;

        let mut b: &[u8] = &buf;
        assert!(matches!(
            ClientBound::deser(&mut b),
            Err(Error::UnknownOpcode(OP_DELIVER_DATA_SECTION))
        ));
    }

    #[test]
    fn test_ack_list_wraps_at_last_ack() {
        let naks = vec![
            Region::new(0, 5),
            Region::new(10, 15),
            Region::new(20, 25),
        ];
        let ack = AckDataSection::for_receiver(Region::new(11, 12), &naks, 65000);

        // ranges ending at or after the last ack come first, then the wrap
        assert_eq!(
            ack.naks,
            vec![
                Region::new(10, 15),
                Region::new(20, 25),
                Region::new(0, 5),
            ]
        );
    }

    #[test]
    fn test_ack_list_respects_budget() {
        let naks: Vec<Region> = (0..100).map(|i| Region::new(i * 10, i * 10 + 5)).collect();

        // prefix + 16-byte header + room for exactly three worst-case pairs
        let max = CONTROL_PREFIX_SIZE + 16 + 3 * 2 * 10;
        let ack = AckDataSection::for_receiver(Region::new(0, 0), &naks, max);
        assert_eq!(ack.naks.len(), 3);
        assert_eq!(ack.naks[0], Region::new(0, 5));
    }

    #[test]
    fn test_ack_truncated_trailing_pair() {
        let msg = ServerBound::AckDataSection(AckDataSection {
            last_ack: Region::new(0, 8),
            naks: vec![Region::new(300, 400), Region::new(500, 600)],
        });
        let mut buf = BytesMut::new();
        msg.ser(hash(), &mut buf);

        // chop mid-way through the last varint pair
        let mut b = &buf[..buf.len() - 1];
        let (_, deser) = ServerBound::deser(&mut b).unwrap();
        let ServerBound::AckDataSection(ack) = deser else {
            panic!("wrong message kind");
        };
        assert_eq!(ack.naks, vec![Region::new(300, 400)]);
    }

    #[rstest]
    #[case("0102030405060708", Ok([1, 2, 3, 4, 5, 6, 7, 8]))]
    #[case("ffffffffffffffff", Ok([255; 8]))]
    #[case("0102", Err(()))]
    #[case("010203040506070x", Err(()))]
    fn test_hash_id_hex(#[case] s: &str, #[case] expected: std::result::Result<[u8; 8], ()>) {
        match expected {
            Ok(bytes) => {
                let id = HashId::from_hex(s).unwrap();
                assert_eq!(id.as_bytes(), &bytes);
                assert_eq!(id.to_string(), s);
            }
            Err(()) => assert!(HashId::from_hex(s).is_err()),
        }
    }
}
