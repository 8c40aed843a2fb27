//! Version-independent header parsing and stateless wire encoders.
//!
//! Incoming datagrams are first decoded against the QUIC *invariants*
//! (RFC 8999): header form, version, and the two connection IDs. That is
//! all the binding needs for routing, and it must work even for versions
//! we do not speak. Version-specific validation (Initial type, token
//! extraction) happens later, only for packets that might create a
//! connection.

use std::io;

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

use crate::coding::{self, BufExt, BufMutExt};
use crate::datapath::RecvDatagram;
use crate::shared::ConnectionId;
use crate::{MIN_INITIAL_PACKET_LENGTH, VERSION_NEGOTIATION};

pub(crate) const LONG_HEADER_FORM: u8 = 0x80;
pub(crate) const FIXED_BIT: u8 = 0x40;
pub(crate) const KEY_PHASE_BIT: u8 = 0x04;

/// Fields of one received datagram's first packet, decoded against the
/// version invariants. Scratch state carried alongside the datagram for
/// the rest of the receive pipeline.
#[derive(Debug, Clone)]
pub(crate) struct RecvPacket {
    pub first_byte: u8,
    pub is_short_header: bool,
    /// 0 for short-header packets
    pub version: u32,
    pub dst_cid: ConnectionId,
    /// Present only on long-header packets
    pub src_cid: Option<ConnectionId>,
    /// Raw key-phase bit; meaningful for short headers only. Header
    /// protection has not been removed, so this is an approximation, which
    /// is all a stateless reset needs.
    pub key_phase: bool,
    /// Set once a Retry token carried by this packet has been validated
    pub valid_token: bool,
}

impl RecvPacket {
    /// Decode the invariant header. `short_cid_len` is the length of
    /// locally-issued connection IDs, used to delimit the destination CID
    /// of short-header packets (zero on exclusive bindings). Long headers
    /// carry both CIDs length-prefixed, the form `ConnectionId`'s codec
    /// speaks.
    pub fn decode_invariant(
        buf: &[u8],
        short_cid_len: usize,
    ) -> Result<Self, PacketDecodeError> {
        let mut r = io::Cursor::new(buf);
        let first = r.get::<u8>()?;
        if first & LONG_HEADER_FORM == 0 {
            let dst_cid = ConnectionId::from_buf(&mut r, short_cid_len)?;
            Ok(Self {
                first_byte: first,
                is_short_header: true,
                version: 0,
                dst_cid,
                src_cid: None,
                key_phase: first & KEY_PHASE_BIT != 0,
                valid_token: false,
            })
        } else {
            let version = r.get::<u32>()?;
            let dst_cid = r.get::<ConnectionId>()?;
            let src_cid = r.get::<ConnectionId>()?;
            Ok(Self {
                first_byte: first,
                is_short_header: false,
                version,
                dst_cid,
                src_cid: Some(src_cid),
                key_phase: false,
                valid_token: false,
            })
        }
    }

    /// Handshake packets are the only ones that can create a connection;
    /// anything long-header qualifies for subchain front-insertion.
    pub fn is_handshake(&self) -> bool {
        !self.is_short_header
    }

    pub fn long_header_type(&self) -> Result<LongHeaderType, PacketDecodeError> {
        debug_assert!(!self.is_short_header);
        LongHeaderType::from_byte(self.first_byte)
    }
}

/// One received datagram together with its decoded first-packet fields
#[derive(Debug)]
pub(crate) struct ParsedDatagram {
    pub datagram: RecvDatagram,
    pub packet: RecvPacket,
}

/// Validate the version-specific remainder of a v1-family Initial long
/// header and extract the Retry token. Servers additionally require the
/// carrying datagram to meet the minimum Initial size.
pub(crate) fn validate_long_header_v1(
    packet: &RecvPacket,
    buf: &[u8],
    is_server: bool,
) -> Result<Bytes, PacketDecodeError> {
    debug_assert!(!packet.is_short_header);
    let ty = packet.long_header_type()?;
    if ty != LongHeaderType::Initial {
        return Err(PacketDecodeError::InvalidHeader("not an initial packet"));
    }
    if is_server && buf.len() < MIN_INITIAL_PACKET_LENGTH {
        return Err(PacketDecodeError::InvalidHeader("initial packet too small"));
    }
    let mut r = io::Cursor::new(buf);
    // Skip past the invariant fields already decoded.
    r.advance(1 + 4);
    let dcil = r.get::<u8>()? as usize;
    r.advance(dcil.min(r.remaining()));
    let scil = r.get::<u8>()? as usize;
    r.advance(scil.min(r.remaining()));
    let token_len = r.get_var()? as usize;
    if r.remaining() < token_len {
        return Err(PacketDecodeError::InvalidHeader(
            "token longer than packet",
        ));
    }
    let start = r.position() as usize;
    let token = Bytes::copy_from_slice(&buf[start..start + token_len]);
    r.advance(token_len);
    // The payload length must fit in what remains of the datagram.
    let payload_len = r.get_var()? as usize;
    if r.remaining() < payload_len {
        return Err(PacketDecodeError::InvalidHeader(
            "payload length longer than packet",
        ));
    }
    Ok(token)
}

/// Long packet type including non-uniform cases
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum LongHeaderType {
    Initial,
    Retry,
    ZeroRtt,
    Handshake,
}

impl LongHeaderType {
    pub fn from_byte(b: u8) -> Result<Self, PacketDecodeError> {
        use self::LongHeaderType::*;
        if b & FIXED_BIT == 0 {
            return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
        }
        debug_assert!(b & LONG_HEADER_FORM != 0, "not a long packet");
        Ok(match (b & 0x30) >> 4 {
            0x0 => Initial,
            0x1 => ZeroRtt,
            0x2 => Handshake,
            0x3 => Retry,
            _ => unreachable!(),
        })
    }
}

impl From<LongHeaderType> for u8 {
    fn from(ty: LongHeaderType) -> u8 {
        use self::LongHeaderType::*;
        match ty {
            Initial => LONG_HEADER_FORM | FIXED_BIT,
            ZeroRtt => LONG_HEADER_FORM | FIXED_BIT | (0x1 << 4),
            Handshake => LONG_HEADER_FORM | FIXED_BIT | (0x2 << 4),
            Retry => LONG_HEADER_FORM | FIXED_BIT | (0x3 << 4),
        }
    }
}

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub(crate) enum PacketDecodeError {
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),
}

impl From<coding::UnexpectedEnd> for PacketDecodeError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        Self::InvalidHeader("unexpected end of packet")
    }
}

/// Encode a Version Negotiation packet in response to `packet`.
///
/// The echoed connection IDs are swapped relative to the incoming packet,
/// the version field is the negotiation sentinel, and the advertised list
/// leads with a randomly chosen reserved version to keep peers honest about
/// ignoring unknown entries.
pub(crate) fn encode_version_negotiation(
    packet: &RecvPacket,
    random_bits: u8,
    random_reserved_version: u32,
    supported: &[u32],
) -> Vec<u8> {
    let src_cid = *packet.src_cid.as_ref().expect("long header required");
    let mut buf =
        Vec::with_capacity(7 + src_cid.len() + packet.dst_cid.len() + 4 * (1 + supported.len()));
    buf.write(LONG_HEADER_FORM | (random_bits & 0x7f));
    buf.write(VERSION_NEGOTIATION);
    // The echoed CIDs swap roles: our destination is their source.
    buf.write(src_cid);
    buf.write(packet.dst_cid);
    buf.put_u32_le(random_reserved_version);
    for &version in supported {
        buf.put_u32_le(version);
    }
    buf
}

/// Encode a Retry packet with the original destination CID carried as an
/// explicit integrity field.
pub(crate) fn encode_retry_v1(
    version: u32,
    dst_cid: &ConnectionId,
    src_cid: &ConnectionId,
    orig_dst_cid: &ConnectionId,
    token: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(
        8 + dst_cid.len() + src_cid.len() + orig_dst_cid.len() + token.len(),
    );
    buf.write(u8::from(LongHeaderType::Retry));
    buf.write(version);
    buf.write(*dst_cid);
    buf.write(*src_cid);
    buf.write(*orig_dst_cid);
    buf.put_slice(token);
    buf
}
