//! Identifiers shared between the binding, the lookup tables, and the wire.

use std::fmt;

use bytes::{Buf, BufMut};
use rand::Rng;

use crate::coding::{self, Codec, Hex};
use crate::{MAX_CID_SIZE, STATELESS_RESET_TOKEN_LENGTH};

/// Protocol-level identifier for a connection, 0-20 opaque bytes.
///
/// Stored inline with the unused tail zeroed, so the derived equality and
/// hashing that key the hot lookup tables see a canonical value. Long
/// headers carry CIDs in length-prefixed form, which is what the [`Codec`]
/// impl speaks; short headers carry the bytes bare, read with
/// [`ConnectionId::from_buf`] at the length this endpoint issues.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    pub fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= MAX_CID_SIZE);
        let mut cid = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        cid.bytes[..bytes.len()].copy_from_slice(bytes);
        cid
    }

    pub fn random<R: Rng>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut cid = Self {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        rng.fill_bytes(&mut cid.bytes[..len]);
        cid
    }

    /// Read a bare (not length-prefixed) CID of `len` bytes from the
    /// buffer
    pub(crate) fn from_buf<B: Buf>(buf: &mut B, len: usize) -> coding::Result<Self> {
        if len > MAX_CID_SIZE || buf.remaining() < len {
            return Err(coding::UnexpectedEnd);
        }
        let mut cid = Self {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        buf.copy_to_slice(&mut cid.bytes[..len]);
        Ok(cid)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }
}

impl Codec for ConnectionId {
    /// Length-prefixed form, as carried by long headers
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        let len = u8::decode(buf)? as usize;
        Self::from_buf(buf, len)
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.len);
        buf.put_slice(self);
    }
}

impl std::ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", Hex(self))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Hex(self).fmt(f)
    }
}

/// Stateless reset token: the trailing 16 bytes of a stateless reset
/// packet, which the endpoint that issued the connection ID can recognize
/// as its own.
///
/// Always derived by truncating a keyed-hash output; see
/// [`ResetToken::from_hash`].
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ResetToken([u8; STATELESS_RESET_TOKEN_LENGTH]);

impl ResetToken {
    /// Truncate a keyed-hash output into a token. The hash must be at
    /// least token sized, which the binding asserts statically.
    pub(crate) fn from_hash(output: &[u8]) -> Self {
        debug_assert!(output.len() >= STATELESS_RESET_TOKEN_LENGTH);
        let mut token = [0u8; STATELESS_RESET_TOKEN_LENGTH];
        token.copy_from_slice(&output[..STATELESS_RESET_TOKEN_LENGTH]);
        Self(token)
    }

    pub fn as_bytes(&self) -> &[u8; STATELESS_RESET_TOKEN_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for ResetToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResetToken({})", Hex(&self.0))
    }
}

impl fmt::Display for ResetToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Hex(&self.0).fmt(f)
    }
}
