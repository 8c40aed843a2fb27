//! Retry token sealing and validation.
//!
//! The token a Retry packet hands to the client proves return routability
//! when it comes back on the next Initial. Its timestamp travels in the
//! clear but authenticated; the client's address and original destination
//! CID are encrypted so clients cannot forge or inspect them. The AEAD
//! nonce is derived from the server-chosen CID that the client must echo,
//! binding the token to that CID without storing any per-client state.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use ring::aead;

use crate::coding::{BufExt, BufMutExt};
use crate::shared::ConnectionId;
use crate::MAX_CID_SIZE;

/// Authenticated-but-plaintext prefix: issuance timestamp, unix
/// milliseconds
const AUTHENTICATED_LENGTH: usize = 8;
/// Encrypted body: 16-byte v6-mapped IP, port, original CID length, then
/// the original CID padded to its maximum size
const ENCRYPTED_LENGTH: usize = 16 + 2 + 1 + MAX_CID_SIZE;
const TAG_LENGTH: usize = 16;

/// Exact on-wire size of a Retry token; anything else is rejected before
/// decryption is attempted.
pub const RETRY_TOKEN_LENGTH: usize = AUTHENTICATED_LENGTH + ENCRYPTED_LENGTH + TAG_LENGTH;

/// Decrypted contents of a Retry token
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RetryTokenContents {
    /// Unix milliseconds at issuance; readable without the key
    pub timestamp_ms: u64,
    pub remote_address: SocketAddr,
    pub orig_dst_cid: ConnectionId,
}

impl RetryTokenContents {
    /// Seal the token under `key`, deriving the nonce from `new_cid` (the
    /// CID the Retry packet asks the client to echo).
    pub fn seal(&self, key: &aead::LessSafeKey, new_cid: &ConnectionId) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RETRY_TOKEN_LENGTH);
        buf.write(self.timestamp_ms);

        let ip = match self.remote_address.ip() {
            IpAddr::V4(x) => x.to_ipv6_mapped(),
            IpAddr::V6(x) => x,
        };
        buf.extend_from_slice(&ip.octets());
        buf.write(self.remote_address.port());
        buf.write(self.orig_dst_cid);
        buf.resize(AUTHENTICATED_LENGTH + ENCRYPTED_LENGTH, 0);

        let aad = self.timestamp_ms.to_be_bytes();
        let nonce = aead::Nonce::assume_unique_for_key(derive_iv(new_cid));
        let tag = key
            .seal_in_place_separate_tag(
                nonce,
                aead::Aad::from(aad),
                &mut buf[AUTHENTICATED_LENGTH..],
            )
            .expect("token body fits AEAD limits");
        buf.extend_from_slice(tag.as_ref());
        debug_assert_eq!(buf.len(), RETRY_TOKEN_LENGTH);
        buf
    }

    /// Read the plaintext timestamp without authenticating anything. Used
    /// to pick the key generation before attempting decryption.
    pub fn peek_timestamp(token: &[u8]) -> Option<u64> {
        if token.len() != RETRY_TOKEN_LENGTH {
            return None;
        }
        Some(u64::from_be_bytes(
            token[..AUTHENTICATED_LENGTH].try_into().ok()?,
        ))
    }

    /// Open a token received on an Initial whose destination CID is
    /// `echoed_cid`. Returns `None` on any length, authentication, or
    /// bounds failure.
    pub fn open(
        key: &aead::LessSafeKey,
        echoed_cid: &ConnectionId,
        token: &[u8],
    ) -> Option<Self> {
        if token.len() != RETRY_TOKEN_LENGTH {
            return None;
        }
        let timestamp_ms = Self::peek_timestamp(token)?;
        let aad = timestamp_ms.to_be_bytes();
        let mut body = token[AUTHENTICATED_LENGTH..].to_vec();
        let nonce = aead::Nonce::assume_unique_for_key(derive_iv(echoed_cid));
        let plain = key
            .open_in_place(nonce, aead::Aad::from(aad), &mut body)
            .ok()?;

        if plain.len() != ENCRYPTED_LENGTH {
            return None;
        }
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&plain[..16]);
        let ip = Ipv6Addr::from(octets);
        let ip = match ip.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(ip),
        };
        let port = u16::from_be_bytes(plain[16..18].try_into().ok()?);
        let mut tail = &plain[18..];
        let orig_dst_cid = BufExt::get::<ConnectionId>(&mut tail).ok()?;

        Some(Self {
            timestamp_ms,
            remote_address: SocketAddr::new(ip, port),
            orig_dst_cid,
        })
    }
}

/// Fold a connection ID into an AEAD nonce: copy when it fits, XOR the
/// tail back over the front when it does not.
fn derive_iv(cid: &ConnectionId) -> [u8; aead::NONCE_LEN] {
    let mut iv = [0u8; aead::NONCE_LEN];
    if cid.len() >= aead::NONCE_LEN {
        iv.copy_from_slice(&cid[..aead::NONCE_LEN]);
        for i in aead::NONCE_LEN..cid.len() {
            iv[i % aead::NONCE_LEN] ^= cid[i];
        }
    } else {
        iv[..cid.len()].copy_from_slice(cid);
    }
    iv
}
