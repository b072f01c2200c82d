// This file is part of Alpenhorn and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

//! Metadata-private call signaling. The crate has two halves: the PKG, an
//! identity-based key authority that hands out per-round IBE identity keys
//! and attests to long-term key bindings, and the dialing client, a
//! per-round state machine that submits onions to a mixnet and probes
//! mailbox Bloom filters for incoming calls.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// BLS signatures over BLS12-381 used for identity attestations.
pub mod bls;
/// Bloom filters served per mailbox by the CDN.
pub mod bloom;
/// Dialing client: per-round state machine driven by coordinator events.
pub mod client;
/// Signed dialing configurations chained by hash.
pub mod config;
/// Coordinator event envelopes and mixnet round settings.
pub mod coordinator;
/// Identity-based encryption master keys and identity-key extraction.
pub mod ibe;
/// Layered box encryption for mixnet onions.
pub mod onion;
/// Atomic on-disk client state.
pub mod persist;
/// Private-key generator: server, backing store, and extraction client.
pub mod pkg;
/// Forward-secure key wheel producing dial tokens and session keys.
pub mod wheel;

pub use client::{Client, EventHandler, IncomingCall, OutgoingCall};

/// Number of call intents carried by dial tokens. Intents `0..INTENT_MAX`
/// are probed when scanning a mailbox.
pub const INTENT_MAX: u32 = 3;

/// Fixed-width canonical form of a username, used verbatim as the IBE
/// identity string and as part of the PKG database key.
pub type Identity = [u8; 64];

/// Error returned for usernames that have no identity encoding.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum InvalidUsername {
    #[error("username is empty")]
    Empty,
    #[error("username is {0} bytes, limit is 64")]
    TooLong(usize),
    #[error("username contains invalid byte {0:#04x}")]
    BadByte(u8),
}

fn valid_username_byte(b: u8) -> bool {
    b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'@' | b'_' | b'-')
}

/// Maps an already-validated username to its identity. Total: overlong
/// input is truncated rather than rejected, so only call this on names that
/// passed [`username_to_identity`] validation.
#[must_use]
pub fn valid_username_to_identity(username: &str) -> Identity {
    let mut id = [0u8; 64];
    let bytes = username.as_bytes();
    let n = bytes.len().min(64);
    id[..n].copy_from_slice(&bytes[..n]);
    id
}

/// Validates a username and maps it to its identity. Valid usernames are
/// 1..=64 bytes of lowercase ASCII letters, digits, and `. @ _ -`. The
/// mapping pads with NUL bytes, which no valid name contains, so distinct
/// valid usernames map to distinct identities.
pub fn username_to_identity(username: &str) -> Result<Identity, InvalidUsername> {
    let bytes = username.as_bytes();
    if bytes.is_empty() {
        return Err(InvalidUsername::Empty);
    }
    if bytes.len() > 64 {
        return Err(InvalidUsername::TooLong(bytes.len()));
    }
    for &b in bytes {
        if !valid_username_byte(b) {
            return Err(InvalidUsername::BadByte(b));
        }
    }
    Ok(valid_username_to_identity(username))
}

/// Assigns a username to one of `num_mailboxes` CDN mailboxes. Mailbox 0 is
/// reserved for cover traffic, so real assignments are 1-based.
#[must_use]
pub fn mailbox_of(username: &str, num_mailboxes: u32) -> u32 {
    let id = valid_username_to_identity(username);
    let digest = Sha256::digest(id);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(num_mailboxes)) as u32 + 1
}

/// Network endpoints a client talks to.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub entry_addr: String,
    pub config_server: String,
}

pub(crate) mod hexbytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        hex::decode(&text).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod hexarray {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(v: &[u8; N], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        d: D,
    ) -> Result<[u8; N], D::Error> {
        let text = String::deserialize(d)?;
        let bytes = hex::decode(&text).map_err(serde::de::Error::custom)?;
        bytes.try_into().map_err(|v: Vec<u8>| {
            serde::de::Error::custom(format!("want {N} bytes, got {}", v.len()))
        })
    }
}

pub(crate) mod hexarrayseq {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        v: &[[u8; N]],
        s: S,
    ) -> Result<S::Ok, S::Error> {
        s.collect_seq(v.iter().map(hex::encode))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        d: D,
    ) -> Result<Vec<[u8; N]>, D::Error> {
        let texts = Vec::<String>::deserialize(d)?;
        texts
            .into_iter()
            .map(|text| {
                let bytes = hex::decode(&text).map_err(serde::de::Error::custom)?;
                bytes.try_into().map_err(|v: Vec<u8>| {
                    serde::de::Error::custom(format!("want {N} bytes, got {}", v.len()))
                })
            })
            .collect()
    }
}
