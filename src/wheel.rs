// This file is part of Alpenhorn and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Forward-secure key wheel. Each friend pair shares a secret bound to the
//! round it was established in; the secret is ratcheted forward by hashing,
//! one step per dialing round. Dial tokens and session keys are derived
//! from the round secret, and erasing a round's keys makes every earlier
//! round underivable.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroize;

use crate::valid_username_to_identity;

/// Width of a dial token.
pub const TOKEN_SIZE: usize = 32;
/// Width of a derived session key.
pub const SESSION_KEY_SIZE: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Malformed serialized wheel state.
#[derive(Debug, Error)]
#[error("invalid key wheel encoding: {0}")]
pub struct WheelFormatError(#[from] serde_json::Error);

#[derive(Clone, Serialize, Deserialize)]
struct WheelEntry {
    round: u32,
    #[serde(with = "crate::hexarray")]
    secret: [u8; 32],
}

impl Drop for WheelEntry {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// All dial tokens one friend could have sent us in a round, indexed by
/// intent.
#[derive(Clone, Debug)]
pub struct FriendTokens {
    pub from_username: String,
    pub tokens: Vec<[u8; TOKEN_SIZE]>,
}

/// Per-friend ratcheted secrets keyed by friend username.
#[derive(Default, Serialize, Deserialize)]
pub struct KeyWheel {
    entries: BTreeMap<String, WheelEntry>,
}

fn ratchet(secret: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"alpenhorn-keywheel-ratchet");
    hasher.update(secret);
    hasher.finalize().into()
}

fn dial_token(secret: &[u8; 32], sender: &str, receiver: &str, intent: u32) -> [u8; TOKEN_SIZE] {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts 32-byte keys");
    mac.update(b"dial-token");
    mac.update(&valid_username_to_identity(sender));
    mac.update(&valid_username_to_identity(receiver));
    mac.update(&intent.to_be_bytes());
    mac.finalize().into_bytes().into()
}

fn round_session_key(secret: &[u8; 32]) -> [u8; SESSION_KEY_SIZE] {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts 32-byte keys");
    mac.update(b"session-key");
    mac.finalize().into_bytes().into()
}

impl WheelEntry {
    /// Secret for `round`, or None when the wheel has already advanced
    /// past it.
    fn secret_at(&self, round: u32) -> Option<[u8; 32]> {
        if round < self.round {
            return None;
        }
        let mut secret = self.secret;
        for _ in self.round..round {
            secret = ratchet(&secret);
        }
        Some(secret)
    }
}

impl KeyWheel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the shared secret agreed with `friend`, anchored at the
    /// round the friendship completed in.
    pub fn put(&mut self, friend: &str, round: u32, secret: [u8; 32]) {
        self.entries
            .insert(friend.to_string(), WheelEntry { round, secret });
    }

    pub fn remove(&mut self, friend: &str) {
        self.entries.remove(friend);
    }

    #[must_use]
    pub fn contains(&self, friend: &str) -> bool {
        self.entries.contains_key(friend)
    }

    /// Token we place in the mixnet when calling `friend` in `round`.
    #[must_use]
    pub fn outgoing_dial_token(
        &self,
        me: &str,
        friend: &str,
        round: u32,
        intent: u32,
    ) -> Option<[u8; TOKEN_SIZE]> {
        let entry = self.entries.get(friend)?;
        let secret = entry.secret_at(round)?;
        Some(dial_token(&secret, me, friend, intent))
    }

    /// Every token a friend could have used to dial us in `round`, for all
    /// intents below `max_intent`.
    #[must_use]
    pub fn incoming_dial_tokens(&self, me: &str, round: u32, max_intent: u32) -> Vec<FriendTokens> {
        let mut all = Vec::new();
        for (friend, entry) in &self.entries {
            let Some(secret) = entry.secret_at(round) else {
                continue;
            };
            let tokens = (0..max_intent)
                .map(|intent| dial_token(&secret, friend, me, intent))
                .collect();
            all.push(FriendTokens {
                from_username: friend.clone(),
                tokens,
            });
        }
        all
    }

    /// Session key shared with `friend` for `round`. Both sides derive the
    /// same key.
    #[must_use]
    pub fn session_key(&self, friend: &str, round: u32) -> Option<[u8; SESSION_KEY_SIZE]> {
        let entry = self.entries.get(friend)?;
        let secret = entry.secret_at(round)?;
        Some(round_session_key(&secret))
    }

    /// Advances every entry past `round`, destroying the key material for
    /// `round` and everything before it.
    pub fn erase_keys(&mut self, round: u32) {
        for entry in self.entries.values_mut() {
            if entry.round <= round {
                let mut secret = entry
                    .secret_at(round + 1)
                    .expect("advancing a live entry cannot fail");
                std::mem::swap(&mut entry.secret, &mut secret);
                entry.round = round + 1;
                secret.zeroize();
            }
        }
    }

    #[must_use]
    pub fn marshal_binary(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("key wheel state is always serializable")
    }

    pub fn unmarshal_binary(data: &[u8]) -> Result<Self, WheelFormatError> {
        Ok(serde_json::from_slice(data)?)
    }
}
