// This file is part of Alpenhorn and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Types exchanged with the dialing coordinator. The coordinator drives
//! every client through an ordered event sequence per round over a
//! message-oriented connection; envelopes carry a tag string and a typed
//! JSON body.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Service parameters the mixnet announces for a dialing round.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ServiceData {
    pub num_mailboxes: u32,
}

impl ServiceData {
    #[must_use]
    pub fn marshal(&self) -> Vec<u8> {
        self.num_mailboxes.to_be_bytes().to_vec()
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let bytes: [u8; 4] = data
            .try_into()
            .map_err(|_| anyhow!("service data is {} bytes, want 4", data.len()))?;
        let num_mailboxes = u32::from_be_bytes(bytes);
        if num_mailboxes == 0 {
            return Err(anyhow!("service data announces zero mailboxes"));
        }
        Ok(Self { num_mailboxes })
    }
}

/// Mixnet settings for one round, signed by every mixer in the chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MixSettings {
    pub round: u32,
    /// Onion public keys ordered entry server first.
    #[serde(with = "crate::hexarrayseq")]
    pub onion_keys: Vec<[u8; 32]>,
    #[serde(with = "crate::hexbytes")]
    pub raw_service_data: Vec<u8>,
}

impl MixSettings {
    /// Canonical bytes each mixer signs for these settings.
    #[must_use]
    pub fn signing_message(&self) -> Vec<u8> {
        let mut msg = Vec::with_capacity(16 + 32 * self.onion_keys.len());
        msg.extend_from_slice(b"MixSettings");
        msg.extend_from_slice(&self.round.to_be_bytes());
        msg.extend_from_slice(&(self.onion_keys.len() as u32).to_be_bytes());
        for key in &self.onion_keys {
            msg.extend_from_slice(key);
        }
        msg.extend_from_slice(&self.raw_service_data);
        msg
    }
}

/// Announces a round and the config hash it runs under.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewRound {
    pub round: u32,
    #[serde(with = "crate::hexarray")]
    pub config_hash: [u8; 32],
}

/// Carries the round's mix settings and one signature per mixer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MixRound {
    pub mix_settings: MixSettings,
    #[serde(with = "crate::hexarrayseq")]
    pub mix_signatures: Vec<[u8; 64]>,
}

/// Points the client at the round's mailbox filters on the CDN.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MailboxUrl {
    pub round: u32,
    pub url: String,
    pub num_mailboxes: u32,
}

/// Error announced by the coordinator for a round.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoundError {
    pub round: u32,
    pub err: String,
}

/// The client's onion reply for a round.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OnionMsg {
    pub round: u32,
    #[serde(with = "crate::hexbytes")]
    pub onion: Vec<u8>,
}

/// A tagged message on the coordinator connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub tag: String,
    pub body: Value,
}

/// Coordinator events in the order they arrive within a round.
#[derive(Clone, Debug)]
pub enum Event {
    NewRound(NewRound),
    Mix(MixRound),
    Mailbox(MailboxUrl),
    Error(RoundError),
}

impl Event {
    pub fn from_envelope(env: &Envelope) -> Result<Self> {
        let event = match env.tag.as_str() {
            "newround" => Event::NewRound(serde_json::from_value(env.body.clone())?),
            "mix" => Event::Mix(serde_json::from_value(env.body.clone())?),
            "mailbox" => Event::Mailbox(serde_json::from_value(env.body.clone())?),
            "error" => Event::Error(serde_json::from_value(env.body.clone())?),
            other => return Err(anyhow!("unknown coordinator tag {other:?}")),
        };
        Ok(event)
    }
}

/// Outbound half of the coordinator connection, held by the transport.
pub trait ConnSender: Send + Sync {
    fn send(&self, tag: &str, body: Value) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_data_roundtrip() {
        let sd = ServiceData { num_mailboxes: 64 };
        assert_eq!(ServiceData::unmarshal(&sd.marshal()).unwrap(), sd);
        assert!(ServiceData::unmarshal(&[1, 2, 3]).is_err());
        assert!(ServiceData::unmarshal(&[0, 0, 0, 0]).is_err());
    }

    #[test]
    fn signing_message_binds_all_fields() {
        let settings = MixSettings {
            round: 3,
            onion_keys: vec![[1u8; 32], [2u8; 32]],
            raw_service_data: ServiceData { num_mailboxes: 8 }.marshal(),
        };
        let base = settings.signing_message();
        assert!(base.starts_with(b"MixSettings"));

        let mut other = settings.clone();
        other.round = 4;
        assert_ne!(base, other.signing_message());

        let mut other = settings.clone();
        other.onion_keys[1] = [3u8; 32];
        assert_ne!(base, other.signing_message());

        let mut other = settings;
        other.raw_service_data = ServiceData { num_mailboxes: 9 }.marshal();
        assert_ne!(base, other.signing_message());
    }

    #[test]
    fn envelope_dispatch() {
        let env = Envelope {
            tag: "newround".into(),
            body: serde_json::to_value(NewRound {
                round: 5,
                config_hash: [7u8; 32],
            })
            .unwrap(),
        };
        match Event::from_envelope(&env).unwrap() {
            Event::NewRound(nr) => {
                assert_eq!(nr.round, 5);
                assert_eq!(nr.config_hash, [7u8; 32]);
            }
            _ => panic!("wrong event"),
        }
        let bad = Envelope {
            tag: "mixx".into(),
            body: Value::Null,
        };
        assert!(Event::from_envelope(&bad).is_err());
    }
}
