// This file is part of Alpenhorn and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Signed dialing configurations. Configs form a hash chain: each new
//! config names its predecessor's hash and must be signed by the
//! predecessor's guardians, so a client holding any trusted tip can verify
//! a fetched chain forward to the announced hash.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One mixer in the configured chain.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MixServerInfo {
    /// The mixer's ed25519 signing key.
    #[serde(with = "crate::hexarray")]
    pub key: [u8; 32],
    pub address: String,
}

/// Service parameters of the dialing protocol.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DialingConfig {
    /// Mixers ordered entry server first.
    pub mix_servers: Vec<MixServerInfo>,
    pub cdn_server: String,
}

/// A party whose signature is required on the successor config.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Guardian {
    pub username: String,
    #[serde(with = "crate::hexarray")]
    pub key: [u8; 32],
}

/// A dialing config bound into the hash chain and signed by guardians.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedConfig {
    pub service: String,
    pub created: u64,
    pub expires: u64,
    #[serde(with = "crate::hexarray")]
    pub prev_config_hash: [u8; 32],
    pub inner: DialingConfig,
    pub guardians: Vec<Guardian>,
    /// Guardian signatures over [`SignedConfig::signing_message`], keyed by
    /// hex guardian public key.
    pub signatures: BTreeMap<String, String>,
}

fn put_str(msg: &mut Vec<u8>, s: &str) {
    msg.extend_from_slice(&(s.len() as u32).to_be_bytes());
    msg.extend_from_slice(s.as_bytes());
}

impl SignedConfig {
    /// Canonical bytes guardians sign; also the hash preimage. Signatures
    /// are excluded.
    #[must_use]
    pub fn signing_message(&self) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(b"SignedConfig");
        put_str(&mut msg, &self.service);
        msg.extend_from_slice(&self.created.to_be_bytes());
        msg.extend_from_slice(&self.expires.to_be_bytes());
        msg.extend_from_slice(&self.prev_config_hash);
        msg.extend_from_slice(&(self.inner.mix_servers.len() as u32).to_be_bytes());
        for mixer in &self.inner.mix_servers {
            msg.extend_from_slice(&mixer.key);
            put_str(&mut msg, &mixer.address);
        }
        put_str(&mut msg, &self.inner.cdn_server);
        msg.extend_from_slice(&(self.guardians.len() as u32).to_be_bytes());
        for guardian in &self.guardians {
            put_str(&mut msg, &guardian.username);
            msg.extend_from_slice(&guardian.key);
        }
        msg
    }

    /// The config's chain hash.
    #[must_use]
    pub fn hash(&self) -> [u8; 32] {
        Sha256::digest(self.signing_message()).into()
    }

    /// Adds a guardian signature.
    pub fn sign(&mut self, key: &SigningKey) {
        let sig = key.sign(&self.signing_message());
        self.signatures.insert(
            hex::encode(key.verifying_key().as_bytes()),
            hex::encode(sig.to_bytes()),
        );
    }

    fn verify_guardian_signature(&self, guardian: &Guardian) -> Result<()> {
        let key_hex = hex::encode(guardian.key);
        let sig_hex = self
            .signatures
            .get(&key_hex)
            .with_context(|| format!("config missing signature from guardian {}", guardian.username))?;
        let sig_bytes: [u8; 64] = hex::decode(sig_hex)
            .ok()
            .and_then(|v| v.try_into().ok())
            .with_context(|| format!("malformed signature from guardian {}", guardian.username))?;
        let key = VerifyingKey::from_bytes(&guardian.key)
            .with_context(|| format!("malformed key for guardian {}", guardian.username))?;
        key.verify(&self.signing_message(), &Signature::from_bytes(&sig_bytes))
            .with_context(|| format!("bad signature from guardian {}", guardian.username))
    }

    fn validate(&self) -> Result<()> {
        if self.expires < self.created {
            bail!("config expires before it is created");
        }
        if self.inner.mix_servers.is_empty() {
            bail!("config names no mix servers");
        }
        Ok(())
    }
}

/// Checks a chain ordered newest first: every link must name its
/// predecessor's hash, not move backwards in time, keep the same service,
/// and carry a valid signature from every guardian of the predecessor.
pub fn verify_chain(chain: &[SignedConfig]) -> Result<()> {
    if chain.is_empty() {
        bail!("empty config chain");
    }
    for config in chain {
        config.validate()?;
    }
    for pair in chain.windows(2) {
        let (newer, older) = (&pair[0], &pair[1]);
        if newer.prev_config_hash != older.hash() {
            bail!("config chain broken: prev hash mismatch");
        }
        if newer.service != older.service {
            bail!(
                "config chain switches service from {} to {}",
                older.service,
                newer.service
            );
        }
        if newer.created < older.created {
            bail!("config chain moves backwards in time");
        }
        for guardian in &older.guardians {
            newer.verify_guardian_signature(guardian)?;
        }
    }
    Ok(())
}

/// Where the client fetches config chains from.
pub trait ConfigSource: Send + Sync {
    /// Fetches configs from the one hashing to `want` (first) back to the
    /// one hashing to `have` (exclusive), newest first.
    fn fetch_chain(&self, have: [u8; 32], want: [u8; 32]) -> Result<Vec<SignedConfig>>;
}

/// Fetches a chain from `source` and verifies it against the trusted
/// `current` tip. Returns the verified chain, newest first.
pub fn fetch_and_verify_chain(
    source: &dyn ConfigSource,
    current: &SignedConfig,
    want: [u8; 32],
) -> Result<Vec<SignedConfig>> {
    let chain = source.fetch_chain(current.hash(), want)?;
    if chain.is_empty() {
        bail!("config service returned an empty chain");
    }
    let got = chain[0].hash();
    if got != want {
        bail!(
            "config service returned head {} instead of {}",
            hex::encode(got),
            hex::encode(want)
        );
    }
    let mut full = chain.clone();
    full.push(current.clone());
    verify_chain(&full)?;
    Ok(chain)
}

/// Config service spoken to over HTTP.
pub struct HttpConfigSource {
    base_url: String,
    http: reqwest::blocking::Client,
}

impl HttpConfigSource {
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::blocking::Client::new(),
        }
    }
}

impl ConfigSource for HttpConfigSource {
    fn fetch_chain(&self, have: [u8; 32], want: [u8; 32]) -> Result<Vec<SignedConfig>> {
        let url = format!(
            "{}/chain?have={}&want={}",
            self.base_url,
            hex::encode(have),
            hex::encode(want)
        );
        let resp = self
            .http
            .get(&url)
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .with_context(|| format!("fetching config chain from {url}"))?;
        let chain = resp
            .json::<Vec<SignedConfig>>()
            .context("decoding config chain")?;
        Ok(chain)
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::{next_config, root_config};
    use super::*;

    #[test]
    fn hash_covers_inner_config() {
        let (config, _) = root_config();
        let mut other = config.clone();
        other.inner.cdn_server = "evil.example.org".into();
        assert_ne!(config.hash(), other.hash());
        let mut other = config.clone();
        other.signatures.insert("k".into(), "v".into());
        assert_eq!(config.hash(), other.hash());
    }

    #[test]
    fn valid_chain_verifies() {
        let (root, guardian) = root_config();
        let mid = next_config(&root, &guardian);
        let tip = next_config(&mid, &guardian);
        verify_chain(&[tip, mid, root]).unwrap();
    }

    #[test]
    fn chain_rejects_missing_guardian_signature() {
        let (root, guardian) = root_config();
        let mut mid = next_config(&root, &guardian);
        mid.signatures.clear();
        assert!(verify_chain(&[mid, root]).is_err());
    }

    #[test]
    fn chain_rejects_broken_hash_link() {
        let (root, guardian) = root_config();
        let mut mid = next_config(&root, &guardian);
        mid.prev_config_hash = [9u8; 32];
        // re-sign so only the link itself is wrong
        mid.signatures.clear();
        mid.sign(&guardian);
        assert!(verify_chain(&[mid, root]).is_err());
    }

    #[test]
    fn chain_rejects_forged_signature() {
        let (root, guardian) = root_config();
        let forger = SigningKey::generate(&mut rand::rngs::OsRng);
        let mut mid = next_config(&root, &guardian);
        mid.signatures.clear();
        mid.sign(&forger);
        assert!(verify_chain(&[mid, root]).is_err());
    }

    #[test]
    fn fetch_and_verify_checks_head() {
        struct Fixed(Vec<SignedConfig>);
        impl ConfigSource for Fixed {
            fn fetch_chain(&self, _have: [u8; 32], _want: [u8; 32]) -> Result<Vec<SignedConfig>> {
                Ok(self.0.clone())
            }
        }
        let (root, guardian) = root_config();
        let tip = next_config(&root, &guardian);
        let want = tip.hash();
        let chain = fetch_and_verify_chain(&Fixed(vec![tip.clone()]), &root, want).unwrap();
        assert_eq!(chain.len(), 1);
        assert!(fetch_and_verify_chain(&Fixed(vec![tip]), &root, [5u8; 32]).is_err());
    }

    #[test]
    fn serde_roundtrip_preserves_hash() {
        let (root, guardian) = root_config();
        let tip = next_config(&root, &guardian);
        let json = serde_json::to_string(&tip).unwrap();
        let back: SignedConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.hash(), tip.hash());
        assert_eq!(back.signatures, tip.signatures);
    }
}
