// This file is part of Alpenhorn and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Client side of the PKG protocol. One `Registration` per PKG server is
//! kept in the persisted registration map; it signs extraction requests
//! with the login key, decrypts the returned identity key, and checks the
//! server's attestation before handing anything upstream.

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

use super::extract::open_from_return_key;
use super::{Attestation, ErrorResponse, ExtractArgs, ExtractReply, RegisterArgs};
use crate::{bls, ibe, username_to_identity, InvalidUsername};

/// Failures talking to a PKG.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid username: {0}")]
    InvalidUsername(#[from] InvalidUsername),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("pkg error {code}: {message}")]
    Server { code: u32, message: String },
    #[error("malformed reply: {0}")]
    BadReply(String),
}

/// The identity key and attestation obtained from one PKG for one round.
pub struct ExtractedKey {
    pub private_key: ibe::IdentityPrivateKey,
    pub identity_sig: bls::Signature,
}

/// Persisted registration with one PKG server.
#[derive(Clone, Serialize, Deserialize)]
pub struct Registration {
    pub server_address: String,
    #[serde(with = "crate::hexarray")]
    pub server_key: [u8; 32],
    pub username: String,
    #[serde(with = "crate::hexarray")]
    pub login_key_seed: [u8; 32],
}

impl Registration {
    /// Creates a registration record with a fresh login key. The record
    /// must still be registered with the server before extraction works.
    #[must_use]
    pub fn new(server_address: &str, server_key: [u8; 32], username: &str) -> Self {
        let login_key = SigningKey::generate(&mut OsRng);
        Self {
            server_address: server_address.to_string(),
            server_key,
            username: username.to_string(),
            login_key_seed: login_key.to_bytes(),
        }
    }

    #[must_use]
    pub fn login_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.login_key_seed)
    }

    fn url(&self, endpoint: &str) -> String {
        format!("http://{}/{endpoint}", self.server_address)
    }

    fn check_error(resp: reqwest::blocking::Response) -> Result<reqwest::blocking::Response, ClientError> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        match resp.json::<ErrorResponse>() {
            Ok(err) => Err(ClientError::Server {
                code: err.code,
                message: err.message,
            }),
            Err(e) => Err(ClientError::BadReply(format!("undecodable error body: {e}"))),
        }
    }

    /// Registers the login key for our username.
    pub fn register(&self) -> Result<(), ClientError> {
        username_to_identity(&self.username)?;
        let args = RegisterArgs {
            username: self.username.clone(),
            login_key: self.login_key().verifying_key().to_bytes(),
        };
        let resp = reqwest::blocking::Client::new()
            .post(self.url("register"))
            .json(&args)
            .send()?;
        Self::check_error(resp)?;
        Ok(())
    }

    /// Requests the identity key for `round`, attested over
    /// `user_long_term_key`, and verifies everything the server returns.
    /// `attest_key` is the round's announced BLS key for this PKG and
    /// `master_public` the round's announced IBE master public key.
    pub fn extract(
        &self,
        round: u32,
        user_long_term_key: [u8; 32],
        attest_key: &bls::PublicKey,
        master_public: &ibe::MasterPublicKey,
    ) -> Result<ExtractedKey, ClientError> {
        let identity = username_to_identity(&self.username)?;
        let return_secret = StaticSecret::random_from_rng(OsRng);
        let mut args = ExtractArgs {
            round,
            username: self.username.clone(),
            return_key: PublicKey::from(&return_secret).to_bytes(),
            user_long_term_key: user_long_term_key.to_vec(),
            server_signing_key: self.server_key,
            signature: [0u8; 64],
        };
        args.sign(&self.login_key());

        let resp = reqwest::blocking::Client::new()
            .post(self.url("extract"))
            .json(&args)
            .send()?;
        let reply: ExtractReply = Self::check_error(resp)?
            .json()
            .map_err(|e| ClientError::BadReply(e.to_string()))?;

        self.verify_reply(round, &identity, user_long_term_key, attest_key, master_public, &return_secret, &reply)
    }

    /// Reply validation, separated from transport so it can be exercised
    /// directly.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn verify_reply(
        &self,
        round: u32,
        identity: &crate::Identity,
        user_long_term_key: [u8; 32],
        attest_key: &bls::PublicKey,
        master_public: &ibe::MasterPublicKey,
        return_secret: &StaticSecret,
        reply: &ExtractReply,
    ) -> Result<ExtractedKey, ClientError> {
        if reply.round != round || reply.username != self.username {
            return Err(ClientError::BadReply("reply echoes wrong request".into()));
        }
        let server_key = VerifyingKey::from_bytes(&self.server_key)
            .map_err(|_| ClientError::BadReply("registration has malformed server key".into()))?;
        if !reply.verify(&server_key) {
            return Err(ClientError::BadReply("bad server signature".into()));
        }

        let opened = open_from_return_key(return_secret, &reply.encrypted_private_key)
            .ok_or_else(|| ClientError::BadReply("identity key box does not open".into()))?;
        let key_bytes: [u8; ibe::IDENTITY_KEY_SIZE] = opened
            .try_into()
            .map_err(|_| ClientError::BadReply("identity key has wrong width".into()))?;
        let private_key = ibe::IdentityPrivateKey::from_bytes(&key_bytes)
            .map_err(|e| ClientError::BadReply(e.to_string()))?;
        if !private_key.verify(identity, master_public) {
            return Err(ClientError::BadReply(
                "identity key does not match master key".into(),
            ));
        }

        let attestation = Attestation {
            attest_key: *attest_key,
            user_identity: *identity,
            user_long_term_key,
        };
        if !attest_key.verify(&attestation.marshal(), &reply.identity_sig) {
            return Err(ClientError::BadReply("bad identity attestation".into()));
        }

        Ok(ExtractedKey {
            private_key,
            identity_sig: reply.identity_sig,
        })
    }
}
