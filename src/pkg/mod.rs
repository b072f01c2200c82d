// This file is part of Alpenhorn and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! The private-key generator. Users register a long-term login key once;
//! per round, the server extracts their IBE identity key on request and
//! signs an attestation binding their identity to their long-term key.
//! Round master secrets are installed by the coordinator-facing admin path
//! before extraction opens and destroyed when the round closes.

use std::collections::HashMap;
use std::sync::Mutex;

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{bls, ibe, Identity, InvalidUsername};

pub mod client;
pub mod db;
pub mod extract;
pub mod http;

pub use extract::{Attestation, ExtractArgs, ExtractReply, RegisterArgs};

/// Upper bound on request bodies, capping adversarial parsing cost.
pub const MAX_REQUEST_SIZE: usize = 1024;

const REGISTRATION_SUFFIX: &[u8] = b"-registration";
const LAST_EXTRACTION_SUFFIX: &[u8] = b"-lastextraction";

pub(crate) fn user_key(id: &Identity, suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + 64 + suffix.len());
    key.extend_from_slice(b"user");
    key.extend_from_slice(id);
    key.extend_from_slice(suffix);
    key
}

/// PKG failure kinds. Every kind has a stable numeric code that crosses
/// the wire; only `DatabaseError` is internal.
#[derive(Debug, Error)]
pub enum Error {
    #[error("bad request JSON: {0}")]
    BadRequestJson(String),
    #[error("round {0} not found")]
    RoundNotFound(u32),
    #[error("user long-term key is {0} bytes, want 32")]
    InvalidUserLongTermKey(usize),
    #[error("invalid username: {0}")]
    InvalidUsername(#[from] InvalidUsername),
    #[error("username {0:?} is not registered")]
    NotRegistered(String),
    #[error("database error: {0}")]
    DatabaseError(String),
    #[error("invalid signature under login key {0}")]
    InvalidSignature(String),
    #[error("username {0:?} is already registered")]
    AlreadyRegistered(String),
    #[error("round {0} already has keys")]
    RoundExists(u32),
}

impl Error {
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            Error::BadRequestJson(_) => 1,
            Error::RoundNotFound(_) => 2,
            Error::InvalidUserLongTermKey(_) => 3,
            Error::InvalidUsername(_) => 4,
            Error::NotRegistered(_) => 5,
            Error::DatabaseError(_) => 6,
            Error::InvalidSignature(_) => 7,
            Error::AlreadyRegistered(_) => 8,
            Error::RoundExists(_) => 9,
        }
    }

    /// Internal errors are logged server-side and returned to the client
    /// without detail.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        matches!(self, Error::DatabaseError(_))
    }
}

/// Wire form of a PKG error.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: u32,
    pub message: String,
}

impl From<&Error> for ErrorResponse {
    fn from(err: &Error) -> Self {
        let message = if err.is_internal() {
            "internal database error".to_string()
        } else {
            err.to_string()
        };
        ErrorResponse {
            code: err.code(),
            message,
        }
    }
}

fn db_err(err: rusqlite::Error) -> Error {
    Error::DatabaseError(err.to_string())
}

/// Master secrets for one extraction round.
#[derive(Clone)]
pub struct RoundState {
    pub master_key: ibe::MasterPrivateKey,
    pub master_public: ibe::MasterPublicKey,
    pub bls_key: bls::PrivateKey,
    pub bls_public: bls::PublicKey,
}

/// Public half of a round's master keys, announced out of band.
#[derive(Clone, Copy, Debug)]
pub struct RoundSettings {
    pub master_public: ibe::MasterPublicKey,
    pub bls_public: bls::PublicKey,
}

/// Per-user registration record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserState {
    #[serde(with = "crate::hexarray")]
    pub login_key: [u8; 32],
}

/// Audit entry updated on every successful extraction.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LastExtraction {
    pub round: u32,
    pub unix_time: i64,
}

/// A PKG server instance.
pub struct Server {
    signing_key: SigningKey,
    public_key: VerifyingKey,
    rounds: Mutex<HashMap<u32, RoundState>>,
    db: db::Db,
}

impl Server {
    #[must_use]
    pub fn new(signing_key: SigningKey, db: db::Db) -> Self {
        let public_key = signing_key.verifying_key();
        Self {
            signing_key,
            public_key,
            rounds: Mutex::new(HashMap::new()),
            db,
        }
    }

    #[must_use]
    pub fn public_key(&self) -> VerifyingKey {
        self.public_key
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub(crate) fn round_state(&self, round: u32) -> Option<RoundState> {
        self.rounds.lock().unwrap().get(&round).cloned()
    }

    /// Installs fresh master keys for a round. Called by the round admin
    /// before extraction opens.
    pub fn insert_round(&self, round: u32) -> Result<RoundSettings, Error> {
        let (master_key, master_public) = ibe::master_keygen(&mut OsRng);
        let bls_key = bls::PrivateKey::generate(&mut OsRng);
        let bls_public = bls_key.public_key();
        let mut rounds = self.rounds.lock().unwrap();
        if rounds.contains_key(&round) {
            return Err(Error::RoundExists(round));
        }
        rounds.insert(
            round,
            RoundState {
                master_key,
                master_public,
                bls_key,
                bls_public,
            },
        );
        Ok(RoundSettings {
            master_public,
            bls_public,
        })
    }

    /// Destroys a closed round's master secrets.
    pub fn remove_round(&self, round: u32) {
        self.rounds.lock().unwrap().remove(&round);
    }

    /// Creates the registration record for a new username.
    pub fn register(&self, username: &str, login_key: [u8; 32]) -> Result<(), Error> {
        let id = crate::username_to_identity(username)?;
        let user = UserState { login_key };
        let value = serde_json::to_vec(&user).expect("user state is always serializable");
        let created = self
            .db
            .put_if_absent(&user_key(&id, REGISTRATION_SUFFIX), &value)
            .map_err(db_err)?;
        if !created {
            return Err(Error::AlreadyRegistered(username.to_string()));
        }
        Ok(())
    }

    pub(crate) fn get_user(&self, username: &str) -> Result<(UserState, Identity), Error> {
        let id = crate::username_to_identity(username)?;
        let data = self
            .db
            .get(&user_key(&id, REGISTRATION_SUFFIX))
            .map_err(db_err)?
            .ok_or_else(|| Error::NotRegistered(username.to_string()))?;
        let user = serde_json::from_slice(&data)
            .map_err(|e| Error::DatabaseError(format!("corrupt user record: {e}")))?;
        Ok((user, id))
    }

    pub(crate) fn record_last_extraction(
        &self,
        id: &Identity,
        entry: &LastExtraction,
    ) -> Result<(), Error> {
        let value = serde_json::to_vec(entry).expect("audit entry is always serializable");
        self.db
            .put(&user_key(id, LAST_EXTRACTION_SUFFIX), &value)
            .map_err(db_err)
    }

    /// The audit record for an identity, if any extraction succeeded.
    pub fn last_extraction(&self, id: &Identity) -> Result<Option<LastExtraction>, Error> {
        let data = self
            .db
            .get(&user_key(id, LAST_EXTRACTION_SUFFIX))
            .map_err(db_err)?;
        match data {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| Error::DatabaseError(format!("corrupt audit record: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_server() -> Server {
        Server::new(
            SigningKey::generate(&mut OsRng),
            db::Db::open_in_memory().unwrap(),
        )
    }

    #[test]
    fn register_is_once_only() {
        let srv = test_server();
        srv.register("alice", [1u8; 32]).unwrap();
        let err = srv.register("alice", [2u8; 32]).unwrap_err();
        assert_eq!(err.code(), 8);
        let (user, _) = srv.get_user("alice").unwrap();
        assert_eq!(user.login_key, [1u8; 32]);
    }

    #[test]
    fn register_rejects_bad_usernames() {
        let srv = test_server();
        let err = srv.register("Not Valid", [0u8; 32]).unwrap_err();
        assert_eq!(err.code(), 4);
    }

    #[test]
    fn rounds_are_unique_and_removable() {
        let srv = test_server();
        srv.insert_round(3).unwrap();
        assert_eq!(srv.insert_round(3).unwrap_err().code(), 9);
        assert!(srv.round_state(3).is_some());
        srv.remove_round(3);
        assert!(srv.round_state(3).is_none());
    }

    #[test]
    fn error_codes_are_stable() {
        let cases: Vec<(Error, u32)> = vec![
            (Error::BadRequestJson("x".into()), 1),
            (Error::RoundNotFound(9), 2),
            (Error::InvalidUserLongTermKey(3), 3),
            (Error::InvalidUsername(InvalidUsername::Empty), 4),
            (Error::NotRegistered("g".into()), 5),
            (Error::DatabaseError("d".into()), 6),
            (Error::InvalidSignature("k".into()), 7),
        ];
        for (err, code) in cases {
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn internal_errors_are_masked_on_the_wire() {
        let resp = ErrorResponse::from(&Error::DatabaseError("table kv is on fire".into()));
        assert_eq!(resp.code, 6);
        assert!(!resp.message.contains("on fire"));
        let resp = ErrorResponse::from(&Error::NotRegistered("ghost".into()));
        assert!(resp.message.contains("ghost"));
    }
}
