// This file is part of Alpenhorn and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Extraction requests, replies, and the extract engine. Signing inputs
//! are fixed-prefix concatenations so no two message types ever share a
//! preimage, and every request binds the PKG's own signing key so a
//! request signed for one server is worthless at another.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use super::{Error, LastExtraction, Server};
use crate::{bls, ibe, valid_username_to_identity, Identity};

const ZERO_NONCE: [u8; 24] = [0u8; 24];

/// A request for one round's identity key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractArgs {
    pub round: u32,
    pub username: String,
    /// Box key the extracted IBE private key is encrypted to.
    #[serde(with = "crate::hexarray")]
    pub return_key: [u8; 32],
    /// The long-term signing key the PKG attests to.
    #[serde(with = "crate::hexbytes")]
    pub user_long_term_key: Vec<u8>,
    /// Ties the request to a single PKG. Set locally by both peers and
    /// never transmitted.
    #[serde(skip)]
    pub server_signing_key: [u8; 32],
    /// Signs everything above with the user's login key.
    #[serde(with = "crate::hexarray")]
    pub signature: [u8; 64],
}

impl ExtractArgs {
    fn msg(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(11 + 32 + 4 + 64 + 32 + self.user_long_term_key.len());
        buf.extend_from_slice(b"ExtractArgs");
        buf.extend_from_slice(&self.server_signing_key);
        buf.extend_from_slice(&self.round.to_be_bytes());
        buf.extend_from_slice(&valid_username_to_identity(&self.username));
        buf.extend_from_slice(&self.return_key);
        buf.extend_from_slice(&self.user_long_term_key);
        buf
    }

    pub fn sign(&mut self, login_key: &SigningKey) {
        self.signature = login_key.sign(&self.msg()).to_bytes();
    }

    #[must_use]
    pub fn verify(&self, login_key: &VerifyingKey) -> bool {
        login_key
            .verify(&self.msg(), &Signature::from_bytes(&self.signature))
            .is_ok()
    }
}

/// The PKG's answer to a successful extraction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractReply {
    pub round: u32,
    pub username: String,
    /// `ephemeral public key || box(identity key)`.
    #[serde(with = "crate::hexbytes")]
    pub encrypted_private_key: Vec<u8>,
    /// BLS signature over the identity attestation.
    pub identity_sig: bls::Signature,
    /// Server signature over the reply.
    #[serde(with = "crate::hexarray")]
    pub signature: [u8; 64],
}

impl ExtractReply {
    fn msg(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + 4 + 64 + self.encrypted_private_key.len());
        buf.extend_from_slice(b"ExtractReply");
        buf.extend_from_slice(&self.round.to_be_bytes());
        buf.extend_from_slice(&valid_username_to_identity(&self.username));
        buf.extend_from_slice(&self.encrypted_private_key);
        buf
    }

    pub fn sign(&mut self, server_key: &SigningKey) {
        self.signature = server_key.sign(&self.msg()).to_bytes();
    }

    #[must_use]
    pub fn verify(&self, server_key: &VerifyingKey) -> bool {
        server_key
            .verify(&self.msg(), &Signature::from_bytes(&self.signature))
            .is_ok()
    }
}

/// A registration request creating the user record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterArgs {
    pub username: String,
    #[serde(with = "crate::hexarray")]
    pub login_key: [u8; 32],
}

/// Attests that `user_long_term_key` belongs to `user_identity`. The
/// attest key is part of the message so attestations from different PKG
/// servers are distinct, which BLS aggregation requires.
#[derive(Clone, Debug)]
pub struct Attestation {
    pub attest_key: bls::PublicKey,
    pub user_identity: Identity,
    pub user_long_term_key: [u8; 32],
}

impl Attestation {
    #[must_use]
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(bls::PUBLIC_KEY_SIZE + 64 + 32);
        buf.extend_from_slice(&self.attest_key.to_bytes());
        buf.extend_from_slice(&self.user_identity);
        buf.extend_from_slice(&self.user_long_term_key);
        buf
    }
}

fn return_box_key(shared: &[u8; 32]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(b"alpenhorn-pkg-return"), shared);
    let mut out = [0u8; 32];
    let res = hk.expand(&[], &mut out);
    debug_assert!(res.is_ok(), "HKDF expand cannot fail for 32-byte output");
    out
}

/// Encrypts the extracted key to the caller's return key under a fresh
/// ephemeral key. The zero nonce is safe because the ephemeral secret is
/// never reused.
fn seal_to_return_key(return_key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    let eph = StaticSecret::random_from_rng(OsRng);
    let eph_public = PublicKey::from(&eph);
    let shared = eph.diffie_hellman(&PublicKey::from(*return_key));
    let aead = XChaCha20Poly1305::new(&return_box_key(shared.as_bytes()).into());
    let boxed = aead
        .encrypt(XNonce::from_slice(&ZERO_NONCE), plaintext)
        .expect("aead seal cannot fail");
    let mut out = Vec::with_capacity(32 + boxed.len());
    out.extend_from_slice(eph_public.as_bytes());
    out.extend_from_slice(&boxed);
    out
}

/// Inverse of the return-key box, used by the extraction client.
pub(crate) fn open_from_return_key(
    return_secret: &StaticSecret,
    ciphertext: &[u8],
) -> Option<Vec<u8>> {
    if ciphertext.len() < 32 + 16 {
        return None;
    }
    let mut eph_public = [0u8; 32];
    eph_public.copy_from_slice(&ciphertext[..32]);
    let shared = return_secret.diffie_hellman(&PublicKey::from(eph_public));
    let aead = XChaCha20Poly1305::new(&return_box_key(shared.as_bytes()).into());
    aead.decrypt(XNonce::from_slice(&ZERO_NONCE), &ciphertext[32..])
        .ok()
}

impl Server {
    /// Authenticates an extraction request and answers it. Exactly one
    /// database write happens per successful call: the audit record, which
    /// commits before any reply bytes exist.
    pub fn extract(&self, args: &ExtractArgs) -> Result<ExtractReply, Error> {
        let st = self
            .round_state(args.round)
            .ok_or(Error::RoundNotFound(args.round))?;

        if args.user_long_term_key.len() != 32 {
            return Err(Error::InvalidUserLongTermKey(args.user_long_term_key.len()));
        }

        let (user, id) = self.get_user(&args.username)?;
        let login_key = VerifyingKey::from_bytes(&user.login_key)
            .map_err(|_| Error::InvalidSignature(hex::encode(user.login_key)))?;
        if !args.verify(&login_key) {
            return Err(Error::InvalidSignature(hex::encode(user.login_key)));
        }

        let entry = LastExtraction {
            round: args.round,
            unix_time: unix_now(),
        };
        self.record_last_extraction(&id, &entry)?;

        let id_key = ibe::extract(&st.master_key, &id);
        let encrypted_private_key = seal_to_return_key(&args.return_key, &id_key.to_bytes());

        let mut user_long_term_key = [0u8; 32];
        user_long_term_key.copy_from_slice(&args.user_long_term_key);
        let attestation = Attestation {
            attest_key: st.bls_public,
            user_identity: id,
            user_long_term_key,
        };
        let identity_sig = st.bls_key.sign(&attestation.marshal());

        let mut reply = ExtractReply {
            round: args.round,
            username: args.username.clone(),
            encrypted_private_key,
            identity_sig,
            signature: [0u8; 64],
        };
        reply.sign(self.signing_key());
        Ok(reply)
    }
}

fn unix_now() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::db::Db;
    use crate::username_to_identity;

    pub(crate) struct Registered {
        pub server: Server,
        pub login_key: SigningKey,
    }

    pub(crate) fn server_with_user(username: &str) -> Registered {
        let server = Server::new(SigningKey::generate(&mut OsRng), Db::open_in_memory().unwrap());
        let login_key = SigningKey::generate(&mut OsRng);
        server
            .register(username, login_key.verifying_key().to_bytes())
            .unwrap();
        Registered { server, login_key }
    }

    pub(crate) fn signed_args(
        server: &Server,
        login_key: &SigningKey,
        round: u32,
        username: &str,
        return_key: [u8; 32],
        user_long_term_key: Vec<u8>,
    ) -> ExtractArgs {
        let mut args = ExtractArgs {
            round,
            username: username.into(),
            return_key,
            user_long_term_key,
            server_signing_key: server.public_key().to_bytes(),
            signature: [0u8; 64],
        };
        args.sign(login_key);
        args
    }

    #[test]
    fn extract_round_7_full_reply() {
        let reg = server_with_user("alice");
        reg.server.insert_round(7).unwrap();
        let return_secret = StaticSecret::from([0x01u8; 32]);
        let return_key = PublicKey::from(&return_secret).to_bytes();
        let args = signed_args(&reg.server, &reg.login_key, 7, "alice", return_key, vec![0x03; 32]);

        let reply = reg.server.extract(&args).unwrap();
        assert_eq!(reply.round, 7);
        assert_eq!(reply.username, "alice");
        assert_eq!(
            reply.encrypted_private_key.len(),
            32 + ibe::IDENTITY_KEY_SIZE + 16
        );
        assert!(reply.verify(&reg.server.public_key()));

        // the box opens to the identity key for "alice"
        let opened = open_from_return_key(&return_secret, &reply.encrypted_private_key).unwrap();
        let id_key = ibe::IdentityPrivateKey::from_bytes(&opened.try_into().unwrap()).unwrap();
        let st = reg.server.round_state(7).unwrap();
        let id = username_to_identity("alice").unwrap();
        assert!(id_key.verify(&id, &st.master_public));

        // the BLS attestation verifies under the round's attest key
        let attestation = Attestation {
            attest_key: st.bls_public,
            user_identity: id,
            user_long_term_key: [0x03; 32],
        };
        assert!(st.bls_public.verify(&attestation.marshal(), &reply.identity_sig));

        // audit record landed
        let audit = reg.server.last_extraction(&id).unwrap().unwrap();
        assert_eq!(audit.round, 7);
        assert!(audit.unix_time > 0);
    }

    #[test]
    fn extract_unknown_round_is_clean() {
        let reg = server_with_user("alice");
        let args = signed_args(&reg.server, &reg.login_key, 99, "alice", [0x02; 32], vec![0x03; 32]);
        let err = reg.server.extract(&args).unwrap_err();
        assert_eq!(err.code(), 2);
        let id = username_to_identity("alice").unwrap();
        assert_eq!(reg.server.last_extraction(&id).unwrap(), None);
    }

    #[test]
    fn extract_unregistered_user() {
        let reg = server_with_user("alice");
        reg.server.insert_round(1).unwrap();
        let args = signed_args(&reg.server, &reg.login_key, 1, "ghost", [0x02; 32], vec![0x03; 32]);
        assert_eq!(reg.server.extract(&args).unwrap_err().code(), 5);
    }

    #[test]
    fn extract_rejects_wrong_login_key() {
        let reg = server_with_user("alice");
        reg.server.insert_round(1).unwrap();
        let imposter = SigningKey::generate(&mut OsRng);
        let args = signed_args(&reg.server, &imposter, 1, "alice", [0x02; 32], vec![0x03; 32]);
        assert_eq!(reg.server.extract(&args).unwrap_err().code(), 7);
        // failed auth leaves no audit record
        let id = username_to_identity("alice").unwrap();
        assert_eq!(reg.server.last_extraction(&id).unwrap(), None);
    }

    #[test]
    fn extract_rejects_bad_long_term_key_length() {
        let reg = server_with_user("alice");
        reg.server.insert_round(1).unwrap();
        let args = signed_args(&reg.server, &reg.login_key, 1, "alice", [0x02; 32], vec![0x03; 31]);
        assert_eq!(reg.server.extract(&args).unwrap_err().code(), 3);
    }

    #[test]
    fn request_is_bound_to_one_server() {
        let reg = server_with_user("alice");
        let other = Server::new(SigningKey::generate(&mut OsRng), Db::open_in_memory().unwrap());
        other
            .register("alice", reg.login_key.verifying_key().to_bytes())
            .unwrap();
        other.insert_round(1).unwrap();
        reg.server.insert_round(1).unwrap();

        // signed against reg.server, replayed byte-identically at `other`
        let args = signed_args(&reg.server, &reg.login_key, 1, "alice", [0x02; 32], vec![0x03; 32]);
        let wire = serde_json::to_string(&args).unwrap();
        let mut replayed: ExtractArgs = serde_json::from_str(&wire).unwrap();
        replayed.server_signing_key = other.public_key().to_bytes();
        assert_eq!(other.extract(&replayed).unwrap_err().code(), 7);
        // and still fine at the intended server
        assert!(reg.server.extract(&args).is_ok());
    }

    #[test]
    fn signing_preimages_are_domain_separated() {
        let args = ExtractArgs {
            round: 1,
            username: "alice".into(),
            return_key: [0u8; 32],
            user_long_term_key: vec![0u8; 32],
            server_signing_key: [0u8; 32],
            signature: [0u8; 64],
        };
        let reply = ExtractReply {
            round: 1,
            username: "alice".into(),
            encrypted_private_key: vec![0u8; 96],
            identity_sig: bls::PrivateKey::generate(&mut OsRng).sign(b"x"),
            signature: [0u8; 64],
        };
        let attestation = Attestation {
            attest_key: bls::PrivateKey::generate(&mut OsRng).public_key(),
            user_identity: [0u8; 64],
            user_long_term_key: [0u8; 32],
        };
        let a = args.msg();
        let r = reply.msg();
        let t = attestation.marshal();
        assert!(a.starts_with(b"ExtractArgs"));
        assert!(r.starts_with(b"ExtractReply"));
        assert_ne!(a, r);
        assert_ne!(a, t);
        assert_ne!(r, t);
        // attestations start with a compressed G2 point, whose top bit is
        // set, so they can never collide with the ASCII prefixes above
        assert!(t[0] & 0x80 != 0);
    }

    #[test]
    fn reply_signature_covers_ciphertext() {
        let reg = server_with_user("alice");
        reg.server.insert_round(2).unwrap();
        let args = signed_args(&reg.server, &reg.login_key, 2, "alice", [0x02; 32], vec![0x03; 32]);
        let mut reply = reg.server.extract(&args).unwrap();
        reply.encrypted_private_key[40] ^= 1;
        assert!(!reply.verify(&reg.server.public_key()));
    }

    #[test]
    fn return_box_needs_matching_secret() {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret).to_bytes();
        let boxed = seal_to_return_key(&public, b"identity key bytes");
        assert_eq!(
            open_from_return_key(&secret, &boxed).as_deref(),
            Some(&b"identity key bytes"[..])
        );
        let wrong = StaticSecret::random_from_rng(OsRng);
        assert!(open_from_return_key(&wrong, &boxed).is_none());
        assert!(open_from_return_key(&secret, &boxed[..40]).is_none());
    }
}
