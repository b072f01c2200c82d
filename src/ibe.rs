// This file is part of Alpenhorn and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Boneh-Franklin style identity-based key material over BLS12-381. The PKG
//! holds a per-round master secret and extracts the private key for an
//! identity string on demand; messages encrypted upstream to that identity
//! become readable only after extraction.

use blstrs::{pairing, G1Affine, G1Projective, G2Affine, G2Projective, Scalar};
use ff::Field;
use group::{prime::PrimeCurveAffine, Curve, Group};
use rand::RngCore;
use thiserror::Error;

/// Domain separation tag for hashing identity strings into G1. Distinct
/// from the attestation signature tag so the two schemes never share a
/// curve preimage.
pub const IDENTITY_DST: &[u8] = b"ALPENHORN_IBE_BLS12381G1_XMD:SHA-256_SSWU_RO_ID_";

/// Serialized width of an extracted identity private key (compressed G1).
pub const IDENTITY_KEY_SIZE: usize = 48;
/// Serialized width of a master public key (compressed G2).
pub const MASTER_PUBLIC_KEY_SIZE: usize = 96;

/// Error decoding serialized IBE key material.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("invalid IBE {0} encoding")]
pub struct DecodeError(&'static str);

/// Per-round master secret held only by the PKG.
#[derive(Clone, Debug)]
pub struct MasterPrivateKey(Scalar);

/// Public counterpart of the master secret, published per round.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MasterPublicKey(G2Projective);

/// The private key for one identity under one round's master key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IdentityPrivateKey(G1Projective);

fn hash_identity(id: &[u8]) -> G1Projective {
    G1Projective::hash_to_curve(id, IDENTITY_DST, &[])
}

/// Generates a fresh master keypair for a round.
pub fn master_keygen(rng: &mut impl RngCore) -> (MasterPrivateKey, MasterPublicKey) {
    let secret = Scalar::random(rng);
    let public = G2Projective::generator() * secret;
    (MasterPrivateKey(secret), MasterPublicKey(public))
}

/// Extracts the private key for `identity` under the master secret.
#[must_use]
pub fn extract(master: &MasterPrivateKey, identity: &[u8]) -> IdentityPrivateKey {
    IdentityPrivateKey(hash_identity(identity) * master.0)
}

impl MasterPublicKey {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; MASTER_PUBLIC_KEY_SIZE] {
        self.0.to_affine().to_compressed()
    }

    pub fn from_bytes(bytes: &[u8; MASTER_PUBLIC_KEY_SIZE]) -> Result<Self, DecodeError> {
        let point = Option::<G2Affine>::from(G2Affine::from_compressed(bytes))
            .ok_or(DecodeError("master public key"))?;
        Ok(Self(point.to_curve()))
    }
}

impl IdentityPrivateKey {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; IDENTITY_KEY_SIZE] {
        self.0.to_affine().to_compressed()
    }

    pub fn from_bytes(bytes: &[u8; IDENTITY_KEY_SIZE]) -> Result<Self, DecodeError> {
        let point = Option::<G1Affine>::from(G1Affine::from_compressed(bytes))
            .ok_or(DecodeError("identity key"))?;
        Ok(Self(point.to_curve()))
    }

    /// Checks that this key was extracted for `identity` under the master
    /// key `master`: e(d_id, g2) == e(H(id), mpk).
    #[must_use]
    pub fn verify(&self, identity: &[u8], master: &MasterPublicKey) -> bool {
        pairing(&self.0.to_affine(), &G2Affine::generator())
            == pairing(&hash_identity(identity).to_affine(), &master.0.to_affine())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn extraction_is_deterministic() {
        let (msk, _) = master_keygen(&mut OsRng);
        let a = extract(&msk, b"alice");
        let b = extract(&msk, b"alice");
        assert_eq!(a.to_bytes(), b.to_bytes());
        assert_ne!(a.to_bytes(), extract(&msk, b"bob").to_bytes());
    }

    #[test]
    fn extracted_key_matches_master() {
        let (msk, mpk) = master_keygen(&mut OsRng);
        let key = extract(&msk, b"alice");
        assert!(key.verify(b"alice", &mpk));
        assert!(!key.verify(b"bob", &mpk));
        let (_, other) = master_keygen(&mut OsRng);
        assert!(!key.verify(b"alice", &other));
    }

    #[test]
    fn key_encoding_roundtrip() {
        let (msk, mpk) = master_keygen(&mut OsRng);
        let key = extract(&msk, b"carol");
        assert_eq!(IdentityPrivateKey::from_bytes(&key.to_bytes()).unwrap(), key);
        assert_eq!(MasterPublicKey::from_bytes(&mpk.to_bytes()).unwrap(), mpk);
        assert!(IdentityPrivateKey::from_bytes(&[0xffu8; 48]).is_err());
    }
}
