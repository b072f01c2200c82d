// This file is part of Alpenhorn and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! BLS signatures over BLS12-381. Public keys live in G2, signatures in G1.
//! Attestations from distinct PKG servers sign distinct messages (the
//! signing key is embedded in the message), so signatures can later be
//! aggregated by summation without rogue-key defenses.

use blstrs::{pairing, G1Affine, G1Projective, G2Affine, G2Projective, Scalar};
use ff::Field;
use group::{prime::PrimeCurveAffine, Curve, Group};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Domain separation tag used when hashing attestation messages to G1.
pub const SIG_DST: &[u8] = b"BLS_SIG_BLS12381G1_XMD:SHA-256_SSWU_RO_NUL_";

/// Size of a compressed G2 public key.
pub const PUBLIC_KEY_SIZE: usize = 96;
/// Size of a compressed G1 signature.
pub const SIGNATURE_SIZE: usize = 48;

/// Error decoding a compressed curve point.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("invalid BLS {0} encoding")]
pub struct DecodeError(&'static str);

/// A BLS signing key share held by one PKG server for one round.
#[derive(Clone, Debug)]
pub struct PrivateKey(Scalar);

/// A BLS public key, also the attest key embedded in attestation messages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PublicKey(G2Projective);

/// A BLS signature, possibly an aggregate over distinct messages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Signature(G1Projective);

fn hash_to_g1(msg: &[u8]) -> G1Projective {
    G1Projective::hash_to_curve(msg, SIG_DST, &[])
}

impl PrivateKey {
    pub fn generate(rng: &mut impl RngCore) -> Self {
        Self(Scalar::random(rng))
    }

    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(G2Projective::generator() * self.0)
    }

    #[must_use]
    pub fn sign(&self, msg: &[u8]) -> Signature {
        Signature(hash_to_g1(msg) * self.0)
    }
}

impl PublicKey {
    #[must_use]
    pub fn verify(&self, msg: &[u8], sig: &Signature) -> bool {
        let h = hash_to_g1(msg);
        pairing(&sig.0.to_affine(), &G2Affine::generator())
            == pairing(&h.to_affine(), &self.0.to_affine())
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0.to_affine().to_compressed()
    }

    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_SIZE]) -> Result<Self, DecodeError> {
        let point = Option::<G2Affine>::from(G2Affine::from_compressed(bytes))
            .ok_or(DecodeError("public key"))?;
        Ok(Self(point.to_curve()))
    }
}

impl Signature {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; SIGNATURE_SIZE] {
        self.0.to_affine().to_compressed()
    }

    pub fn from_bytes(bytes: &[u8; SIGNATURE_SIZE]) -> Result<Self, DecodeError> {
        let point = Option::<G1Affine>::from(G1Affine::from_compressed(bytes))
            .ok_or(DecodeError("signature"))?;
        Ok(Self(point.to_curve()))
    }
}

/// Sums signatures over distinct messages into one aggregate.
#[must_use]
pub fn aggregate(sigs: &[Signature]) -> Signature {
    let mut agg = G1Projective::identity();
    for sig in sigs {
        agg += sig.0;
    }
    Signature(agg)
}

/// Verifies an aggregate signature where `keys[i]` signed `msgs[i]`.
#[must_use]
pub fn verify_aggregate(keys: &[PublicKey], msgs: &[&[u8]], sig: &Signature) -> bool {
    if keys.len() != msgs.len() || keys.is_empty() {
        return false;
    }
    let mut expect = pairing(&hash_to_g1(msgs[0]).to_affine(), &keys[0].0.to_affine());
    for (key, msg) in keys.iter().zip(msgs.iter()).skip(1) {
        expect += pairing(&hash_to_g1(msg).to_affine(), &key.0.to_affine());
    }
    pairing(&sig.0.to_affine(), &G2Affine::generator()) == expect
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(self.to_bytes()))
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let text = String::deserialize(d)?;
        let bytes: [u8; PUBLIC_KEY_SIZE] = hex::decode(&text)
            .map_err(serde::de::Error::custom)?
            .try_into()
            .map_err(|_| serde::de::Error::custom("bad public key length"))?;
        Self::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(self.to_bytes()))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let text = String::deserialize(d)?;
        let bytes: [u8; SIGNATURE_SIZE] = hex::decode(&text)
            .map_err(serde::de::Error::custom)?
            .try_into()
            .map_err(|_| serde::de::Error::custom("bad signature length"))?;
        Self::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn sign_verify_roundtrip() {
        let sk = PrivateKey::generate(&mut OsRng);
        let pk = sk.public_key();
        let sig = sk.sign(b"attest");
        assert!(pk.verify(b"attest", &sig));
        assert!(!pk.verify(b"attest?", &sig));
        let other = PrivateKey::generate(&mut OsRng).public_key();
        assert!(!other.verify(b"attest", &sig));
    }

    #[test]
    fn encoding_roundtrip() {
        let sk = PrivateKey::generate(&mut OsRng);
        let pk = sk.public_key();
        let sig = sk.sign(b"msg");
        assert_eq!(PublicKey::from_bytes(&pk.to_bytes()).unwrap(), pk);
        assert_eq!(Signature::from_bytes(&sig.to_bytes()).unwrap(), sig);
        let json = serde_json::to_string(&pk).unwrap();
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pk);
    }

    #[test]
    fn aggregate_over_distinct_messages() {
        let keys: Vec<PrivateKey> = (0..3).map(|_| PrivateKey::generate(&mut OsRng)).collect();
        let msgs: Vec<Vec<u8>> = (0..3u8).map(|i| vec![b'm', i]).collect();
        let sigs: Vec<Signature> = keys
            .iter()
            .zip(msgs.iter())
            .map(|(k, m)| k.sign(m))
            .collect();
        let agg = aggregate(&sigs);
        let pubs: Vec<PublicKey> = keys.iter().map(PrivateKey::public_key).collect();
        let refs: Vec<&[u8]> = msgs.iter().map(Vec::as_slice).collect();
        assert!(verify_aggregate(&pubs, &refs, &agg));
        let swapped: Vec<&[u8]> = vec![&msgs[1], &msgs[0], &msgs[2]];
        assert!(!verify_aggregate(&pubs, &swapped, &agg));
    }
}
