// This file is part of Alpenhorn and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Layered box encryption for mixnet onions. Each layer is a fresh
//! ephemeral X25519 key prefix followed by an XChaCha20-Poly1305 box; every
//! hop peels one layer and learns only the next one. All layers of a round
//! share the round nonce, which is safe because every layer uses a fresh
//! ephemeral sender key.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

/// Bytes added by one onion layer: ephemeral key prefix plus AEAD tag.
pub const LAYER_OVERHEAD: usize = 32 + 16;

/// Width of the round nonce shared by all layers.
pub const NONCE_SIZE: usize = 24;

/// Failures while removing an onion layer.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum OnionError {
    #[error("onion shorter than one layer")]
    Truncated,
    #[error("onion layer failed to authenticate")]
    BadLayer,
}

/// Nonce for client-to-mixnet traffic in `round`.
#[must_use]
pub fn forward_nonce(round: u32) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..4].copy_from_slice(&round.to_be_bytes());
    nonce
}

/// Nonce for mixnet-to-client traffic in `round`.
#[must_use]
pub fn backward_nonce(round: u32) -> [u8; NONCE_SIZE] {
    let mut nonce = forward_nonce(round);
    nonce[4] = 1;
    nonce
}

fn layer_key(shared: &[u8; 32]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(b"alpenhorn-onion-layer"), shared);
    let mut out = [0u8; 32];
    let res = hk.expand(&[], &mut out);
    debug_assert!(res.is_ok(), "HKDF expand cannot fail for 32-byte output");
    out
}

/// Seals `message` into an onion for the mixer chain `onion_keys`, listed
/// entry server first. The exit mixer's layer is innermost.
#[must_use]
pub fn seal(message: &[u8], nonce: &[u8; NONCE_SIZE], onion_keys: &[PublicKey]) -> Vec<u8> {
    let mut inner = message.to_vec();
    for hop_key in onion_keys.iter().rev() {
        let eph = StaticSecret::random_from_rng(OsRng);
        let eph_public = PublicKey::from(&eph);
        let shared = eph.diffie_hellman(hop_key);
        let aead = XChaCha20Poly1305::new(&layer_key(shared.as_bytes()).into());
        let boxed = aead
            .encrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: &inner,
                    aad: &[],
                },
            )
            .expect("aead seal cannot fail");
        let mut layer = Vec::with_capacity(32 + boxed.len());
        layer.extend_from_slice(eph_public.as_bytes());
        layer.extend_from_slice(&boxed);
        inner = layer;
    }
    inner
}

/// Removes one onion layer with a hop's private key.
pub fn peel(onion: &[u8], nonce: &[u8; NONCE_SIZE], secret: &StaticSecret) -> Result<Vec<u8>, OnionError> {
    if onion.len() < LAYER_OVERHEAD {
        return Err(OnionError::Truncated);
    }
    let mut eph_public = [0u8; 32];
    eph_public.copy_from_slice(&onion[..32]);
    let shared = secret.diffie_hellman(&PublicKey::from(eph_public));
    let aead = XChaCha20Poly1305::new(&layer_key(shared.as_bytes()).into());
    aead.decrypt(
        XNonce::from_slice(nonce),
        Payload {
            msg: &onion[32..],
            aad: &[],
        },
    )
    .map_err(|_| OnionError::BadLayer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(n: usize) -> (Vec<StaticSecret>, Vec<PublicKey>) {
        let secrets: Vec<StaticSecret> = (0..n)
            .map(|_| StaticSecret::random_from_rng(OsRng))
            .collect();
        let publics = secrets.iter().map(PublicKey::from).collect();
        (secrets, publics)
    }

    #[test]
    fn seal_and_peel_through_chain() {
        let (secrets, publics) = chain(3);
        let nonce = forward_nonce(7);
        let mut onion = seal(b"dial", &nonce, &publics);
        assert_eq!(onion.len(), 4 + 3 * LAYER_OVERHEAD);
        for secret in &secrets {
            onion = peel(&onion, &nonce, secret).unwrap();
        }
        assert_eq!(onion, b"dial");
    }

    #[test]
    fn wrong_hop_key_rejects() {
        let (_, publics) = chain(2);
        let nonce = forward_nonce(1);
        let onion = seal(b"x", &nonce, &publics);
        let outsider = StaticSecret::random_from_rng(OsRng);
        assert_eq!(peel(&onion, &nonce, &outsider), Err(OnionError::BadLayer));
    }

    #[test]
    fn nonces_separate_rounds_and_directions() {
        assert_ne!(forward_nonce(4), forward_nonce(5));
        assert_ne!(forward_nonce(4), backward_nonce(4));
        let (secrets, publics) = chain(1);
        let onion = seal(b"m", &forward_nonce(9), &publics);
        assert!(peel(&onion, &forward_nonce(8), &secrets[0]).is_err());
    }

    #[test]
    fn onion_length_is_message_independent_of_content() {
        let (_, publics) = chain(3);
        let nonce = forward_nonce(2);
        let a = seal(&[0u8; 36], &nonce, &publics);
        let b = seal(&[7u8; 36], &nonce, &publics);
        assert_eq!(a.len(), b.len());
    }
}
