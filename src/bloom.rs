// This file is part of Alpenhorn and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Bloom filters holding the dial tokens mixed into one mailbox. Recipients
//! download the filter for their mailbox and probe it locally, so the CDN
//! never learns which tokens were tested.

use sha2::{Digest, Sha256};
use thiserror::Error;

const HEADER_SIZE: usize = 8;

/// Malformed serialized filter.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum FilterFormatError {
    #[error("filter data shorter than header")]
    Truncated,
    #[error("filter has zero bits or zero hashes")]
    EmptyParameters,
    #[error("filter body is {got} bytes, header wants {want}")]
    BodyLength { want: usize, got: usize },
}

/// A fixed-size Bloom filter with double hashing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Filter {
    num_hashes: u32,
    num_bits: u32,
    bits: Vec<u8>,
}

impl Filter {
    /// Creates an empty filter with explicit parameters.
    #[must_use]
    pub fn new(num_bits: u32, num_hashes: u32) -> Self {
        let num_bits = num_bits.max(1);
        Self {
            num_hashes: num_hashes.max(1),
            num_bits,
            bits: vec![0u8; (num_bits as usize + 7) / 8],
        }
    }

    /// Creates an empty filter sized for `n` elements at false-positive
    /// rate `fp_rate`.
    #[must_use]
    pub fn optimal(n: usize, fp_rate: f64) -> Self {
        let n = n.max(1) as f64;
        let p = fp_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let m = (-n * p.ln() / (ln2 * ln2)).ceil().max(1.0);
        let k = (m / n * ln2).round().max(1.0);
        Self::new(m as u32, k as u32)
    }

    fn positions(&self, data: &[u8]) -> impl Iterator<Item = usize> + '_ {
        let digest = Sha256::digest(data);
        let h1 = u64::from_be_bytes(digest[..8].try_into().unwrap());
        let h2 = u64::from_be_bytes(digest[8..16].try_into().unwrap());
        let m = u64::from(self.num_bits);
        (0..u64::from(self.num_hashes))
            .map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize)
    }

    pub fn set(&mut self, data: &[u8]) {
        let positions: Vec<usize> = self.positions(data).collect();
        for pos in positions {
            self.bits[pos / 8] |= 1 << (pos % 8);
        }
    }

    /// Tests membership. False positives are possible, false negatives
    /// are not.
    #[must_use]
    pub fn test(&self, data: &[u8]) -> bool {
        self.positions(data)
            .all(|pos| self.bits[pos / 8] & (1 << (pos % 8)) != 0)
    }

    /// Encodes as `be32 num_hashes || be32 num_bits || bit bytes`.
    #[must_use]
    pub fn marshal_binary(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.bits.len());
        out.extend_from_slice(&self.num_hashes.to_be_bytes());
        out.extend_from_slice(&self.num_bits.to_be_bytes());
        out.extend_from_slice(&self.bits);
        out
    }

    pub fn unmarshal_binary(data: &[u8]) -> Result<Self, FilterFormatError> {
        if data.len() < HEADER_SIZE {
            return Err(FilterFormatError::Truncated);
        }
        let num_hashes = u32::from_be_bytes(data[..4].try_into().unwrap());
        let num_bits = u32::from_be_bytes(data[4..8].try_into().unwrap());
        if num_hashes == 0 || num_bits == 0 {
            return Err(FilterFormatError::EmptyParameters);
        }
        let want = (num_bits as usize + 7) / 8;
        let body = &data[HEADER_SIZE..];
        if body.len() != want {
            return Err(FilterFormatError::BodyLength {
                want,
                got: body.len(),
            });
        }
        Ok(Self {
            num_hashes,
            num_bits,
            bits: body.to_vec(),
        })
    }
}
