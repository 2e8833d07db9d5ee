//! Kademlia node Id or a lookup target
use rand::Rng;
use sha1_smol::Sha1;
use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::{Error, Result};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
/// The size of node IDs in bits, which is also the maximum depth of the bucket trie.
pub const ID_BITS: usize = ID_SIZE * 8;
pub const MAX_DISTANCE: u8 = ID_BITS as u8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Kademlia node Id or a lookup target
pub struct Id([u8; ID_SIZE]);

impl Id {
    /// The all-zero id, which is also the prefix of the root bucket.
    pub const ZERO: Id = Id([0; ID_SIZE]);

    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE](crate::common::ID_SIZE).
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Id(tmp))
    }

    /// Derive the Id under which an arbitrary key is stored: the SHA-1 hash of the key.
    pub fn from_key(key: &[u8]) -> Id {
        let mut hasher = Sha1::new();
        hasher.update(key);

        Id(hasher.digest().bytes())
    }

    /// Simplified XOR distance between this Id and a target Id.
    ///
    /// The distance is the number of trailing non zero bits in the XOR result.
    ///
    /// Distance to self is 0
    /// Distance to the furthest Id is 160
    /// Distance to an Id with 5 leading matching bits is 155
    pub fn distance(&self, other: &Id) -> u8 {
        MAX_DISTANCE - self.common_prefix_len(other) as u8
    }

    /// Number of leading bits shared by both ids.
    pub fn common_prefix_len(&self, other: &Id) -> usize {
        for i in 0..ID_SIZE {
            let a = self.0[i];
            let b = other.0[i];

            if a != b {
                // leading zeros so far + leading zeros of this byte
                return i * 8 + (a ^ b).leading_zeros() as usize;
            }
        }

        ID_BITS
    }

    /// Full XOR of both ids, comparable as an unsigned big-endian integer.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            result[i] = a ^ b;
        }

        Id(result)
    }

    /// Returns `true` if `self` is strictly closer to `target` than `other` is.
    pub fn is_closer(&self, other: &Id, target: &Id) -> bool {
        self.xor(target) < other.xor(target)
    }

    /// Value of the bit at `index`, counting from the most significant bit.
    pub fn bit(&self, index: usize) -> bool {
        debug_assert!(index < ID_BITS);

        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Returns a copy of this id with the bit at `index` set to `value`.
    pub fn with_bit(&self, index: usize, value: bool) -> Id {
        let mut bytes = self.0;
        let mask = 0x80 >> (index % 8);

        if value {
            bytes[index / 8] |= mask;
        } else {
            bytes[index / 8] &= !mask;
        }

        Id(bytes)
    }

    /// Keep the first `depth` bits and zero everything else.
    pub fn masked(&self, depth: usize) -> Id {
        let mut bytes = self.0;

        for (i, byte) in bytes.iter_mut().enumerate() {
            let start = i * 8;

            if start >= depth {
                *byte = 0;
            } else if start + 8 > depth {
                *byte &= 0xff << (8 - (depth - start));
            }
        }

        Id(bytes)
    }

    /// Returns `true` if the first `depth` bits of both ids are equal.
    pub fn has_prefix(&self, prefix: &Id, depth: usize) -> bool {
        self.common_prefix_len(prefix) >= depth
    }

    /// A random Id sharing the first `depth` bits with `prefix`.
    pub fn random_with_prefix(prefix: &Id, depth: usize) -> Id {
        let random = Id::random();
        let mut bytes = random.0;

        for (i, byte) in bytes.iter_mut().enumerate() {
            let start = i * 8;

            if start + 8 <= depth {
                *byte = prefix.0[i];
            } else if start < depth {
                let keep = 0xff_u8 << (8 - (depth - start));
                *byte = (prefix.0[i] & keep) | (*byte & !keep);
            }
        }

        Id(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }

        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id> {
        if s.len() != ID_SIZE * 2 {
            return Err(Error::InvalidIdEncoding(s.to_string()));
        }

        let mut bytes = [0_u8; ID_SIZE];

        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = s
                .get(i * 2..i * 2 + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| Error::InvalidIdEncoding(s.to_string()))?;
        }

        Ok(Id(bytes))
    }
}
