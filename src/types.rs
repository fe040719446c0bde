//! Core types for hierarchical mining
//!
//! The three-tier hierarchy, mining locations and the pending header with its
//! JSON wire encoding and content hashes.

use crate::{Error, Result};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Number of levels in the hierarchy
pub const HIERARCHY_DEPTH: usize = 3;

/// Hierarchy level, ordered from most-global to most-local
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Prime = 0,
    Region = 1,
    Zone = 2,
}

impl Tier {
    /// All tiers, most-global first
    pub const ALL: [Tier; HIERARCHY_DEPTH] = [Tier::Prime, Tier::Region, Tier::Zone];

    /// Position of the tier in per-tier tuples
    pub fn index(self) -> usize {
        self as usize
    }

    /// Tier at a tuple position
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// This tier and every more-local tier, in order
    pub fn and_below(self) -> impl Iterator<Item = Tier> {
        Self::ALL.into_iter().filter(move |t| *t >= self)
    }

    /// Lowercase tier name
    pub fn name(self) -> &'static str {
        match self {
            Tier::Prime => "prime",
            Tier::Region => "region",
            Tier::Zone => "zone",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Mining location within the hierarchy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Location {
    pub region: u8,
    pub zone: u8,
}

impl Location {
    /// Create a new location
    pub fn new(region: u8, zone: u8) -> Self {
        Self { region, zone }
    }

    /// Two-byte encoding `[region, zone]`
    pub fn to_bytes(self) -> [u8; 2] {
        [self.region, self.zone]
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {}]", self.region, self.zone)
    }
}

impl Serialize for Location {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&format!("0x{}", hex::encode(self.to_bytes())))
    }
}

impl<'de> Deserialize<'de> for Location {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = decode_hex(&s).map_err(serde::de::Error::custom)?;
        match bytes.as_slice() {
            [] => Ok(Location::default()),
            [region, zone] => Ok(Location::new(*region, *zone)),
            other => Err(serde::de::Error::custom(format!(
                "Invalid location length: expected 2 bytes, got {}",
                other.len()
            ))),
        }
    }
}

/// 32-byte content hash
pub type Hash32 = [u8; 32];

/// Candidate block header offered as mining work
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Header {
    /// Parent hash per tier
    #[serde(with = "wire::hash_array")]
    pub parent_hash: [Hash32; HIERARCHY_DEPTH],
    /// Block number per tier
    #[serde(with = "wire::quantity_array")]
    pub number: [u64; HIERARCHY_DEPTH],
    /// Difficulty per tier
    #[serde(with = "wire::big_array")]
    pub difficulty: [BigUint; HIERARCHY_DEPTH],
    /// Location the header was produced for
    pub location: Location,
    /// Reward address
    #[serde(with = "wire::bytes")]
    pub coinbase: Vec<u8>,
    /// Unix timestamp in seconds, stamped right before sealing
    #[serde(with = "wire::quantity")]
    pub time: u64,
    /// Proof-of-work nonce
    #[serde(with = "wire::quantity")]
    pub nonce: u64,
    /// Fields the miner does not interpret, carried back on submission
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Header {
    /// Block number at a tier
    pub fn number(&self, tier: Tier) -> u64 {
        self.number[tier.index()]
    }

    /// Difficulty at a tier
    pub fn difficulty(&self, tier: Tier) -> &BigUint {
        &self.difficulty[tier.index()]
    }

    /// Stamp the header time
    pub fn set_time(&mut self, time: u64) {
        self.time = time;
    }

    /// Canonical encoding of every field except time and nonce
    ///
    /// Variable-length fields carry a 64-bit big-endian length prefix. Extra
    /// fields follow in key order.
    pub fn seal_encoding(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        for parent in &self.parent_hash {
            buf.extend_from_slice(parent);
        }
        for number in &self.number {
            buf.extend_from_slice(&number.to_be_bytes());
        }
        for difficulty in &self.difficulty {
            put_prefixed(&mut buf, &difficulty.to_bytes_be());
        }
        buf.extend_from_slice(&self.location.to_bytes());
        put_prefixed(&mut buf, &self.coinbase);
        for (key, value) in &self.extra {
            put_prefixed(&mut buf, key.as_bytes());
            put_prefixed(&mut buf, value.to_string().as_bytes());
        }
        buf
    }

    /// Content identity used for de-duplication
    pub fn seal_hash(&self) -> Hash32 {
        blake3::hash(&self.seal_encoding()).into()
    }

    /// Hash input shared by every nonce: seal encoding followed by the time
    pub fn pow_prefix(&self) -> Vec<u8> {
        let mut prefix = self.seal_encoding();
        prefix.extend_from_slice(&self.time.to_be_bytes());
        prefix
    }

    /// Full hash including time and nonce
    pub fn hash(&self) -> Hash32 {
        pow_hash(&self.pow_prefix(), self.nonce)
    }
}

fn put_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
    buf.extend_from_slice(bytes);
}

/// Hash a precomputed prefix with a candidate nonce
pub fn pow_hash(prefix: &[u8], nonce: u64) -> Hash32 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(prefix);
    hasher.update(&nonce.to_be_bytes());
    hasher.finalize().into()
}

/// Render a hash as 0x-prefixed hex
pub fn hash_hex(hash: &Hash32) -> String {
    format!("0x{}", hex::encode(hash))
}

fn decode_hex(s: &str) -> Result<Vec<u8>> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(digits).map_err(|e| Error::header(format!("Invalid hex {:?}: {}", s, e)))
}

fn parse_quantity(s: &str) -> Result<u64> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(digits, 16)
        .map_err(|e| Error::header(format!("Invalid quantity {:?}: {}", s, e)))
}

fn parse_big(s: &str) -> Result<BigUint> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() {
        return Ok(BigUint::default());
    }
    BigUint::parse_bytes(digits.as_bytes(), 16)
        .ok_or_else(|| Error::header(format!("Invalid big quantity {:?}", s)))
}

/// Serde adapters for the hex-based JSON encoding
mod wire {
    use super::{decode_hex, parse_big, parse_quantity, Hash32, HIERARCHY_DEPTH};
    use num_bigint::BigUint;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    fn pad<T: Default, D: serde::de::Error>(
        mut values: Vec<T>,
    ) -> Result<[T; HIERARCHY_DEPTH], D> {
        if values.len() > HIERARCHY_DEPTH {
            return Err(D::custom(format!(
                "expected at most {} entries, got {}",
                HIERARCHY_DEPTH,
                values.len()
            )));
        }
        values.resize_with(HIERARCHY_DEPTH, T::default);
        values
            .try_into()
            .map_err(|_| D::custom("tier tuple length mismatch"))
    }

    pub mod quantity {
        use super::*;

        pub fn serialize<S: Serializer>(value: &u64, s: S) -> Result<S::Ok, S::Error> {
            s.serialize_str(&format!("{:#x}", value))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
            let s = String::deserialize(d)?;
            parse_quantity(&s).map_err(D::Error::custom)
        }
    }

    pub mod bytes {
        use super::*;

        pub fn serialize<S: Serializer>(value: &[u8], s: S) -> Result<S::Ok, S::Error> {
            s.serialize_str(&format!("0x{}", hex::encode(value)))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
            let s = String::deserialize(d)?;
            decode_hex(&s).map_err(D::Error::custom)
        }
    }

    pub mod quantity_array {
        use super::*;

        pub fn serialize<S: Serializer>(
            values: &[u64; HIERARCHY_DEPTH],
            s: S,
        ) -> Result<S::Ok, S::Error> {
            s.collect_seq(values.iter().map(|v| format!("{:#x}", v)))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<[u64; HIERARCHY_DEPTH], D::Error> {
            let raw = Vec::<String>::deserialize(d)?;
            let values = raw
                .iter()
                .map(|s| parse_quantity(s))
                .collect::<crate::Result<Vec<_>>>()
                .map_err(D::Error::custom)?;
            pad::<_, D::Error>(values)
        }
    }

    pub mod big_array {
        use super::*;

        pub fn serialize<S: Serializer>(
            values: &[BigUint; HIERARCHY_DEPTH],
            s: S,
        ) -> Result<S::Ok, S::Error> {
            s.collect_seq(values.iter().map(|v| format!("0x{}", v.to_str_radix(16))))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<[BigUint; HIERARCHY_DEPTH], D::Error> {
            let raw = Vec::<Option<String>>::deserialize(d)?;
            let values = raw
                .iter()
                .map(|s| match s {
                    Some(s) => parse_big(s),
                    None => Ok(BigUint::default()),
                })
                .collect::<crate::Result<Vec<_>>>()
                .map_err(D::Error::custom)?;
            pad::<_, D::Error>(values)
        }
    }

    pub mod hash_array {
        use super::*;

        pub fn serialize<S: Serializer>(
            values: &[Hash32; HIERARCHY_DEPTH],
            s: S,
        ) -> Result<S::Ok, S::Error> {
            s.collect_seq(values.iter().map(|v| format!("0x{}", hex::encode(v))))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<[Hash32; HIERARCHY_DEPTH], D::Error> {
            let raw = Vec::<String>::deserialize(d)?;
            let mut values = Vec::with_capacity(raw.len());
            for s in &raw {
                let bytes = decode_hex(s).map_err(D::Error::custom)?;
                let hash: Hash32 = bytes.as_slice().try_into().map_err(|_| {
                    D::Error::custom(format!("expected 32-byte hash, got {} bytes", bytes.len()))
                })?;
                values.push(hash);
            }
            pad::<_, D::Error>(values)
        }
    }
}
