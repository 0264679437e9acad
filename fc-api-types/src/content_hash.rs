use std::fmt;

/// Opaque, collision-resistant content identifier.
///
/// The hash function that produces this value is out of scope for this
/// crate (see the Non-goals in the top-level specification) -- callers
/// obtain a `ContentHash` from a `Fingerprinter` and treat it as opaque.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct ContentHash(#[serde(with = "hex_bytes_32")] pub [u8; 32]);

/// A 12-byte prefix of a [`ContentHash`], used as the primary CLDB key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct ShortHash(#[serde(with = "hex_bytes_12")] pub [u8; 12]);

impl ContentHash {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn short(&self) -> ShortHash {
        let mut buf = [0u8; 12];
        buf.copy_from_slice(&self.0[..12]);
        ShortHash(buf)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl ShortHash {
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    /// The two bytes used to index the striped per-hash lock array in the
    /// CLDB. Chosen away from byte 0, which aliases the sort order used by
    /// `enumerate_sorted_keys` and would concentrate contention on whatever
    /// range GC is currently sweeping.
    pub fn stripe_index(&self, stripes: usize) -> usize {
        let mixed = (self.0[7] as usize) ^ ((self.0[11] as usize) << 4);
        mixed % stripes
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", hex::encode(self.0))
    }
}

impl fmt::Display for ShortHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ShortHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShortHash({})", hex::encode(self.0))
    }
}

mod hex_bytes_32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let v = hex::decode(&s).map_err(serde::de::Error::custom)?;
        v.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 byte hex digest"))
    }
}

mod hex_bytes_12 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 12], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 12], D::Error> {
        let s = String::deserialize(d)?;
        let v = hex::decode(&s).map_err(serde::de::Error::custom)?;
        v.try_into()
            .map_err(|_| serde::de::Error::custom("expected 12 byte hex digest"))
    }
}
