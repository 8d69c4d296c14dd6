use crate::polynomial::Polynomial;
use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Content identifier: the BLAKE3 digest of a plaintext buffer.
///
/// Every stored object is keyed by an `Id`. Two buffers with equal content
/// always hash to the same `Id`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id([u8; 32]);

impl Id {
    pub fn hash(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn short_string(&self) -> String {
        self.to_hex().chars().take(8).collect()
    }
}

impl From<blake3::Hash> for Id {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl FromStr for Id {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut array = [0u8; 32];
        hex::decode_to_slice(s, &mut array)?;
        Ok(Self(array))
    }
}

impl Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Id::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.short_string())
    }
}

/// Kind of a packed blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobKind {
    Data,
    Tree,
}

impl fmt::Display for BlobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobKind::Data => write!(f, "data"),
            BlobKind::Tree => write!(f, "tree"),
        }
    }
}

/// The dedup key: a blob is the same blob only if both id and kind match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobHandle {
    pub id: Id,
    pub kind: BlobKind,
}

impl BlobHandle {
    pub fn new(id: Id, kind: BlobKind) -> Self {
        Self { id, kind }
    }
}

impl fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id.short_string())
    }
}

/// Canonical encoding of structured values: compact JSON plus a trailing
/// newline. Field order follows declaration order and sequences keep their
/// order, so equal values always encode to equal bytes.
pub fn encode_canonical<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut data = serde_json::to_vec(value)?;
    data.push(b'\n');
    Ok(data)
}

pub const REPO_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    pub version: u32,
    pub id: String,
    pub chunker_polynomial: Polynomial,
    pub min_chunk_size: u32,
    pub avg_chunk_size: u32,
    pub max_chunk_size: u32,
    pub max_pack_size: u64,
}

impl RepoConfig {
    pub fn with_polynomial(polynomial: Polynomial) -> Self {
        Self {
            version: REPO_VERSION,
            id: uuid::Uuid::new_v4().to_string(),
            chunker_polynomial: polynomial,
            min_chunk_size: 512 * 1024,
            avg_chunk_size: 1024 * 1024,
            max_chunk_size: 8 * 1024 * 1024,
            max_pack_size: 16 * 1024 * 1024,
        }
    }

    pub fn with_chunk_sizes(mut self, min: u32, avg: u32, max: u32) -> Self {
        self.min_chunk_size = min;
        self.avg_chunk_size = avg;
        self.max_chunk_size = max;
        self
    }

    pub fn with_max_pack_size(mut self, max_pack_size: u64) -> Self {
        self.max_pack_size = max_pack_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != REPO_VERSION {
            return Err(Error::InvalidFormatVersion {
                version: self.version,
            });
        }
        if !self.chunker_polynomial.is_irreducible() {
            return Err(Error::InvalidPolynomial(self.chunker_polynomial.value()));
        }
        // bounds accepted by fastcdc
        if !(64..=1_048_576).contains(&self.min_chunk_size)
            || !(256..=4_194_304).contains(&self.avg_chunk_size)
            || !(1024..=16_777_216).contains(&self.max_chunk_size)
        {
            return Err(Error::Other(format!(
                "chunk sizes outside the chunker limits: min {} avg {} max {}",
                self.min_chunk_size, self.avg_chunk_size, self.max_chunk_size
            )));
        }
        if !(self.min_chunk_size <= self.avg_chunk_size && self.avg_chunk_size <= self.max_chunk_size) {
            return Err(Error::Other(format!(
                "chunk sizes out of order: min {} avg {} max {}",
                self.min_chunk_size, self.avg_chunk_size, self.max_chunk_size
            )));
        }
        Ok(())
    }
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self::with_polynomial(Polynomial::random())
    }
}
