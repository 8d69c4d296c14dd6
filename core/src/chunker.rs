use crate::polynomial::Polynomial;
use crate::{Error, Id, RepoConfig, Result};
use fastcdc::v2020::{Normalization, StreamCDC};
use std::io::Read;

/// Content-defined chunker keyed by the repository polynomial.
///
/// The polynomial value is only used as the seed of the FastCDC gear table,
/// so two repositories with different polynomials cut the same stream at
/// different places. Irreducibility plays no part in how chunks are cut; it
/// is checked by [`RepoConfig::validate`] for repository compatibility only.
///
/// A `Chunker` holds no stream state; every call to [`Chunker::chunks`]
/// starts a fresh pass, which makes chunking restartable and deterministic.
#[derive(Debug, Clone)]
pub struct Chunker {
    polynomial: Polynomial,
    min_size: u32,
    avg_size: u32,
    max_size: u32,
}

impl Chunker {
    pub fn new(polynomial: Polynomial, min_size: u32, avg_size: u32, max_size: u32) -> Self {
        Self {
            polynomial,
            min_size,
            avg_size,
            max_size,
        }
    }

    pub fn from_config(config: &RepoConfig) -> Self {
        Self::new(
            config.chunker_polynomial,
            config.min_chunk_size,
            config.avg_chunk_size,
            config.max_chunk_size,
        )
    }

    pub fn min_size(&self) -> u32 {
        self.min_size
    }

    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    /// Splits a byte stream. The iterator ends at end-of-stream and yields
    /// `Error::StreamRead` if the source fails; an empty stream yields nothing.
    pub fn chunks<R: Read>(&self, reader: R) -> Chunks<R> {
        Chunks {
            inner: StreamCDC::with_level_and_seed(
                reader,
                self.min_size,
                self.avg_size,
                self.max_size,
                Normalization::Level1,
                self.polynomial.value(),
            ),
            failed: false,
        }
    }

    pub fn chunk_data(&self, data: &[u8]) -> Vec<Chunk> {
        // reads from a slice cannot fail
        self.chunks(data).filter_map(|chunk| chunk.ok()).collect()
    }
}

pub struct Chunks<R: Read> {
    inner: StreamCDC<R>,
    failed: bool,
}

impl<R: Read> Iterator for Chunks<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.inner.next()? {
            Ok(chunk) => Some(Ok(Chunk {
                offset: chunk.offset as usize,
                length: chunk.length,
                data: chunk.data,
            })),
            Err(err) => {
                self.failed = true;
                Some(Err(match err {
                    fastcdc::v2020::Error::IoError(io) => Error::StreamRead(io),
                    other => Error::StreamRead(std::io::Error::other(other.to_string())),
                }))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub offset: usize,
    pub length: usize,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn id(&self) -> Id {
        Id::hash(&self.data)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}
