//! Deterministic synthetic trees for exercising a repository.
//!
//! A [`FakeTree`] with a given seed and depth always produces the same
//! directory shape and the same file contents. Seeds are drawn from a small
//! range, so equal files and equal subdirectories recur and get deduplicated.

use crate::archiver::TreeBuilder;
use crate::tree::{Node, Tree};
use crate::{Id, Repository, Result};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::io::{self, Read};

pub const MAX_SEED: u64 = 32;
pub const MAX_NODES: u64 = 32;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1_500_000;

#[derive(Debug, Clone, Copy)]
pub struct FakeTree {
    seed: u64,
    depth: usize,
    max_file_size: u64,
}

impl FakeTree {
    pub fn new(seed: u64, depth: usize) -> Self {
        Self {
            seed,
            depth,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }

    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    fn file_size(&self, file_seed: u64) -> u64 {
        (self.max_file_size / MAX_SEED) * file_seed
    }

    fn save_level<'a>(&'a self, repo: &'a Repository, seed: u64, depth: usize) -> BoxFuture<'a, Result<Id>> {
        async move {
            let mut rng = StdRng::seed_from_u64(seed);
            let node_count = rng.gen_range(0..MAX_NODES);

            let mut tree = Tree::new();
            for _ in 0..node_count {
                if depth > 1 && rng.gen_range(0..4) == 0 {
                    let tree_seed = rng.gen_range(0..MAX_SEED);
                    let subtree = self.save_level(repo, tree_seed, depth - 1).await?;
                    tree.add_node(Node::dir(format!("dir-{tree_seed}"), 0o755, subtree));
                } else {
                    let file_seed = rng.gen_range(0..MAX_SEED);
                    let size = self.file_size(file_seed);
                    let saved = repo.save_file(FakeFile::new(file_seed, size)).await?;
                    tree.add_node(saved.into_node(format!("file-{file_seed}"), 0o644));
                }
            }

            repo.save_tree(&tree).await
        }
        .boxed()
    }
}

#[async_trait]
impl TreeBuilder for FakeTree {
    async fn build(&self, repo: &Repository) -> Result<Id> {
        self.save_level(repo, self.seed, self.depth).await
    }
}

/// Pseudo-random file content of a fixed length.
///
/// Output only depends on the seed and the length, not on how the reader
/// is called.
pub struct FakeFile {
    rng: StdRng,
    block: [u8; 64],
    pos: usize,
    remaining: u64,
}

impl FakeFile {
    pub fn new(seed: u64, size: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            block: [0; 64],
            pos: 64,
            remaining: size,
        }
    }
}

impl Read for FakeFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let want = usize::try_from(self.remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let mut written = 0;
        while written < want {
            if self.pos == self.block.len() {
                self.rng.fill_bytes(&mut self.block);
                self.pos = 0;
            }
            let n = (want - written).min(self.block.len() - self.pos);
            buf[written..written + n].copy_from_slice(&self.block[self.pos..self.pos + n]);
            self.pos += n;
            written += n;
        }
        self.remaining -= written as u64;
        Ok(written)
    }
}
