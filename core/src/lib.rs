pub mod archiver;
pub mod assembler;
pub mod backend;
pub mod chunker;
pub mod crypto;
pub mod error;
pub mod fake;
pub mod index;
pub mod pack;
pub mod polynomial;
pub mod repository;
pub mod snapshot;
pub mod tree;
pub mod types;

pub use archiver::{SavedFile, TreeBuilder, VirtualDir};
pub use assembler::SnapshotOptions;
pub use error::{Error, Result};
pub use repository::{Repository, Stats};
pub use snapshot::Snapshot;
pub use types::*;
