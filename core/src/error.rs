use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read source stream: {0}")]
    StreamRead(#[source] std::io::Error),

    #[error("Sealing failed: {0}")]
    Seal(String),

    #[error("Opening sealed data failed: {0}")]
    Open(String),

    #[error("Backend write of {path} failed: {message}")]
    BackendWrite { path: String, message: String },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Index checkpoint failed: {0}")]
    IndexCheckpoint(String),

    #[error("Content ID mismatch: expected {expected}, computed {actual}")]
    IdMismatch { expected: String, actual: String },

    #[error("Blob not found: {kind} {id}")]
    BlobNotFound { kind: String, id: String },

    #[error("Pack file corrupted: {id}")]
    CorruptedPack { id: String },

    #[error("Repository not found: no config at {path}")]
    RepositoryNotFound { path: String },

    #[error("Repository already exists at {path}")]
    RepositoryExists { path: String },

    #[error("Invalid repository format version: {version}")]
    InvalidFormatVersion { version: u32 },

    #[error("Invalid chunker polynomial {0:#x}")]
    InvalidPolynomial(u64),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
