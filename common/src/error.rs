use thiserror::Error;

/// A Result type specialized for coverage-data operations.
pub type Result<T> = std::result::Result<T, CoverageError>;

#[derive(Error, Debug)]
pub enum CoverageError {
    /// A malformed store, wrong schema version, mode conflict, tracer
    /// conflict, or an operation on an untouched file.
    #[error("{0}")]
    Data(String),

    /// An underlying database I/O or constraint failure, carrying the name
    /// of the offending data file.
    #[error("Couldn't use data file '{path}': {message}")]
    DataFile { path: String, message: String },

    /// A caller-supplied parameter out of range.
    #[error("{0}")]
    Config(String),

    /// `loads` input that did not come from `dumps`.
    #[error("Unrecognized serialization: {head:?} (head of {len} bytes)")]
    UnrecognizedSerialization { head: Vec<u8>, len: usize },
}

impl CoverageError {
    /// Wrap a database error with the filename it happened against.
    pub fn data_file(path: impl std::fmt::Display, message: impl std::fmt::Display) -> Self {
        Self::DataFile {
            path: path.to_string(),
            message: message.to_string(),
        }
    }
}
