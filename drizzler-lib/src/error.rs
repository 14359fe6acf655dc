use std::path::PathBuf;

use thiserror::Error;

/// Kinds of errors surfaced by the engine's constructors and the state store.
///
/// Per-request failures (timeouts, connection errors, erroneous status codes)
/// never show up here; they are classified and absorbed inside the fetch
/// pipeline and only influence the final run statistics.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The network client required for making requests cannot be created
    #[error("Error creating request client: {0}")]
    BuildRequestClient(#[source] reqwest::Error),

    /// A default header could not be parsed.
    /// A possible error when converting a `HeaderValue` from a string or byte
    /// slice.
    #[error("Header could not be parsed")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),

    /// Cannot read the engine state file
    #[error("Cannot read state file `{1}`")]
    ReadStateFile(#[source] std::io::Error, PathBuf),

    /// Cannot write the engine state file
    #[error("Cannot write state file `{1}`")]
    WriteStateFile(#[source] std::io::Error, PathBuf),

    /// The engine state file exists but does not contain a valid snapshot
    #[error("Cannot decode state file `{1}`")]
    DecodeStateFile(#[source] serde_json::Error, PathBuf),

    /// The in-memory engine state could not be serialized
    #[error("Cannot encode engine state")]
    EncodeState(#[source] serde_json::Error),
}

/// The result type of this crate
pub type Result<T> = std::result::Result<T, ErrorKind>;
