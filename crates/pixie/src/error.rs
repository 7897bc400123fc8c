//! Errors for the netboot core.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("template error: {0}")]
    Template(String),

    #[error("signature verification failed")]
    Signature,

    #[error("no file with ID {0:?}")]
    UnknownId(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),
}
