use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or rejected credential.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network failure or 5xx from the API.
    #[error("transient failure on {url}: {reason}")]
    Transient { url: String, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    /// Any other unexpected API answer, including bodies that do not decode.
    #[error("unexpected response from {url}: {reason}")]
    Api { url: String, reason: String },

    #[error("i/o error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `git` exited non-zero, or produced something we cannot archive.
    #[error("clone failed: {0}")]
    Clone(String),

    #[error("setup failed: {0}")]
    Setup(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Explicit project ids that do not exist are reported and skipped;
    /// everything else invalidates the candidate set.
    pub fn is_fatal_for_listing(&self) -> bool {
        !matches!(self, Error::NotFound(_))
    }
}

impl From<git2::Error> for Error {
    fn from(e: git2::Error) -> Self {
        Error::Clone(e.message().to_owned())
    }
}
