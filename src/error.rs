//! Error handling utils.
//!
//! The cooperative IO surface keeps the libc contract: syscall failures are
//! returned as [`std::io::Error`] values carrying the original `errno`, and a
//! timed-out wait surfaces as `ETIMEDOUT` (`io::ErrorKind::TimedOut`).
//! Everything above the syscall layer (configuration, HTTP parsing) gets its
//! own variant here.
//!
//! Internal invariant violations are not represented in this enum - they
//! halt, see the crate docs.

use std::io;

/// A specialized [`Result`] type for the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all error cases for all routines of the crate
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    IO(#[from] io::Error),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to parse http message: {0}")]
    HttpParse(#[from] crate::http::ParseError),

    /// This should only be used if the error doesn't fall into one of the
    /// above categories.
    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    #[inline(always)]
    pub fn other<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Other(error.into())
    }

    /// `true` if the error is a timed-out cooperative wait.
    #[inline]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::IO(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

/// Errors of the configuration collaborator.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to parse yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("config var `{name}` is already registered with a different type")]
    TypeMismatch { name: String },

    #[error("invalid config var name `{0}`")]
    InvalidName(String),
}

const _: () = {
    /// Assert Error implements Send + Sync
    const fn if_this_compiles_the_type_implements_send_and_sync<T: Send + Sync>() {}
    if_this_compiles_the_type_implements_send_and_sync::<Error>();
};
