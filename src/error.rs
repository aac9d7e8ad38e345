//! Error taxonomy shared by every layer of the crate.
//!
//! Lower layers keep their own narrow error enums ([`CodecError`],
//! [`FilterError`]) and convert into [`Error`] at the block-compressor
//! boundary.  The container wraps whatever it receives in
//! [`Error::Chunk`] or [`Error::Metalayer`] so the caller knows which
//! chunk index or metadata key was involved; [`Error::kind`] looks
//! through those wrappers.

use std::io;
use thiserror::Error;

use crate::codec::CodecError;
use crate::filter::FilterError;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], stable across wrappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidParameter,
    InvalidHeader,
    DataCorrupt,
    BufferTooSmall,
    OutOfRange,
    NotFound,
    Io,
    ResourceExhausted,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Invalid header: {0}")]
    InvalidHeader(String),
    #[error("Data corrupt: {0}")]
    DataCorrupt(String),
    #[error("Buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
    #[error("Out of range: {0}")]
    OutOfRange(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("chunk {index}: {source}")]
    Chunk {
        index:  usize,
        #[source]
        source: Box<Error>,
    },
    #[error("metalayer '{name}': {source}")]
    Metalayer {
        name:   String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidParameter(_)      => ErrorKind::InvalidParameter,
            Error::InvalidHeader(_)         => ErrorKind::InvalidHeader,
            Error::DataCorrupt(_)           => ErrorKind::DataCorrupt,
            Error::BufferTooSmall { .. }    => ErrorKind::BufferTooSmall,
            Error::OutOfRange(_)            => ErrorKind::OutOfRange,
            Error::NotFound(_)              => ErrorKind::NotFound,
            Error::Io(_)                    => ErrorKind::Io,
            Error::ResourceExhausted(_)     => ErrorKind::ResourceExhausted,
            Error::Chunk { source, .. }     => source.kind(),
            Error::Metalayer { source, .. } => source.kind(),
        }
    }

    /// Annotate with the chunk index the failure belongs to.
    pub fn at_chunk(self, index: usize) -> Self {
        Error::Chunk { index, source: Box::new(self) }
    }

    /// Annotate with the metalayer name the failure belongs to.
    pub fn at_metalayer(self, name: &str) -> Self {
        Error::Metalayer { name: name.to_owned(), source: Box::new(self) }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidParameter(msg.into())
    }

    pub(crate) fn header(msg: impl Into<String>) -> Self {
        Error::InvalidHeader(msg.into())
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Error::DataCorrupt(msg.into())
    }

    pub(crate) fn out_of_range(msg: impl Into<String>) -> Self {
        Error::OutOfRange(msg.into())
    }

    pub(crate) fn too_small(needed: usize, available: usize) -> Self {
        Error::BufferTooSmall { needed, available }
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::UnknownCodec(id)     => Error::NotFound(format!("codec id {id} is not registered")),
            CodecError::AlreadyRegistered(id) => Error::InvalidParameter(format!("codec id {id} is already registered")),
            CodecError::ReservedId(id)       => Error::InvalidParameter(format!("codec id {id} is outside the user range")),
            CodecError::OutputTooSmall { needed, available } => Error::BufferTooSmall { needed, available },
            CodecError::Corrupt(msg)         => Error::DataCorrupt(msg),
            other                            => Error::DataCorrupt(other.to_string()),
        }
    }
}

impl From<FilterError> for Error {
    fn from(e: FilterError) -> Self {
        match e {
            FilterError::UnknownFilter(id) => Error::NotFound(format!("filter id {id} is not registered")),
            other                          => Error::InvalidParameter(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_looks_through_wrappers() {
        let e = Error::out_of_range("index 7").at_chunk(7).at_metalayer("shape");
        assert_eq!(e.kind(), ErrorKind::OutOfRange);
        assert!(e.to_string().contains("shape"));
        assert!(e.to_string().contains("chunk 7"));
    }

    #[test]
    fn codec_errors_map_to_taxonomy() {
        let e: Error = CodecError::UnknownCodec(42).into();
        assert_eq!(e.kind(), ErrorKind::NotFound);
        let e: Error = CodecError::Corrupt("bad literal".into()).into();
        assert_eq!(e.kind(), ErrorKind::DataCorrupt);
        let e: Error = CodecError::OutputTooSmall { needed: 10, available: 4 }.into();
        assert_eq!(e.kind(), ErrorKind::BufferTooSmall);
    }
}
