// Copyright (C) 2018 Stephane Raux. Distributed under the MIT license.

use crate::client::FetchError;
use crate::protocol::SchemaError;
use serde::Serializer;
use serde::ser::SerializeSeq;
use serde_derive::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt::{Display, self};
use std::io;

/// Failure surfaced to callers of either service.
#[derive(Debug, Serialize)]
pub struct Error {
    kind: ErrorKind,
    detail: String,
    #[serde(serialize_with = "serialize_cause")]
    cause: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new<E>(kind: ErrorKind, cause: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let cause = cause.into();
        let detail = cause.to_string();
        Error {kind, detail, cause: Some(cause)}
    }

    pub fn detailed<S: Into<String>>(kind: ErrorKind, detail: S) -> Self {
        Error {kind, detail: detail.into(), cause: None}
    }

    pub fn kind(&self) -> &ErrorKind {&self.kind}

    pub fn detail(&self) -> &str {&self.detail}
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ErrorKind {
    /// The request cannot be served as sent. Retrying it unchanged is
    /// pointless.
    InvalidArgument,
    /// The provider did not answer in time.
    DeadlineExceeded,
    /// The provider answered with an error status or could not be reached.
    Unavailable,
    /// Anything else, including provider payloads of an unknown shape.
    Internal,
}

impl ErrorKind {
    fn label(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::DeadlineExceeded => "Deadline exceeded",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::Internal => "Internal error",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_deref().map(|e| e as &(dyn StdError + 'static))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error::detailed(kind, kind.label())
    }
}

impl From<FetchError> for Error {
    fn from(e: FetchError) -> Error {
        let kind = match e {
            FetchError::Timeout(_) => ErrorKind::DeadlineExceeded,
            FetchError::UpstreamHttp {..} | FetchError::Transport(_) =>
                ErrorKind::Unavailable,
            FetchError::Decode(_) | FetchError::Request(_) =>
                ErrorKind::Internal,
        };
        Error::new(kind, e)
    }
}

impl From<SchemaError> for Error {
    fn from(e: SchemaError) -> Error {
        Error::new(ErrorKind::Internal, e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::new(ErrorKind::Internal, e)
    }
}

fn serialize_cause<S>(e: &Option<Box<dyn StdError + Send + Sync>>, out: S)
    -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut seq = out.serialize_seq(None)?;
    let mut e = e.as_ref().and_then(|e| e.source());
    while let Some(cause) = e {
        seq.serialize_element(&cause.to_string())?;
        e = cause.source();
    }
    seq.end()
}
