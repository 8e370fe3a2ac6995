//
// Error types used by the protocol engine.
//
// Every handler returns `DavResult<Response<Body>>`; the top level guard
// in `handler.rs` maps a `DavError` to an HTTP status (and, for
// precondition errors, an XML error body).
//
use std::io::ErrorKind;

use http::StatusCode;
use thiserror::Error;

use crate::ical::ItemError;
use crate::storage::FsError;

#[derive(Debug, Error)]
pub enum DavError {
    #[error("error parsing XML body")]
    XmlParseError,
    #[error("XML body exceeds depth or element limits")]
    XmlOverflow,
    #[error("error reading request body")]
    BodyRead,
    #[error("invalid request path")]
    InvalidPath,
    #[error("unknown or unsupported HTTP method")]
    UnknownDavMethod,
    #[error("credentials required")]
    Unauthorized,
    #[error("{0}")]
    Status(StatusCode),
    /// Like `Status`, but the connection must be closed afterwards
    /// (the request body may not have been drained).
    #[error("{0}")]
    StatusClose(StatusCode),
    /// A WebDAV pre-/postcondition failure: the response carries a
    /// `DAV:error` body naming the given element, e.g. `D:valid-sync-token`.
    #[error("precondition failed: {1}")]
    Condition(StatusCode, &'static str),
    #[error(transparent)]
    Item(#[from] ItemError),
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("XML generate error: {0}")]
    XmlWriteError(#[from] xml::writer::Error),
}

impl DavError {
    pub(crate) fn statuscode(&self) -> StatusCode {
        match self {
            DavError::XmlParseError => StatusCode::BAD_REQUEST,
            DavError::XmlOverflow => StatusCode::BAD_REQUEST,
            DavError::BodyRead => StatusCode::BAD_REQUEST,
            DavError::InvalidPath => StatusCode::BAD_REQUEST,
            DavError::UnknownDavMethod => StatusCode::NOT_IMPLEMENTED,
            DavError::Unauthorized => StatusCode::UNAUTHORIZED,
            DavError::Status(s) => *s,
            DavError::StatusClose(s) => *s,
            DavError::Condition(s, _) => *s,
            DavError::Item(_) => StatusCode::BAD_REQUEST,
            DavError::Fs(e) => fserror_to_status(*e),
            DavError::IoError(e) => ioerror_to_status(e),
            DavError::XmlWriteError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) fn must_close(&self) -> bool {
        matches!(self, DavError::StatusClose(_))
    }
}

impl From<StatusCode> for DavError {
    fn from(s: StatusCode) -> DavError {
        DavError::Status(s)
    }
}

pub(crate) fn fserror_to_status(e: FsError) -> StatusCode {
    match e {
        FsError::NotFound => StatusCode::NOT_FOUND,
        FsError::Exists => StatusCode::METHOD_NOT_ALLOWED,
        FsError::Conflict => StatusCode::CONFLICT,
        FsError::Forbidden => StatusCode::FORBIDDEN,
        FsError::InvalidName => StatusCode::BAD_REQUEST,
        FsError::BadSyncToken => StatusCode::FORBIDDEN,
        FsError::GeneralFailure => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn ioerror_to_status(e: &std::io::Error) -> StatusCode {
    match e.kind() {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorKind::AlreadyExists => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
