use std::io::{Cursor, Write};
use std::time::SystemTime;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use http::StatusCode;

use crate::body::Body;
use crate::errors::DavError;
use crate::DavResult;

/// HTTP methods supported by the handler.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum DavMethod {
    Options,
    Head,
    Get,
    Put,
    Delete,
    PropFind,
    PropPatch,
    MkCol,
    MkCalendar,
    Move,
    Report,
}

// translate the http method into our own enum that has the
// webdav extension methods as well.
pub(crate) fn dav_method(m: &http::Method) -> DavResult<DavMethod> {
    let m = match *m {
        http::Method::OPTIONS => DavMethod::Options,
        http::Method::HEAD => DavMethod::Head,
        http::Method::GET => DavMethod::Get,
        http::Method::PUT => DavMethod::Put,
        http::Method::DELETE => DavMethod::Delete,
        _ => match m.as_str() {
            "PROPFIND" => DavMethod::PropFind,
            "PROPPATCH" => DavMethod::PropPatch,
            "MKCOL" => DavMethod::MkCol,
            "MKCALENDAR" => DavMethod::MkCalendar,
            "MOVE" => DavMethod::Move,
            "REPORT" => DavMethod::Report,
            _ => return Err(DavError::UnknownDavMethod),
        },
    };
    Ok(m)
}

impl DavMethod {
    /// Methods that mutate storage take the exclusive lock.
    pub(crate) fn is_write(self) -> bool {
        matches!(
            self,
            DavMethod::Put
                | DavMethod::Delete
                | DavMethod::MkCol
                | DavMethod::MkCalendar
                | DavMethod::Move
                | DavMethod::PropPatch
        )
    }
}

/// Build a `DAV:error` body containing a single precondition element.
pub(crate) fn dav_xml_error(element: &str) -> Body {
    let xml = format!(
        "{}\n<D:error xmlns:D=\"DAV:\" xmlns:C=\"urn:ietf:params:xml:ns:caldav\" \
         xmlns:CR=\"urn:ietf:params:xml:ns:carddav\"><{}/></D:error>\n",
        r#"<?xml version="1.0" encoding="utf-8" ?>"#, element
    );
    Body::from(xml)
}

pub(crate) fn systemtime_to_httpdate(t: SystemTime) -> String {
    // Tue, 07 Jun 1994 08:49:37 GMT
    DateTime::<Utc>::from(t).format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub(crate) fn systemtime_to_rfc3339(t: SystemTime) -> String {
    // 1996-12-19T16:39:57Z
    DateTime::<Utc>::from(t).to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(crate) fn status_line(status: StatusCode) -> String {
    format!(
        "HTTP/1.1 {} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
}

// A buffer that implements "Write", backing the XML event writers.
#[derive(Clone)]
pub(crate) struct MemBuffer(Cursor<Vec<u8>>);

impl MemBuffer {
    pub fn new() -> MemBuffer {
        MemBuffer(Cursor::new(Vec::new()))
    }

    pub fn take(&mut self) -> Bytes {
        let buf = std::mem::take(self.0.get_mut());
        self.0.set_position(0);
        Bytes::from(buf)
    }
}

impl Write for MemBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    #[test]
    fn test_rfc3339() {
        assert_eq!(systemtime_to_rfc3339(UNIX_EPOCH), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_httpdate() {
        assert_eq!(systemtime_to_httpdate(UNIX_EPOCH), "Thu, 01 Jan 1970 00:00:00 GMT");
    }

    #[test]
    fn test_dav_method() {
        assert_eq!(dav_method(&http::Method::GET).unwrap(), DavMethod::Get);
        let m = http::Method::from_bytes(b"MKCALENDAR").unwrap();
        assert_eq!(dav_method(&m).unwrap(), DavMethod::MkCalendar);
        assert!(dav_method(&http::Method::TRACE).is_err());
    }
}
