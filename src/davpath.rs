//! Sanitized request path.
//!
//! A `DavPath` is the percent-decoded, normalized path of a request,
//! relative to the base prefix. Double slashes are collapsed, `.` and
//! `..` segments are rejected, and whether the client asked for a
//! collection (trailing slash) is remembered separately.

use std::fmt;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::errors::DavError;
use crate::DavResult;

// characters we percent-encode when generating hrefs.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

#[derive(Clone, PartialEq, Eq)]
pub struct DavPath {
    // decoded segments, no empties.
    segments: Vec<String>,
    // did the request path end in a slash?
    collection: bool,
    // base prefix, "" or "/something".
    prefix: String,
}

impl fmt::Display for DavPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_url_string())
    }
}

impl fmt::Debug for DavPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DavPath({})", self.as_url_string())
    }
}

impl DavPath {
    /// Parse the path of a request URI, stripping `prefix`.
    pub fn from_uri(uri: &http::Uri, prefix: &str) -> DavResult<DavPath> {
        DavPath::from_str(uri.path(), prefix)
    }

    /// Parse a raw (still percent-encoded) path. Absolute URLs, as seen
    /// in `Destination` headers, are reduced to their path first.
    pub fn from_str(path: &str, prefix: &str) -> DavResult<DavPath> {
        let mut path = path;
        if let Some(idx) = path.find("://") {
            // strip scheme and authority.
            path = match path[idx + 3..].find('/') {
                Some(i) => &path[idx + 3 + i..],
                None => "/",
            };
        }
        if !path.starts_with('/') {
            return Err(DavError::InvalidPath);
        }
        let path = match path.strip_prefix(prefix) {
            Some(rest) if prefix.is_empty() || rest.is_empty() || rest.starts_with('/') => {
                if rest.is_empty() { "/" } else { rest }
            }
            _ => return Err(DavError::Status(http::StatusCode::NOT_FOUND)),
        };

        let collection = path.ends_with('/');
        let mut segments = Vec::new();
        for seg in path.split('/') {
            if seg.is_empty() || seg == "." {
                continue;
            }
            if seg == ".." {
                return Err(DavError::InvalidPath);
            }
            let decoded = percent_decode_str(seg)
                .decode_utf8()
                .map_err(|_| DavError::InvalidPath)?;
            if decoded.contains(['/', '\0']) || decoded == "." || decoded == ".." {
                return Err(DavError::InvalidPath);
            }
            segments.push(decoded.into_owned());
        }
        Ok(DavPath {
            collection: collection || segments.is_empty(),
            segments,
            prefix: prefix.to_string(),
        })
    }

    /// The path as used by the storage layer: segments joined with `/`,
    /// no leading or trailing slash. The root is the empty string.
    pub fn storage_path(&self) -> String {
        self.segments.join("/")
    }

    /// Percent-encoded path including the prefix, with a trailing slash
    /// for collections.
    pub fn as_url_string(&self) -> String {
        let mut out = self.prefix.clone();
        for seg in &self.segments {
            out.push('/');
            out.push_str(&utf8_percent_encode(seg, SEGMENT).to_string());
        }
        if self.collection || self.segments.is_empty() {
            out.push('/');
        }
        out
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Did the client address this as a collection (trailing slash)?
    pub fn is_collection(&self) -> bool {
        self.collection
    }

    pub fn set_collection(&mut self, collection: bool) {
        self.collection = collection || self.segments.is_empty();
    }

    /// Last path segment, or "" for the root.
    pub fn name(&self) -> &str {
        self.segments.last().map(|s| s.as_str()).unwrap_or("")
    }

    /// First path segment (the principal for non-root paths).
    pub fn owner(&self) -> Option<&str> {
        self.segments.first().map(|s| s.as_str())
    }

    pub fn parent(&self) -> DavPath {
        let mut segments = self.segments.clone();
        segments.pop();
        DavPath {
            segments,
            collection: true,
            prefix: self.prefix.clone(),
        }
    }

    pub fn push_segment(&mut self, seg: &str) {
        self.segments.push(seg.to_string());
        self.collection = false;
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Build a sibling `DavPath` for a raw storage path (used when
    /// generating hrefs for resources found through the storage layer).
    pub fn for_storage_path(&self, storage_path: &str, collection: bool) -> DavPath {
        let segments = storage_path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect::<Vec<_>>();
        DavPath {
            collection: collection || segments.is_empty(),
            segments,
            prefix: self.prefix.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(p: &str) -> DavPath {
        DavPath::from_str(p, "").unwrap()
    }

    #[test]
    fn test_normalize() {
        assert_eq!(parse("/alice//cal/").storage_path(), "alice/cal");
        assert_eq!(parse("/alice/cal/ev.ics").name(), "ev.ics");
        assert!(parse("/alice/cal/").is_collection());
        assert!(!parse("/alice/cal").is_collection());
        assert!(parse("/").is_collection());
        assert_eq!(parse("/").storage_path(), "");
    }

    #[test]
    fn test_dotdot_rejected() {
        assert!(DavPath::from_str("/a/../b", "").is_err());
        assert!(DavPath::from_str("/a/%2e%2e/b", "").is_err());
    }

    #[test]
    fn test_percent_decode() {
        let p = parse("/alice/My%20Cal/");
        assert_eq!(p.storage_path(), "alice/My Cal");
        assert_eq!(p.as_url_string(), "/alice/My%20Cal/");
    }

    #[test]
    fn test_prefix() {
        let p = DavPath::from_str("/dav/alice/", "/dav").unwrap();
        assert_eq!(p.storage_path(), "alice");
        assert_eq!(p.as_url_string(), "/dav/alice/");
        assert!(DavPath::from_str("/other/alice/", "/dav").is_err());
    }

    #[test]
    fn test_destination_url() {
        let p = DavPath::from_str("http://example.com/alice/cal/x.ics", "").unwrap();
        assert_eq!(p.storage_path(), "alice/cal/x.ics");
    }

    #[test]
    fn test_parent() {
        let p = parse("/alice/cal/ev.ics");
        assert_eq!(p.parent().storage_path(), "alice/cal");
        assert!(p.parent().is_collection());
    }
}
