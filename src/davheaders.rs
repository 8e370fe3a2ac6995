//! Typed definitions for the WebDAV request headers we interpret.

use headers::{self, Header, HeaderName, HeaderValue};

static DEPTH: HeaderName = HeaderName::from_static("depth");
static DESTINATION: HeaderName = HeaderName::from_static("destination");
static OVERWRITE: HeaderName = HeaderName::from_static("overwrite");
static X_SCRIPT_NAME: HeaderName = HeaderName::from_static("x-script-name");

/// Depth: 0, 1, infinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Zero,
    One,
    Infinity,
}

impl Header for Depth {
    fn name() -> &'static HeaderName {
        &DEPTH
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        match value.to_str().map_err(|_| headers::Error::invalid())? {
            "0" => Ok(Depth::Zero),
            "1" => Ok(Depth::One),
            s if s.eq_ignore_ascii_case("infinity") => Ok(Depth::Infinity),
            _ => Err(headers::Error::invalid()),
        }
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        let s = match self {
            Depth::Zero => "0",
            Depth::One => "1",
            Depth::Infinity => "infinity",
        };
        values.extend(std::iter::once(HeaderValue::from_static(s)));
    }
}

/// Destination: header of MOVE. Kept raw, resolved against the
/// base prefix by the handler.
#[derive(Debug, Clone)]
pub struct Destination(pub String);

impl Header for Destination {
    fn name() -> &'static HeaderName {
        &DESTINATION
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        let s = value.to_str().map_err(|_| headers::Error::invalid())?;
        Ok(Destination(s.to_string()))
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        if let Ok(v) = HeaderValue::from_str(&self.0) {
            values.extend(std::iter::once(v));
        }
    }
}

/// Overwrite: T or F.
#[derive(Debug, Clone, Copy)]
pub struct Overwrite(pub bool);

impl Header for Overwrite {
    fn name() -> &'static HeaderName {
        &OVERWRITE
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        match value.as_bytes() {
            b"T" => Ok(Overwrite(true)),
            b"F" => Ok(Overwrite(false)),
            _ => Err(headers::Error::invalid()),
        }
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        let s = if self.0 { "T" } else { "F" };
        values.extend(std::iter::once(HeaderValue::from_static(s)));
    }
}

/// X-Script-Name: base prefix set by a reverse proxy.
#[derive(Debug, Clone)]
pub struct XScriptName(pub String);

impl Header for XScriptName {
    fn name() -> &'static HeaderName {
        &X_SCRIPT_NAME
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        let s = value.to_str().map_err(|_| headers::Error::invalid())?;
        Ok(XScriptName(s.to_string()))
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        if let Ok(v) = HeaderValue::from_str(&self.0) {
            values.extend(std::iter::once(v));
        }
    }
}

/// An `If-Match` / `If-None-Match` value: `*` or a list of entity tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ETagList {
    Star,
    Tags(Vec<String>),
}

impl ETagList {
    /// Parse the concatenation of all values of one of the If-* headers.
    pub fn parse(raw: &str) -> ETagList {
        if raw.trim() == "*" {
            return ETagList::Star;
        }
        let tags = raw
            .split(',')
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(|t| t.trim_start_matches("W/").to_string())
            .collect();
        ETagList::Tags(tags)
    }

    /// Does `etag` (a quoted strong etag) match the list?
    pub fn matches(&self, etag: &str) -> bool {
        match self {
            ETagList::Star => true,
            ETagList::Tags(tags) => tags.iter().any(|t| t == etag),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_etag_list() {
        let l = ETagList::parse(r#""a", W/"b""#);
        assert!(l.matches("\"a\""));
        assert!(l.matches("\"b\""));
        assert!(!l.matches("\"c\""));
        assert!(ETagList::parse("*").matches("\"anything\""));
    }

    #[test]
    fn test_depth_decode() {
        use headers::HeaderMapExt;
        let mut m = http::HeaderMap::new();
        m.insert("depth", HeaderValue::from_static("infinity"));
        assert_eq!(m.typed_get::<Depth>(), Some(Depth::Infinity));
        m.insert("depth", HeaderValue::from_static("0"));
        assert_eq!(m.typed_get::<Depth>(), Some(Depth::Zero));
    }
}
