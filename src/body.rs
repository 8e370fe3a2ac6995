//! Response body type.
//!
//! Responses are assembled in memory before they are sent, so the body
//! is a single chunk of bytes. It implements `http_body::Body` so it can
//! be served by hyper directly.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body as HttpBody, Frame, SizeHint};

pub struct Body {
    data: Option<Bytes>,
}

impl Body {
    /// Return an empty body.
    pub fn empty() -> Body {
        Body { data: None }
    }

    /// Length of the body in bytes.
    pub fn len(&self) -> u64 {
        self.data.as_ref().map_or(0, |b| b.len() as u64)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The remaining bytes. Mostly useful in tests.
    pub fn to_bytes(&self) -> Bytes {
        self.data.clone().unwrap_or_else(Bytes::new)
    }

    /// Drop the contents but keep the length, for HEAD responses.
    pub(crate) fn clear(&mut self) {
        self.data = None;
    }
}

impl HttpBody for Body {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        Poll::Ready(self.data.take().filter(|b| !b.is_empty()).map(|b| Ok(Frame::data(b))))
    }

    fn is_end_stream(&self) -> bool {
        self.data.as_ref().map_or(true, |b| b.is_empty())
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.len())
    }
}

impl From<String> for Body {
    fn from(t: String) -> Body {
        Body { data: Some(Bytes::from(t)) }
    }
}

impl From<&str> for Body {
    fn from(t: &str) -> Body {
        Body { data: Some(Bytes::from(t.to_string())) }
    }
}

impl From<Vec<u8>> for Body {
    fn from(t: Vec<u8>) -> Body {
        Body { data: Some(Bytes::from(t)) }
    }
}

impl From<Bytes> for Body {
    fn from(t: Bytes) -> Body {
        Body { data: Some(t) }
    }
}
