use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};

use crate::body::Body;
use crate::davpath::DavPath;
use crate::handler::DavInner;
use crate::DavResult;

pub(crate) const DAV_CAPABILITIES: &str =
    "1, 2, 3, calendar-access, addressbook, extended-mkcol";

impl DavInner {
    pub(crate) fn handle_options(
        &self,
        _req: &Request<()>,
        path: &DavPath,
    ) -> DavResult<Response<Body>> {
        let mut allow = vec![
            "OPTIONS", "GET", "HEAD", "PUT", "DELETE", "PROPFIND", "PROPPATCH", "REPORT", "MOVE",
        ];
        // creation methods only make sense where nothing exists yet.
        if self
            .storage
            .collection(&path.storage_path())
            .ok()
            .flatten()
            .is_none()
        {
            allow.push("MKCOL");
            allow.push("MKCALENDAR");
        }

        let mut resp = Response::new(Body::empty());
        *resp.status_mut() = StatusCode::OK;
        resp.headers_mut().insert("DAV", DAV_CAPABILITIES.parse().unwrap());
        resp.headers_mut()
            .insert("Allow", allow.join(", ").parse().unwrap());
        resp.headers_mut().typed_insert(headers::ContentLength(0));
        Ok(resp)
    }
}
