//
// Handling of the conditional request headers (RFC 7232) against the
// strong etags produced by the item and storage layers.
//
use http::{Method, Request, StatusCode};

use crate::davheaders::ETagList;

fn header_etags(req: &Request<()>, name: &str) -> Option<ETagList> {
    let values: Vec<&str> = req
        .headers()
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(ETagList::parse(&values.join(",")))
    }
}

/// Evaluate If-Match / If-None-Match against the current etag of the
/// target (`None` when the target does not exist). Returns the failure
/// status, or `None` when the preconditions pass.
pub(crate) fn if_match(req: &Request<()>, etag: Option<&str>) -> Option<StatusCode> {
    if let Some(list) = header_etags(req, "if-match") {
        match etag {
            None => return Some(StatusCode::PRECONDITION_FAILED),
            Some(tag) => {
                if !list.matches(tag) {
                    return Some(StatusCode::PRECONDITION_FAILED);
                }
            }
        }
    }

    if let Some(list) = header_etags(req, "if-none-match") {
        let matched = match (&list, etag) {
            (ETagList::Star, Some(_)) => true,
            (_, Some(tag)) => list.matches(tag),
            (_, None) => false,
        };
        if matched {
            return if req.method() == Method::GET || req.method() == Method::HEAD {
                Some(StatusCode::NOT_MODIFIED)
            } else {
                Some(StatusCode::PRECONDITION_FAILED)
            };
        }
    }

    None
}
