use headers::HeaderMapExt;
use http::{Response, StatusCode};
use log::info;
use xmltree::Element;

use crate::body::Body;
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::handler::DavInner;
use crate::storage::{CollectionTag, FsError, PropMap};
use crate::xmlutil::{parse_xml, qualified_name, ElementExt, NS_CALDAV, NS_CARDDAV, NS_DAV};
use crate::DavResult;

impl DavInner {
    // MKCOL and MKCALENDAR. Extended bodies set properties atomically;
    // nothing is created when the body is invalid.
    pub(crate) fn handle_mkcol(
        &self,
        path: &DavPath,
        body: &[u8],
        mkcalendar: bool,
    ) -> DavResult<Response<Body>> {
        let storage_path = path.storage_path();
        if storage_path.is_empty() {
            return Err(DavError::Status(StatusCode::FORBIDDEN));
        }
        if !self.can_write(&storage_path, false) && !self.can_write(&storage_path, true) {
            return Err(self.access_denied());
        }

        let (mut tag, props) = if body.is_empty() {
            (None, PropMap::new())
        } else {
            parse_mkcol_body(body, mkcalendar)?
        };
        if mkcalendar {
            tag = Some(CollectionTag::Calendar);
        }

        info!(
            "creating collection /{} (tag {:?}) for {:?}",
            storage_path,
            tag.map(CollectionTag::as_str),
            self.user
        );
        match self.storage.create_collection(&storage_path, tag, props) {
            // RFC 4918 9.3.1 MKCOL status codes.
            Err(FsError::Exists) => Err(DavError::Status(StatusCode::METHOD_NOT_ALLOWED)),
            Err(FsError::Conflict) | Err(FsError::NotFound) => {
                Err(DavError::Status(StatusCode::CONFLICT))
            }
            Err(e) => Err(e.into()),
            Ok(_) => {
                let mut resp = Response::new(Body::empty());
                *resp.status_mut() = StatusCode::CREATED;
                resp.headers_mut().typed_insert(headers::ContentLength(0));
                Ok(resp)
            }
        }
    }
}

// parse `D:mkcol` / `C:mkcalendar` bodies into (tag, properties).
fn parse_mkcol_body(
    body: &[u8],
    mkcalendar: bool,
) -> DavResult<(Option<CollectionTag>, PropMap)> {
    let root = parse_xml(body)?;
    let valid_root = if mkcalendar {
        root.is(NS_CALDAV, "mkcalendar")
    } else {
        root.is(NS_DAV, "mkcol")
    };
    if !valid_root {
        return Err(DavError::XmlParseError);
    }

    let mut tag = None;
    let mut props = PropMap::new();
    for set in root.child_elems() {
        if !set.is(NS_DAV, "set") {
            continue;
        }
        let prop = match set.find(NS_DAV, "prop") {
            Some(p) => p,
            None => continue,
        };
        for elem in prop.child_elems() {
            if elem.is(NS_DAV, "resourcetype") {
                for rt in elem.child_elems() {
                    if rt.is(NS_CALDAV, "calendar") {
                        tag = Some(CollectionTag::Calendar);
                    } else if rt.is(NS_CARDDAV, "addressbook") {
                        tag = Some(CollectionTag::Addressbook);
                    }
                }
                continue;
            }
            props.insert(qualified_name(elem), property_value(elem));
        }
    }
    Ok((tag, props))
}

// the stored value of a property element; structured values collapse
// to a comma list (supported-calendar-component-set), everything else
// to its text.
pub(crate) fn property_value(elem: &Element) -> String {
    if elem.is(NS_CALDAV, "supported-calendar-component-set") {
        let comps: Vec<String> = elem
            .child_elems()
            .iter()
            .filter(|c| c.is(NS_CALDAV, "comp"))
            .filter_map(|c| c.attributes.get("name").cloned())
            .collect();
        if !comps.is_empty() {
            return comps.join(",");
        }
    }
    elem.text_content()
}
