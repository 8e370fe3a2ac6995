use http::{Request, Response, StatusCode};
use log::debug;

use crate::body::Body;
use crate::conditional::if_match;
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::handler::DavInner;
use crate::ical::{Item, PRODID};
use crate::storage::{collection_etag, Collection, CollectionTag};
use crate::util::systemtime_to_httpdate;
use crate::DavResult;

impl DavInner {
    // GET and HEAD; the dispatcher strips the body for HEAD.
    pub(crate) fn handle_get(&self, req: &Request<()>, path: &DavPath) -> DavResult<Response<Body>> {
        let storage_path = path.storage_path();

        if let Some(col) = self.storage.collection(&storage_path)? {
            return match col.tag {
                Some(tag) => {
                    if !self.can_read_http(&storage_path, true) {
                        return Err(self.access_denied());
                    }
                    self.collection_body(req, &col, tag)
                }
                None => {
                    // untagged collections have no representation.
                    debug!("GET on untagged collection {}", path);
                    Err(self.not_found(&storage_path))
                }
            };
        }

        // otherwise this may be an item inside a leaf collection.
        let parent_path = path.parent().storage_path();
        let col = match self.storage.collection(&parent_path)? {
            Some(col) if col.tag.is_some() => col,
            _ => return Err(self.not_found(&parent_path)),
        };
        if !self.can_read_http(&parent_path, true) {
            return Err(self.access_denied());
        }
        let item = match self.storage.get(&col, path.name())? {
            Some(item) => item,
            None => return Err(DavError::Status(StatusCode::NOT_FOUND)),
        };

        if let Some(status) = if_match(req, Some(item.etag())) {
            return Err(status.into());
        }

        let mut resp = Response::new(Body::from(item.text().to_string()));
        resp.headers_mut()
            .insert("content-type", item.content_type().parse().unwrap());
        resp.headers_mut()
            .insert("etag", item.etag().parse().unwrap());
        if let Some(modified) = item.last_modified {
            resp.headers_mut().insert(
                "last-modified",
                systemtime_to_httpdate(modified).parse().unwrap(),
            );
        }
        Ok(resp)
    }

    // a leaf collection is served as the concatenation of its items.
    fn collection_body(
        &self,
        req: &Request<()>,
        col: &Collection,
        tag: CollectionTag,
    ) -> DavResult<Response<Body>> {
        let items = self.storage.get_all(col)?;
        let listing: Vec<(String, String)> = items
            .iter()
            .map(|(name, item)| (name.clone(), item.etag().to_string()))
            .collect();
        let etag = collection_etag(col, &listing);

        if let Some(status) = if_match(req, Some(&etag)) {
            return Err(status.into());
        }

        let (body, content_type) = match tag {
            CollectionTag::Calendar => (merge_calendar(col, &items), "text/calendar; charset=utf-8"),
            CollectionTag::Addressbook => {
                let mut out = String::new();
                for (_, item) in &items {
                    out.push_str(item.text());
                }
                (out, "text/vcard; charset=utf-8")
            }
        };

        let mut resp = Response::new(Body::from(body));
        *resp.status_mut() = StatusCode::OK;
        resp.headers_mut()
            .insert("content-type", content_type.parse().unwrap());
        resp.headers_mut().insert("etag", etag.parse().unwrap());
        if let Ok(modified) = self.storage.last_modified(col) {
            resp.headers_mut().insert(
                "last-modified",
                systemtime_to_httpdate(modified).parse().unwrap(),
            );
        }
        Ok(resp)
    }
}

// one VCALENDAR with the components of all items, timezones deduped,
// and the collection metadata as X-WR properties.
fn merge_calendar(col: &Collection, items: &[(String, Item)]) -> String {
    let mut out = String::new();
    out.push_str("BEGIN:VCALENDAR\r\nVERSION:2.0\r\n");
    crate::ical::ContentLine::new("PRODID", PRODID).serialize_into(&mut out);
    if let Some(name) = col.props.get("D:displayname") {
        crate::ical::ContentLine::new("X-WR-CALNAME", name.clone()).serialize_into(&mut out);
    }
    if let Some(desc) = col.props.get("C:calendar-description") {
        crate::ical::ContentLine::new("X-WR-CALDESC", desc.clone()).serialize_into(&mut out);
    }
    let mut seen_tzids: Vec<String> = Vec::new();
    for (_, item) in items {
        for tz in item.timezones() {
            let tzid = tz
                .property("TZID")
                .map(|p| p.value.clone())
                .unwrap_or_default();
            if seen_tzids.contains(&tzid) {
                continue;
            }
            seen_tzids.push(tzid);
            tz.serialize_into(&mut out);
        }
    }
    for (_, item) in items {
        for comp in item.main_components() {
            comp.serialize_into(&mut out);
        }
    }
    out.push_str("END:VCALENDAR\r\n");
    out
}
