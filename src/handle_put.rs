use http::{Request, Response, StatusCode};
use log::{debug, warn};

use crate::body::Body;
use crate::conditional::if_match;
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::handler::DavInner;
use crate::ical::{split_collection_upload, Item, ItemError};
use crate::storage::{collection_etag, CollectionTag, PropMap};
use crate::DavResult;

impl DavInner {
    pub(crate) fn handle_put(
        &self,
        req: &Request<()>,
        path: &DavPath,
        body: &[u8],
    ) -> DavResult<Response<Body>> {
        let storage_path = path.storage_path();
        let text = String::from_utf8_lossy(body).into_owned();

        // A PUT addressing a collection replaces the whole collection.
        // That covers an explicit trailing slash, an existing leaf
        // collection, and a fresh name directly below an untagged
        // parent (a new calendar or address book).
        let existing_col = self.storage.collection(&storage_path)?;
        let parent_path = path.parent().storage_path();
        let parent = self.storage.collection(&parent_path)?;
        let targets_collection = path.is_collection()
            || existing_col.as_ref().map(|c| c.tag.is_some()).unwrap_or(false)
            || (existing_col.is_none()
                && parent.as_ref().map(|c| c.tag.is_none()).unwrap_or(false));
        if targets_collection {
            return self.put_whole_collection(req, path, &text);
        }

        // ordinary item PUT into a leaf collection.
        let col = match parent {
            Some(col) => col,
            None => return Err(DavError::Status(StatusCode::CONFLICT)),
        };
        let tag = match col.tag {
            Some(tag) => tag,
            None => return Err(DavError::Status(StatusCode::CONFLICT)),
        };
        if !self.can_write(&parent_path, true) {
            return Err(self.access_denied());
        }

        let item = Item::parse(&text).map_err(|e| {
            debug!("rejecting invalid PUT body for {}: {}", path, e);
            e
        })?;
        if !tag.accepts(item.kind()) {
            return Err(DavError::Item(ItemError::Invalid(format!(
                "component {} does not belong in a {} collection",
                item.kind().name(),
                tag.as_str()
            ))));
        }

        let name = path.name().to_string();
        let existing = self.storage.get(&col, &name)?;
        if let Some(status) = if_match(req, existing.as_ref().map(|i| i.etag())) {
            return Err(status.into());
        }

        // one UID per collection; a different item may not claim it.
        if let Some(other) = self.storage.find_uid(&col, item.uid())? {
            if other != name {
                warn!(
                    "rejecting PUT of {}: UID {:?} already used by {:?}",
                    path,
                    item.uid(),
                    other
                );
                return Err(DavError::Status(StatusCode::CONFLICT));
            }
        }

        self.storage.upload(&col, &name, &item)?;

        let mut resp = Response::new(Body::empty());
        *resp.status_mut() = if existing.is_some() {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::CREATED
        };
        resp.headers_mut()
            .insert("etag", item.etag().parse().unwrap());
        Ok(resp)
    }

    // the body holds a whole calendar or address book; every component
    // becomes an item.
    fn put_whole_collection(
        &self,
        req: &Request<()>,
        path: &DavPath,
        text: &str,
    ) -> DavResult<Response<Body>> {
        let storage_path = path.storage_path();
        if storage_path.is_empty() {
            return Err(DavError::Status(StatusCode::FORBIDDEN));
        }
        if !self.can_write(&storage_path, true) {
            return Err(self.access_denied());
        }

        let items = split_collection_upload(text)?;
        let tag = match items.first() {
            Some(item) if item.kind().is_calendar() => CollectionTag::Calendar,
            Some(_) => CollectionTag::Addressbook,
            None => return Err(DavError::Item(ItemError::Invalid("empty upload".to_string()))),
        };
        for item in &items {
            if !tag.accepts(item.kind()) {
                return Err(DavError::Item(ItemError::Invalid(
                    "upload mixes calendar and address book components".to_string(),
                )));
            }
        }

        let existing = self.storage.collection(&storage_path)?;
        let (exists, props) = match &existing {
            Some(col) => {
                if !self.can_overwrite_collection(&storage_path, true) {
                    return Err(self.access_denied());
                }
                let etag = collection_etag(col, &self.storage.list(col)?);
                if let Some(status) = if_match(req, Some(&etag)) {
                    return Err(status.into());
                }
                (true, col.props.clone())
            }
            None => {
                if let Some(status) = if_match(req, None) {
                    return Err(status.into());
                }
                (false, PropMap::new())
            }
        };

        let named: Vec<(String, Item)> = items
            .into_iter()
            .map(|item| (item_file_name(&item), item))
            .collect();
        let col = self
            .storage
            .replace_collection(&storage_path, tag, &named, props)?;

        let etag = collection_etag(&col, &self.storage.list(&col)?);
        let mut resp = Response::new(Body::empty());
        *resp.status_mut() = if exists {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::CREATED
        };
        resp.headers_mut().insert("etag", etag.parse().unwrap());
        Ok(resp)
    }
}

// filename-safe item name derived from the UID.
fn item_file_name(item: &Item) -> String {
    let safe: String = item
        .uid()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '@' {
                c
            } else {
                '_'
            }
        })
        .take(100)
        .collect();
    let extension = if item.kind().is_calendar() { "ics" } else { "vcf" };
    format!("{}.{}", safe, extension)
}
