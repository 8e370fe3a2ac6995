use http::{Request, Response, StatusCode};
use log::info;

use crate::body::Body;
use crate::conditional::if_match;
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::handler::DavInner;
use crate::storage::collection_etag;
use crate::DavResult;

impl DavInner {
    pub(crate) fn handle_delete(
        &self,
        req: &Request<()>,
        path: &DavPath,
    ) -> DavResult<Response<Body>> {
        let storage_path = path.storage_path();

        if let Some(col) = self.storage.collection(&storage_path)? {
            if !self.can_delete_collection(&col) {
                return Err(self.access_denied());
            }
            if col.tag.is_some() {
                let etag = collection_etag(&col, &self.storage.list(&col)?);
                if let Some(status) = if_match(req, Some(&etag)) {
                    return Err(status.into());
                }
            }
            info!("deleting collection /{} for {:?}", col.path, self.user);
            self.storage.delete_collection(&col)?;
            return Ok(no_content());
        }

        // not a collection: delete an item inside its parent.
        let parent_path = path.parent().storage_path();
        let col = match self.storage.collection(&parent_path)? {
            Some(col) if col.tag.is_some() => col,
            _ => return Err(self.not_found(&parent_path)),
        };
        if !self.can_write(&parent_path, true) {
            return Err(self.access_denied());
        }
        let item = match self.storage.get(&col, path.name())? {
            Some(item) => item,
            None => return Err(DavError::Status(StatusCode::NOT_FOUND)),
        };
        if let Some(status) = if_match(req, Some(item.etag())) {
            return Err(status.into());
        }
        self.storage.delete_item(&col, path.name())?;
        Ok(no_content())
    }
}

fn no_content() -> Response<Body> {
    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = StatusCode::NO_CONTENT;
    resp
}
