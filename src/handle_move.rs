use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};
use log::{debug, info};

use crate::body::Body;
use crate::davheaders::{Destination, Overwrite};
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::handler::DavInner;
use crate::storage::FsError;
use crate::DavResult;

impl DavInner {
    pub(crate) fn handle_move(
        &self,
        req: &Request<()>,
        path: &DavPath,
    ) -> DavResult<Response<Body>> {
        let overwrite = req
            .headers()
            .typed_get::<Overwrite>()
            .map(|o| o.0)
            .unwrap_or(true);
        let dest = req
            .headers()
            .typed_get::<Destination>()
            .ok_or(DavError::Status(StatusCode::BAD_REQUEST))?;
        let dest = DavPath::from_str(&dest.0, path.prefix())?;

        if path.storage_path() == dest.storage_path() {
            return Err(DavError::Status(StatusCode::FORBIDDEN));
        }

        let source_path = path.storage_path();
        let dest_path = dest.storage_path();

        // moving a collection renames its node.
        if let Some(col) = self.storage.collection(&source_path)? {
            let leaf = col.tag.is_some();
            if !self.can_write(&source_path, leaf) || !self.can_write(&dest_path, leaf) {
                return Err(self.access_denied());
            }
            let dest_exists = self.storage.collection(&dest_path)?.is_some();
            if dest_exists {
                if !overwrite {
                    return Err(DavError::Status(StatusCode::PRECONDITION_FAILED));
                }
                if !self.can_overwrite_collection(&dest_path, leaf) {
                    return Err(self.access_denied());
                }
            }
            info!("moving collection /{} to /{}", source_path, dest_path);
            return match self.storage.move_collection(&source_path, &dest_path, overwrite) {
                Ok(()) => Ok(move_response(dest_exists)),
                // refused exchange on an occupied target.
                Err(FsError::Exists) => Err(DavError::Status(StatusCode::PRECONDITION_FAILED)),
                Err(e) => Err(e.into()),
            };
        }

        // otherwise move one item between (or within) leaf collections.
        let src_col = match self.storage.collection(&path.parent().storage_path())? {
            Some(col) if col.tag.is_some() => col,
            _ => return Err(self.not_found(&path.parent().storage_path())),
        };
        let dst_col = match self.storage.collection(&dest.parent().storage_path())? {
            Some(col) if col.tag.is_some() => col,
            _ => return Err(DavError::Status(StatusCode::CONFLICT)),
        };
        if src_col.tag != dst_col.tag {
            return Err(DavError::Status(StatusCode::CONFLICT));
        }
        if !self.can_write(&src_col.path, true) || !self.can_write(&dst_col.path, true) {
            return Err(self.access_denied());
        }

        let item = match self.storage.get(&src_col, path.name())? {
            Some(item) => item,
            None => return Err(DavError::Status(StatusCode::NOT_FOUND)),
        };
        let dest_occupied = self.storage.get(&dst_col, dest.name())?.is_some();
        if dest_occupied && !overwrite {
            return Err(DavError::Status(StatusCode::PRECONDITION_FAILED));
        }
        // the UID must stay unique in the target collection.
        if src_col.path != dst_col.path {
            if let Some(other) = self.storage.find_uid(&dst_col, item.uid())? {
                if other != dest.name() {
                    debug!(
                        "refusing MOVE: UID {:?} already present in /{} as {:?}",
                        item.uid(),
                        dst_col.path,
                        other
                    );
                    return Err(DavError::Status(StatusCode::CONFLICT));
                }
            }
        }

        self.storage
            .move_item(&src_col, path.name(), &dst_col, dest.name(), overwrite)?;
        Ok(move_response(dest_occupied))
    }
}

fn move_response(overwrote: bool) -> Response<Body> {
    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = if overwrote {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::CREATED
    };
    resp
}
