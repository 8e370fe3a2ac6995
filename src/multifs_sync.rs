//
// Sync tokens and per-item history for the multifilesystem backend.
//
// A sync token is a random 128-bit value written alongside a complete
// `{name: etag}` snapshot of the collection. `sync()` diffs the
// snapshot identified by the client's token against the current state.
// Tokens older than `max_sync_token_age` may be evicted; a missing
// token surfaces as `FsError::BadSyncToken` and is never guessed at.
//
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::time::SystemTime;

use log::debug;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::multifs::{io_to_fs, MultiFs};
use crate::storage::{Collection, FsError, FsResult, Storage, SyncChanges};

const TOKEN_URL_PREFIX: &str = "http://radicale.org/ns/sync/";
const POINTER_FILE: &str = "current";

// maps the latest issued token to the state it snapshot, so an
// unchanged collection keeps returning the same token.
#[derive(Serialize, Deserialize)]
struct TokenPointer {
    token: String,
    state_hash: String,
}

fn state_hash(state: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (name, etag) in state {
        hasher.update(name.as_bytes());
        hasher.update([0]);
        hasher.update(etag.as_bytes());
        hasher.update([0]);
    }
    format!("{:x}", hasher.finalize())
}

fn token_id(token: &str) -> FsResult<String> {
    let id = token.strip_prefix(TOKEN_URL_PREFIX).unwrap_or(token);
    if id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(id.to_string())
    } else {
        Err(FsError::BadSyncToken)
    }
}

impl MultiFs {
    /// Record the current etag of an item ("" after deletion).
    pub(crate) fn update_history(&self, col_path: &str, name: &str, etag: &str) {
        let write = || -> FsResult<()> {
            let dir = self.cache_dir(col_path, "history")?;
            fs::create_dir_all(&dir).map_err(io_to_fs)?;
            self.atomic_write(&dir, name, etag.as_bytes()).map_err(io_to_fs)
        };
        if let Err(e) = write() {
            debug!("cannot write history record for {:?}/{:?}: {:?}", col_path, name, e);
        }
    }

    pub(crate) fn sync_impl(&self, col: &Collection, since: Option<&str>) -> FsResult<SyncChanges> {
        let state: BTreeMap<String, String> = self.list(col)?.into_iter().collect();
        let hash = state_hash(&state);
        let token_dir = self.cache_dir(&col.path, "sync-token")?;
        fs::create_dir_all(&token_dir).map_err(io_to_fs)?;

        // reuse the current token when nothing changed since it was
        // issued, otherwise mint a fresh one with a new snapshot.
        let pointer: Option<TokenPointer> = fs::read(token_dir.join(POINTER_FILE))
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok());
        let token = match pointer {
            Some(p) if p.state_hash == hash && token_dir.join(&p.token).is_file() => p.token,
            _ => {
                let token = Uuid::new_v4().simple().to_string();
                let snapshot =
                    serde_json::to_vec(&state).map_err(|_| FsError::GeneralFailure)?;
                self.atomic_write(&token_dir, &token, &snapshot)
                    .map_err(io_to_fs)?;
                let pointer = TokenPointer {
                    token: token.clone(),
                    state_hash: hash,
                };
                let raw =
                    serde_json::to_vec(&pointer).map_err(|_| FsError::GeneralFailure)?;
                self.atomic_write(&token_dir, POINTER_FILE, &raw)
                    .map_err(io_to_fs)?;
                token
            }
        };

        self.evict_old_tokens(&token_dir, &token);

        let old_state: BTreeMap<String, String> = match since {
            None => BTreeMap::new(),
            Some(raw) => {
                let id = token_id(raw)?;
                let snapshot = match fs::read(token_dir.join(&id)) {
                    Ok(d) => d,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        return Err(FsError::BadSyncToken);
                    }
                    Err(e) => return Err(io_to_fs(e)),
                };
                serde_json::from_slice(&snapshot).map_err(|_| FsError::BadSyncToken)?
            }
        };

        let mut changed = Vec::new();
        let mut removed = Vec::new();
        for (name, etag) in &state {
            if old_state.get(name) != Some(etag) {
                changed.push(name.clone());
            }
        }
        for name in old_state.keys() {
            if !state.contains_key(name) {
                removed.push(name.clone());
            }
        }

        Ok(SyncChanges {
            token: format!("{}{}", TOKEN_URL_PREFIX, token),
            changed,
            removed,
        })
    }

    fn evict_old_tokens(&self, token_dir: &std::path::Path, current: &str) {
        let cutoff = std::time::Duration::from_secs(self.max_sync_token_age);
        let entries = match fs::read_dir(token_dir) {
            Ok(e) => e,
            Err(_) => return,
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == POINTER_FILE || name == current || name.starts_with('.') {
                continue;
            }
            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|m| SystemTime::now().duration_since(m).ok())
                .map(|age| age > cutoff)
                .unwrap_or(false);
            if stale {
                debug!("evicting sync token {:?}", name);
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ical::Item;
    use crate::storage::{CollectionTag, PropMap};

    fn setup() -> (tempfile::TempDir, MultiFs, Collection) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.filesystem_folder = dir.path().to_str().unwrap().to_string();
        config.storage.filesystem_fsync = false;
        let fs = MultiFs::new(&config).unwrap();
        fs.create_collection("alice", None, PropMap::new()).unwrap();
        let col = fs
            .create_collection("alice/cal", Some(CollectionTag::Calendar), PropMap::new())
            .unwrap();
        (dir, fs, col)
    }

    fn event(uid: &str) -> Item {
        Item::parse(&format!(
            "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:{uid}\r\nDTSTART:20240101T100000Z\r\n\
             END:VEVENT\r\nEND:VCALENDAR\r\n"
        ))
        .unwrap()
    }

    #[test]
    fn test_initial_sync_lists_everything() {
        let (_tmp, fs, col) = setup();
        fs.upload(&col, "a.ics", &event("a")).unwrap();
        fs.upload(&col, "b.ics", &event("b")).unwrap();
        let changes = fs.sync(&col, None).unwrap();
        assert_eq!(changes.changed, vec!["a.ics", "b.ics"]);
        assert!(changes.removed.is_empty());
        assert!(changes.token.starts_with(TOKEN_URL_PREFIX));
    }

    #[test]
    fn test_token_stable_without_changes() {
        let (_tmp, fs, col) = setup();
        fs.upload(&col, "a.ics", &event("a")).unwrap();
        let t1 = fs.sync(&col, None).unwrap().token;
        let t2 = fs.sync(&col, None).unwrap().token;
        assert_eq!(t1, t2);
    }

    #[test]
    fn test_diff_after_delete() {
        let (_tmp, fs, col) = setup();
        fs.upload(&col, "a.ics", &event("a")).unwrap();
        fs.upload(&col, "b.ics", &event("b")).unwrap();
        let t1 = fs.sync(&col, None).unwrap().token;
        fs.delete_item(&col, "a.ics").unwrap();
        let changes = fs.sync(&col, Some(&t1)).unwrap();
        assert!(changes.changed.is_empty());
        assert_eq!(changes.removed, vec!["a.ics"]);
        assert_ne!(changes.token, t1);
    }

    #[test]
    fn test_diff_after_modify() {
        let (_tmp, fs, col) = setup();
        fs.upload(&col, "a.ics", &event("a")).unwrap();
        let t1 = fs.sync(&col, None).unwrap().token;
        let modified = Item::parse(
            "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:a\r\nDTSTART:20240101T100000Z\r\n\
             SUMMARY:changed\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n",
        )
        .unwrap();
        fs.upload(&col, "a.ics", &modified).unwrap();
        let changes = fs.sync(&col, Some(&t1)).unwrap();
        assert_eq!(changes.changed, vec!["a.ics"]);
        assert!(changes.removed.is_empty());
    }

    #[test]
    fn test_unknown_token_rejected() {
        let (_tmp, fs, col) = setup();
        assert_eq!(
            fs.sync(&col, Some("http://radicale.org/ns/sync/deadbeefdeadbeefdeadbeefdeadbeef")),
            Err(FsError::BadSyncToken)
        );
        assert_eq!(fs.sync(&col, Some("garbage")), Err(FsError::BadSyncToken));
    }

    #[test]
    fn test_symmetric_difference_between_tokens() {
        let (_tmp, fs, col) = setup();
        fs.upload(&col, "a.ics", &event("a")).unwrap();
        let t1 = fs.sync(&col, None).unwrap().token;
        fs.upload(&col, "b.ics", &event("b")).unwrap();
        fs.delete_item(&col, "a.ics").unwrap();
        let changes = fs.sync(&col, Some(&t1)).unwrap();
        assert_eq!(changes.changed, vec!["b.ics"]);
        assert_eq!(changes.removed, vec!["a.ics"]);
    }
}
