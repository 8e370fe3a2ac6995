//
// The per-item cache of the multifilesystem backend.
//
// Each entry indexes one item: its etag, UID, component kind and a
// coarse time span used to prefilter time-range reports. The lookup
// key is either the SHA-256 of the payload or `(mtime_ns, size)`,
// depending on `use_mtime_and_size_for_item_cache`. Unreadable cache
// files are rebuilt transparently.
//
use std::fs;
use std::io;
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ical::{component_times, Item};
use crate::multifs::{io_to_fs, MultiFs};
use crate::storage::{Collection, FsError, FsResult, Storage};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CacheEntry {
    pub key: String,
    pub etag: String,
    pub uid: String,
    pub kind: String,
    /// Earliest instant covered by the item (unix seconds).
    pub start: Option<i64>,
    /// Latest instant, `None` when the item recurs without end.
    pub end: Option<i64>,
}

impl CacheEntry {
    fn build(key: String, item: &Item) -> CacheEntry {
        let mains = item.main_components();
        let mut start: Option<i64> = None;
        let mut end: Option<i64> = None;
        let mut unbounded = !item.kind().is_calendar();
        for comp in &mains {
            if comp.property("RRULE").is_some() {
                unbounded = true;
            }
            if let Some((s, e)) = component_times(comp) {
                start = Some(start.map_or(s.timestamp(), |v: i64| v.min(s.timestamp())));
                end = Some(end.map_or(e.timestamp(), |v: i64| v.max(e.timestamp())));
            } else {
                unbounded = true;
            }
        }
        CacheEntry {
            key,
            etag: item.etag().to_string(),
            uid: item.uid().to_string(),
            kind: item.kind().name().to_string(),
            start: if unbounded { None } else { start },
            end: if unbounded { None } else { end },
        }
    }
}

impl MultiFs {
    fn cache_key(&self, data: &[u8], file: &Path) -> FsResult<String> {
        if self.mtime_size_cache {
            let meta = fs::metadata(file).map_err(io_to_fs)?;
            let mtime_ns = meta
                .modified()
                .map_err(io_to_fs)?
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            Ok(format!("{}:{}", mtime_ns, meta.len()))
        } else {
            let mut hasher = Sha256::new();
            hasher.update(data);
            Ok(format!("{:x}", hasher.finalize()))
        }
    }

    /// Cached index for one item, parsing and re-caching on miss.
    /// `Ok(None)` when the payload file is gone.
    pub(crate) fn cached_entry(&self, col: &Collection, name: &str) -> FsResult<Option<CacheEntry>> {
        let dir = self.node_dir(&col.path)?;
        let file = dir.join(name);
        let data = match fs::read(&file) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_to_fs(e)),
        };
        let key = self.cache_key(&data, &file)?;

        let cache_file = self.cache_dir(&col.path, "item")?.join(name);
        if let Ok(raw) = fs::read(&cache_file) {
            match serde_json::from_slice::<CacheEntry>(&raw) {
                Ok(entry) if entry.key == key => {
                    if self.debug_cache_actions {
                        debug!("item cache hit for {:?}/{:?}", col.path, name);
                    }
                    return Ok(Some(entry));
                }
                Ok(_) => {
                    if self.debug_cache_actions {
                        debug!("item cache stale for {:?}/{:?}", col.path, name);
                    }
                }
                Err(e) => {
                    // a broken cache file invalidates only this entry.
                    debug!("discarding unreadable cache entry {:?}: {}", cache_file, e);
                }
            }
        }

        let text = String::from_utf8_lossy(&data);
        let item = Item::parse(&text).map_err(|_| FsError::GeneralFailure)?;
        let entry = self.write_cache_entry(col, name, key, &item)?;
        Ok(Some(entry))
    }

    pub(crate) fn refresh_cache_entry(
        &self,
        col: &Collection,
        name: &str,
        file: &Path,
        data: &[u8],
        item: &Item,
    ) -> FsResult<()> {
        let key = self.cache_key(data, file)?;
        self.write_cache_entry(col, name, key, item)?;
        Ok(())
    }

    fn write_cache_entry(
        &self,
        col: &Collection,
        name: &str,
        key: String,
        item: &Item,
    ) -> FsResult<CacheEntry> {
        let entry = CacheEntry::build(key, item);
        let cache_dir = self.cache_dir(&col.path, "item")?;
        fs::create_dir_all(&cache_dir).map_err(io_to_fs)?;
        let data = serde_json::to_vec(&entry).map_err(|_| FsError::GeneralFailure)?;
        self.atomic_write(&cache_dir, name, &data).map_err(io_to_fs)?;
        if self.debug_cache_actions {
            debug!("item cache write for {:?}/{:?}", col.path, name);
        }
        Ok(entry)
    }

    pub(crate) fn drop_cache_entry(&self, col_path: &str, name: &str) {
        if let Ok(dir) = self.cache_dir(col_path, "item") {
            let _ = fs::remove_file(dir.join(name));
        }
    }

    pub(crate) fn find_uid_impl(&self, col: &Collection, uid: &str) -> FsResult<Option<String>> {
        for (name, _) in self.list(col)? {
            if let Ok(Some(entry)) = self.cached_entry(col, &name) {
                if entry.uid == uid {
                    return Ok(Some(name));
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::{CollectionTag, PropMap};

    fn setup(mtime_cache: bool) -> (tempfile::TempDir, MultiFs, Collection) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.filesystem_folder = dir.path().to_str().unwrap().to_string();
        config.storage.filesystem_fsync = false;
        config.storage.use_mtime_and_size_for_item_cache = mtime_cache;
        let fs = MultiFs::new(&config).unwrap();
        fs.create_collection("alice", None, PropMap::new()).unwrap();
        let col = fs
            .create_collection("alice/cal", Some(CollectionTag::Calendar), PropMap::new())
            .unwrap();
        (dir, fs, col)
    }

    fn event(uid: &str, dtstart: &str) -> Item {
        Item::parse(&format!(
            "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:{uid}\r\nDTSTART:{dtstart}\r\n\
             DTEND:20240101T110000Z\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n"
        ))
        .unwrap()
    }

    #[test]
    fn test_cache_entry_reused() {
        let (_tmp, fs, col) = setup(false);
        fs.upload(&col, "e.ics", &event("e", "20240101T100000Z")).unwrap();
        let a = fs.cached_entry(&col, "e.ics").unwrap().unwrap();
        let b = fs.cached_entry(&col, "e.ics").unwrap().unwrap();
        assert_eq!(a.etag, b.etag);
        assert_eq!(a.uid, "e");
        assert_eq!(a.kind, "VEVENT");
        assert!(a.start.is_some() && a.end.is_some());
    }

    #[test]
    fn test_cache_rebuilt_when_corrupt() {
        let (_tmp, fs, col) = setup(false);
        fs.upload(&col, "e.ics", &event("e", "20240101T100000Z")).unwrap();
        let cache_file = fs.cache_dir("alice/cal", "item").unwrap().join("e.ics");
        std::fs::write(&cache_file, b"not json").unwrap();
        let entry = fs.cached_entry(&col, "e.ics").unwrap().unwrap();
        assert_eq!(entry.uid, "e");
    }

    #[test]
    fn test_cache_invalidated_on_change() {
        let (_tmp, fs, col) = setup(false);
        fs.upload(&col, "e.ics", &event("e", "20240101T100000Z")).unwrap();
        let a = fs.cached_entry(&col, "e.ics").unwrap().unwrap();
        // overwrite the payload behind the cache's back.
        let other = event("e", "20240101T120000Z");
        std::fs::write(
            fs.node_dir("alice/cal").unwrap().join("e.ics"),
            other.text(),
        )
        .unwrap();
        let b = fs.cached_entry(&col, "e.ics").unwrap().unwrap();
        assert_ne!(a.etag, b.etag);
        assert_eq!(b.etag, other.etag());
    }

    #[test]
    fn test_recurring_item_has_open_time_index() {
        let (_tmp, fs, col) = setup(false);
        let item = Item::parse(
            "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:r\r\nDTSTART:20240101T100000Z\r\n\
             RRULE:FREQ=DAILY\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n",
        )
        .unwrap();
        fs.upload(&col, "r.ics", &item).unwrap();
        let entry = fs.cached_entry(&col, "r.ics").unwrap().unwrap();
        assert!(entry.start.is_none() && entry.end.is_none());
    }
}
