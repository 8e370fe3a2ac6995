//! The `multifilesystem` storage backend.
//!
//! Layout below `<filesystem_folder>/collection-root/`:
//!
//! ```text
//! <collection-path>/
//!   .Radicale.props          JSON property document (+tag)
//!   <item-name>              canonical iCalendar/vCard payload
//!   .Radicale.cache/
//!     item/<name>            parsed index per item
//!     history/<name>         last known etag per item ("" = deleted)
//!     sync-token/<token>     (name, etag) snapshot at token issuance
//! ```
//!
//! Internal files start with `.Radicale.`; other dotfiles are left
//! alone and never listed. Writes go through a same-directory tempfile
//! that is fsynced and renamed over the destination, so a crash leaves
//! only recognizable `.Radicale.tmp-*` debris.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::{debug, error, warn};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::config::Config;
use crate::ical::Item;
use crate::storage::{
    Collection, CollectionTag, FsError, FsResult, PropMap, Storage, SyncChanges,
};

pub(crate) const PROPS_FILE: &str = ".Radicale.props";
pub(crate) const CACHE_DIR: &str = ".Radicale.cache";
pub(crate) const TMP_PREFIX: &str = ".Radicale.tmp-";

pub(crate) struct MultiFs {
    root: PathBuf,
    cache_root: Option<PathBuf>,
    pub(crate) fsync: bool,
    pub(crate) use_cache_sub_item: bool,
    pub(crate) use_cache_sub_history: bool,
    pub(crate) use_cache_sub_synctoken: bool,
    pub(crate) mtime_size_cache: bool,
    pub(crate) max_sync_token_age: u64,
    pub(crate) debug_cache_actions: bool,
}

pub(crate) fn io_to_fs(e: io::Error) -> FsError {
    match e.kind() {
        io::ErrorKind::NotFound => FsError::NotFound,
        io::ErrorKind::AlreadyExists => FsError::Exists,
        io::ErrorKind::PermissionDenied => FsError::Forbidden,
        _ => {
            error!("storage failure: {}", e);
            FsError::GeneralFailure
        }
    }
}

fn check_segment(seg: &str) -> FsResult<()> {
    if seg.is_empty()
        || seg.starts_with('.')
        || seg == ".."
        || seg.contains(['/', '\\', '\0'])
    {
        return Err(FsError::InvalidName);
    }
    Ok(())
}

pub(crate) fn check_path(path: &str) -> FsResult<()> {
    if path.is_empty() {
        return Ok(());
    }
    for seg in path.split('/') {
        check_segment(seg)?;
    }
    Ok(())
}

impl MultiFs {
    pub fn new(config: &Config) -> io::Result<MultiFs> {
        #[cfg(unix)]
        if !config.storage.folder_umask.is_empty() {
            if let Ok(mask) = u32::from_str_radix(&config.storage.folder_umask, 8) {
                unsafe {
                    libc::umask(mask as libc::mode_t);
                }
            }
        }

        let root = Path::new(&config.storage.filesystem_folder).join("collection-root");
        fs::create_dir_all(&root)?;

        let cache_root = if config.storage.filesystem_cache_folder.is_empty() {
            None
        } else {
            let p = Path::new(&config.storage.filesystem_cache_folder).join("collection-cache");
            fs::create_dir_all(&p)?;
            Some(p)
        };

        let this = MultiFs {
            root,
            cache_root,
            fsync: config.storage.filesystem_fsync,
            use_cache_sub_item: config.storage.use_cache_subfolder_for_item,
            use_cache_sub_history: config.storage.use_cache_subfolder_for_history,
            use_cache_sub_synctoken: config.storage.use_cache_subfolder_for_synctoken,
            mtime_size_cache: config.storage.use_mtime_and_size_for_item_cache,
            max_sync_token_age: config.storage.max_sync_token_age,
            debug_cache_actions: config.logging.storage_cache_actions_on_debug,
        };
        if this.mtime_size_cache {
            this.probe_mtime_granularity();
        }
        Ok(this)
    }

    // The (mtime_ns, size) cache key is only sound when the filesystem
    // records mtimes finer than a microsecond.
    fn probe_mtime_granularity(&self) {
        let probe = || -> io::Result<u32> {
            let f = tempfile::Builder::new()
                .prefix(TMP_PREFIX)
                .tempfile_in(&self.root)?;
            Ok(f.as_file().metadata()?.modified().map(|m| {
                m.duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.subsec_nanos())
                    .unwrap_or(0)
            })?)
        };
        match (probe(), probe()) {
            (Ok(a), Ok(b)) if a % 1_000_000 == 0 && b % 1_000_000 == 0 => {
                warn!(
                    "filesystem mtime granularity is coarser than microseconds; \
                     the (mtime, size) item cache key may miss modifications"
                );
            }
            _ => {}
        }
    }

    pub(crate) fn node_dir(&self, path: &str) -> FsResult<PathBuf> {
        check_path(path)?;
        let mut dir = self.root.clone();
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            dir.push(seg);
        }
        Ok(dir)
    }

    /// Directory for one of the cache kinds of a collection, honoring
    /// the relocated cache folder options.
    pub(crate) fn cache_dir(&self, path: &str, kind: &str) -> FsResult<PathBuf> {
        let relocate = match kind {
            "item" => self.use_cache_sub_item,
            "history" => self.use_cache_sub_history,
            "sync-token" => self.use_cache_sub_synctoken,
            _ => false,
        };
        let base = match (&self.cache_root, relocate) {
            (Some(cache_root), true) => {
                let mut dir = cache_root.clone();
                for seg in path.split('/').filter(|s| !s.is_empty()) {
                    dir.push(seg);
                }
                dir
            }
            _ => self.node_dir(path)?,
        };
        Ok(base.join(CACHE_DIR).join(kind))
    }

    pub(crate) fn sync_dir_fd(&self, dir: &Path) {
        if !self.fsync {
            return;
        }
        #[cfg(unix)]
        if let Ok(f) = fs::File::open(dir) {
            let _ = f.sync_all();
        }
    }

    /// Write `data` to `dir/name` atomically.
    pub(crate) fn atomic_write(&self, dir: &Path, name: &str, data: &[u8]) -> io::Result<()> {
        let mut tmp = tempfile::Builder::new().prefix(TMP_PREFIX).tempfile_in(dir)?;
        tmp.write_all(data)?;
        if self.fsync {
            tmp.as_file().sync_all()?;
        }
        tmp.persist(dir.join(name)).map_err(|e| e.error)?;
        self.sync_dir_fd(dir);
        Ok(())
    }

    /// Move the target aside as tmp debris, then remove it.
    fn remove_via_tmp(&self, target: &Path) -> io::Result<()> {
        let parent = target.parent().unwrap_or(Path::new("."));
        let tmp = parent.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4().simple()));
        fs::rename(target, &tmp)?;
        let result = if tmp.is_dir() {
            fs::remove_dir_all(&tmp)
        } else {
            fs::remove_file(&tmp)
        };
        self.sync_dir_fd(parent);
        result
    }

    fn read_props_file(&self, dir: &Path) -> FsResult<(Option<CollectionTag>, PropMap)> {
        let path = dir.join(PROPS_FILE);
        let data = match fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok((None, PropMap::new()));
            }
            Err(e) => return Err(io_to_fs(e)),
        };
        let map: BTreeMap<String, JsonValue> = serde_json::from_slice(&data).map_err(|e| {
            error!("unreadable property document {:?}: {}", path, e);
            FsError::GeneralFailure
        })?;
        let mut tag = None;
        let mut props = PropMap::new();
        for (key, value) in map {
            let value = match value {
                JsonValue::String(s) => s,
                other => other.to_string(),
            };
            if key == "tag" {
                tag = CollectionTag::from_str(&value);
            } else {
                props.insert(key, value);
            }
        }
        Ok((tag, props))
    }

    fn write_props_file(
        &self,
        dir: &Path,
        tag: Option<CollectionTag>,
        props: &PropMap,
    ) -> FsResult<()> {
        let mut map: BTreeMap<&str, &str> = BTreeMap::new();
        if let Some(tag) = tag {
            map.insert("tag", tag.as_str());
        }
        for (k, v) in props {
            map.insert(k, v);
        }
        let data = serde_json::to_vec(&map).map_err(|_| FsError::GeneralFailure)?;
        self.atomic_write(dir, PROPS_FILE, &data).map_err(io_to_fs)
    }

    fn item_names(&self, dir: &Path) -> FsResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir).map_err(io_to_fs)? {
            let entry = entry.map_err(io_to_fs)?;
            let name = match entry.file_name().into_string() {
                Ok(n) => n,
                Err(_) => continue,
            };
            if name.starts_with('.') {
                // internal files and user dotfiles are not items.
                continue;
            }
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn load_item(&self, col: &Collection, name: &str) -> FsResult<Option<Item>> {
        check_segment(name)?;
        let dir = self.node_dir(&col.path)?;
        let file = dir.join(name);
        let data = match fs::read(&file) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_to_fs(e)),
        };
        let text = String::from_utf8_lossy(&data);
        let mut item = match Item::parse(&text) {
            Ok(i) => i,
            Err(e) => {
                warn!("failed to parse item {:?} in {:?}: {}", name, col.path, e);
                return Err(FsError::GeneralFailure);
            }
        };
        item.last_modified = fs::metadata(&file).and_then(|m| m.modified()).ok();
        // keep the index fresh for list().
        if let Err(e) = self.refresh_cache_entry(col, name, &file, &data, &item) {
            debug!("cannot refresh item cache for {:?}: {:?}", name, e);
        }
        Ok(Some(item))
    }
}

// exchange-style rename, used to swap collections.
#[cfg(target_os = "linux")]
pub(crate) fn exchange_rename(a: &Path, b: &Path) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    let ca = CString::new(a.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "nul in path"))?;
    let cb = CString::new(b.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "nul in path"))?;
    let ret = unsafe {
        libc::renameat2(
            libc::AT_FDCWD,
            ca.as_ptr(),
            libc::AT_FDCWD,
            cb.as_ptr(),
            libc::RENAME_EXCHANGE,
        )
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn exchange_rename(_a: &Path, _b: &Path) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "no exchange rename"))
}

impl Storage for MultiFs {
    fn collection(&self, path: &str) -> FsResult<Option<Collection>> {
        let dir = match self.node_dir(path) {
            Ok(d) => d,
            Err(FsError::InvalidName) => return Ok(None),
            Err(e) => return Err(e),
        };
        if !dir.is_dir() {
            return Ok(None);
        }
        let (tag, props) = self.read_props_file(&dir)?;
        Ok(Some(Collection {
            path: path.to_string(),
            tag,
            props,
        }))
    }

    fn subcollections(&self, path: &str) -> FsResult<Vec<Collection>> {
        let dir = self.node_dir(path)?;
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir).map_err(io_to_fs)? {
            let entry = entry.map_err(io_to_fs)?;
            let name = match entry.file_name().into_string() {
                Ok(n) => n,
                Err(_) => continue,
            };
            if name.starts_with('.') || !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let sub_path = if path.is_empty() {
                name
            } else {
                format!("{}/{}", path, name)
            };
            if let Some(col) = self.collection(&sub_path)? {
                out.push(col);
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    fn list(&self, col: &Collection) -> FsResult<Vec<(String, String)>> {
        let dir = self.node_dir(&col.path)?;
        let mut out = Vec::new();
        for name in self.item_names(&dir)? {
            match self.cached_entry(col, &name) {
                Ok(Some(entry)) => out.push((name, entry.etag)),
                Ok(None) => {}
                Err(e) => {
                    warn!("skipping unreadable item {:?} in {:?}: {:?}", name, col.path, e);
                }
            }
        }
        Ok(out)
    }

    fn find_uid(&self, col: &Collection, uid: &str) -> FsResult<Option<String>> {
        self.find_uid_impl(col, uid)
    }

    fn get(&self, col: &Collection, name: &str) -> FsResult<Option<Item>> {
        self.load_item(col, name)
    }

    fn get_all(&self, col: &Collection) -> FsResult<Vec<(String, Item)>> {
        let dir = self.node_dir(&col.path)?;
        let mut out = Vec::new();
        for name in self.item_names(&dir)? {
            match self.load_item(col, &name) {
                Ok(Some(item)) => out.push((name, item)),
                Ok(None) => {}
                Err(e) => {
                    warn!("skipping unreadable item {:?} in {:?}: {:?}", name, col.path, e);
                }
            }
        }
        Ok(out)
    }

    fn upload(&self, col: &Collection, name: &str, item: &Item) -> FsResult<()> {
        check_segment(name)?;
        let dir = self.node_dir(&col.path)?;
        if !dir.is_dir() {
            return Err(FsError::Conflict);
        }
        self.atomic_write(&dir, name, item.text().as_bytes())
            .map_err(io_to_fs)?;
        let file = dir.join(name);
        let data = fs::read(&file).map_err(io_to_fs)?;
        let _ = self.refresh_cache_entry(col, name, &file, &data, item);
        self.update_history(&col.path, name, item.etag());
        Ok(())
    }

    fn delete_item(&self, col: &Collection, name: &str) -> FsResult<()> {
        check_segment(name)?;
        let dir = self.node_dir(&col.path)?;
        let file = dir.join(name);
        if !file.is_file() {
            return Err(FsError::NotFound);
        }
        self.remove_via_tmp(&file).map_err(io_to_fs)?;
        self.drop_cache_entry(&col.path, name);
        self.update_history(&col.path, name, "");
        Ok(())
    }

    fn create_collection(
        &self,
        path: &str,
        tag: Option<CollectionTag>,
        props: PropMap,
    ) -> FsResult<Collection> {
        if path.is_empty() {
            return Err(FsError::Exists);
        }
        check_path(path)?;
        let dir = self.node_dir(path)?;
        if dir.exists() {
            return Err(FsError::Exists);
        }
        let parent_path = match path.rsplit_once('/') {
            Some((parent, _)) => parent,
            None => "",
        };
        match self.collection(parent_path)? {
            None => return Err(FsError::Conflict),
            Some(parent) if parent.tag.is_some() => return Err(FsError::Conflict),
            Some(_) => {}
        }
        fs::create_dir(&dir).map_err(io_to_fs)?;
        if tag.is_some() || !props.is_empty() {
            if let Err(e) = self.write_props_file(&dir, tag, &props) {
                // nothing must be left behind on error.
                let _ = fs::remove_dir_all(&dir);
                return Err(e);
            }
        }
        self.sync_dir_fd(dir.parent().unwrap_or(&self.root));
        Ok(Collection {
            path: path.to_string(),
            tag,
            props,
        })
    }

    fn replace_collection(
        &self,
        path: &str,
        tag: CollectionTag,
        items: &[(String, Item)],
        props: PropMap,
    ) -> FsResult<Collection> {
        if path.is_empty() {
            return Err(FsError::Conflict);
        }
        check_path(path)?;
        let dir = self.node_dir(path)?;
        let parent_path = match path.rsplit_once('/') {
            Some((parent, _)) => parent,
            None => "",
        };
        match self.collection(parent_path)? {
            None => return Err(FsError::Conflict),
            Some(parent) if parent.tag.is_some() => return Err(FsError::Conflict),
            Some(_) => {}
        }
        let parent_dir = dir.parent().unwrap_or(&self.root).to_path_buf();
        let tmp = parent_dir.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4().simple()));
        fs::create_dir(&tmp).map_err(io_to_fs)?;
        let build = || -> FsResult<()> {
            self.write_props_file(&tmp, Some(tag), &props)?;
            for (name, item) in items {
                check_segment(name)?;
                self.atomic_write(&tmp, name, item.text().as_bytes())
                    .map_err(io_to_fs)?;
            }
            Ok(())
        };
        if let Err(e) = build() {
            let _ = fs::remove_dir_all(&tmp);
            return Err(e);
        }

        if dir.exists() {
            match exchange_rename(&tmp, &dir) {
                Ok(()) => {
                    let _ = fs::remove_dir_all(&tmp);
                }
                Err(_) => {
                    // copy-then-delete fallback: move the old tree
                    // aside, move the new one in, drop the debris.
                    let old = parent_dir.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4().simple()));
                    fs::rename(&dir, &old).map_err(io_to_fs)?;
                    if let Err(e) = fs::rename(&tmp, &dir) {
                        let _ = fs::rename(&old, &dir);
                        let _ = fs::remove_dir_all(&tmp);
                        return Err(io_to_fs(e));
                    }
                    let _ = fs::remove_dir_all(&old);
                }
            }
        } else {
            fs::rename(&tmp, &dir).map_err(io_to_fs)?;
        }
        self.sync_dir_fd(&parent_dir);

        let col = Collection {
            path: path.to_string(),
            tag: Some(tag),
            props,
        };
        for (name, item) in items {
            self.update_history(path, name, item.etag());
        }
        Ok(col)
    }

    fn delete_collection(&self, col: &Collection) -> FsResult<()> {
        let dir = self.node_dir(&col.path)?;
        if col.is_root() {
            // deleting the root empties it.
            for entry in fs::read_dir(&dir).map_err(io_to_fs)? {
                let entry = entry.map_err(io_to_fs)?;
                let _ = self.remove_via_tmp(&entry.path());
            }
            return Ok(());
        }
        if !dir.is_dir() {
            return Err(FsError::NotFound);
        }
        self.remove_via_tmp(&dir).map_err(io_to_fs)
    }

    fn move_item(
        &self,
        src: &Collection,
        name: &str,
        dst: &Collection,
        dst_name: &str,
        overwrite: bool,
    ) -> FsResult<()> {
        check_segment(name)?;
        check_segment(dst_name)?;
        let src_file = self.node_dir(&src.path)?.join(name);
        let dst_dir = self.node_dir(&dst.path)?;
        let dst_file = dst_dir.join(dst_name);
        if !src_file.is_file() {
            return Err(FsError::NotFound);
        }
        if dst_file.exists() && !overwrite {
            return Err(FsError::Exists);
        }
        fs::rename(&src_file, &dst_file).map_err(io_to_fs)?;
        self.sync_dir_fd(&dst_dir);
        self.drop_cache_entry(&src.path, name);
        self.update_history(&src.path, name, "");
        // the destination cache entry is rebuilt on next access.
        if let Ok(Some(item)) = self.load_item(dst, dst_name) {
            self.update_history(&dst.path, dst_name, item.etag());
        }
        Ok(())
    }

    fn move_collection(&self, from: &str, to: &str, overwrite: bool) -> FsResult<()> {
        check_path(from)?;
        check_path(to)?;
        if from.is_empty() || to.is_empty() {
            return Err(FsError::Forbidden);
        }
        let src = self.node_dir(from)?;
        let dst = self.node_dir(to)?;
        if !src.is_dir() {
            return Err(FsError::NotFound);
        }
        let dst_parent = match to.rsplit_once('/') {
            Some((parent, _)) => parent,
            None => "",
        };
        match self.collection(dst_parent)? {
            None => return Err(FsError::Conflict),
            Some(parent) if parent.tag.is_some() => return Err(FsError::Conflict),
            Some(_) => {}
        }
        if dst.exists() {
            if !overwrite {
                return Err(FsError::Exists);
            }
            // swap, then drop what used to be the destination.
            exchange_rename(&src, &dst).map_err(|_| FsError::Exists)?;
            self.remove_via_tmp(&src).map_err(io_to_fs)?;
        } else {
            fs::rename(&src, &dst).map_err(io_to_fs)?;
        }
        self.sync_dir_fd(dst.parent().unwrap_or(&self.root));
        Ok(())
    }

    fn set_props(&self, col: &Collection, props: PropMap) -> FsResult<()> {
        let dir = self.node_dir(&col.path)?;
        if !dir.is_dir() {
            return Err(FsError::NotFound);
        }
        self.write_props_file(&dir, col.tag, &props)
    }

    fn last_modified(&self, col: &Collection) -> FsResult<SystemTime> {
        let dir = self.node_dir(&col.path)?;
        fs::metadata(&dir)
            .and_then(|m| m.modified())
            .map_err(io_to_fs)
    }

    fn sync(&self, col: &Collection, since: Option<&str>) -> FsResult<SyncChanges> {
        self.sync_impl(col, since)
    }

    fn verify(&self) -> FsResult<Vec<String>> {
        let mut issues = Vec::new();
        self.verify_node("", &mut issues)?;
        Ok(issues)
    }

    fn export(&self, destination: &Path) -> FsResult<()> {
        self.export_node("", destination)
    }
}

impl MultiFs {
    fn verify_node(&self, path: &str, issues: &mut Vec<String>) -> FsResult<()> {
        let col = match self.collection(path)? {
            Some(c) => c,
            None => {
                issues.push(format!("/{path}: not a collection"));
                return Ok(());
            }
        };
        let dir = self.node_dir(path)?;
        let subdirs: Vec<String> = fs::read_dir(&dir)
            .map_err(io_to_fs)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| !n.starts_with('.'))
            .collect();
        let item_names = self.item_names(&dir)?;

        match col.tag {
            Some(tag) => {
                if !subdirs.is_empty() {
                    issues.push(format!("/{path}: leaf collection has sub-collections"));
                }
                let mut uids: BTreeMap<String, String> = BTreeMap::new();
                for name in item_names {
                    match self.load_item(&col, &name) {
                        Ok(Some(item)) => {
                            if !tag.accepts(item.kind()) {
                                issues.push(format!(
                                    "/{path}/{name}: component {} does not match collection tag {}",
                                    item.kind().name(),
                                    tag.as_str()
                                ));
                            }
                            if let Some(other) = uids.get(item.uid()) {
                                issues.push(format!(
                                    "/{path}/{name}: UID {} already used by {}",
                                    item.uid(),
                                    other
                                ));
                            } else {
                                uids.insert(item.uid().to_string(), name.clone());
                            }
                        }
                        Ok(None) => {}
                        Err(_) => issues.push(format!("/{path}/{name}: unreadable or invalid item")),
                    }
                }
            }
            None => {
                if !item_names.is_empty() {
                    issues.push(format!("/{path}: untagged collection contains items"));
                }
                for sub in subdirs {
                    let sub_path = if path.is_empty() {
                        sub
                    } else {
                        format!("{path}/{sub}")
                    };
                    self.verify_node(&sub_path, issues)?;
                }
            }
        }
        Ok(())
    }

    fn export_node(&self, path: &str, destination: &Path) -> FsResult<()> {
        let col = match self.collection(path)? {
            Some(c) => c,
            None => return Err(FsError::NotFound),
        };
        let mut target = destination.to_path_buf();
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            target.push(seg);
        }
        fs::create_dir_all(&target).map_err(io_to_fs)?;
        match col.tag {
            Some(_) => {
                for (name, item) in self.get_all(&col)? {
                    fs::write(target.join(name), item.text()).map_err(io_to_fs)?;
                }
            }
            None => {
                for sub in self.subcollections(path)? {
                    self.export_node(&sub.path, destination)?;
                }
            }
        }
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::Storage;

    fn setup() -> (tempfile::TempDir, MultiFs) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.filesystem_folder = dir.path().to_str().unwrap().to_string();
        config.storage.filesystem_fsync = false;
        let fs = MultiFs::new(&config).unwrap();
        (dir, fs)
    }

    fn event(uid: &str) -> Item {
        Item::parse(&format!(
            "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:{uid}\r\nDTSTART:20240101T100000Z\r\n\
             END:VEVENT\r\nEND:VCALENDAR\r\n"
        ))
        .unwrap()
    }

    fn calendar(fs: &MultiFs, path: &str) -> Collection {
        fs.create_collection("alice", None, PropMap::new()).ok();
        fs.create_collection(path, Some(CollectionTag::Calendar), PropMap::new())
            .unwrap()
    }

    #[test]
    fn test_create_and_lookup() {
        let (_tmp, fs) = setup();
        let col = calendar(&fs, "alice/cal");
        assert_eq!(col.tag, Some(CollectionTag::Calendar));
        let found = fs.collection("alice/cal").unwrap().unwrap();
        assert_eq!(found.tag, Some(CollectionTag::Calendar));
        assert!(fs.collection("alice/none").unwrap().is_none());
    }

    #[test]
    fn test_create_requires_parent() {
        let (_tmp, fs) = setup();
        assert_eq!(
            fs.create_collection("bob/cal", Some(CollectionTag::Calendar), PropMap::new()),
            Err(FsError::Conflict)
        );
    }

    #[test]
    fn test_create_inside_leaf_refused() {
        let (_tmp, fs) = setup();
        calendar(&fs, "alice/cal");
        assert_eq!(
            fs.create_collection("alice/cal/sub", None, PropMap::new()),
            Err(FsError::Conflict)
        );
    }

    #[test]
    fn test_upload_get_roundtrip() {
        let (_tmp, fs) = setup();
        let col = calendar(&fs, "alice/cal");
        let item = event("e1");
        fs.upload(&col, "e1.ics", &item).unwrap();
        let loaded = fs.get(&col, "e1.ics").unwrap().unwrap();
        assert_eq!(loaded.text(), item.text());
        assert_eq!(loaded.etag(), item.etag());
        assert_eq!(loaded.uid(), "e1");
        let listing = fs.list(&col).unwrap();
        assert_eq!(listing, vec![("e1.ics".to_string(), item.etag().to_string())]);
    }

    #[test]
    fn test_delete_item() {
        let (_tmp, fs) = setup();
        let col = calendar(&fs, "alice/cal");
        fs.upload(&col, "e1.ics", &event("e1")).unwrap();
        fs.delete_item(&col, "e1.ics").unwrap();
        assert!(fs.get(&col, "e1.ics").unwrap().is_none());
        assert_eq!(fs.delete_item(&col, "e1.ics"), Err(FsError::NotFound));
        // no tmp debris left behind.
        let dir = fs.node_dir("alice/cal").unwrap();
        assert!(!std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with(TMP_PREFIX)));
    }

    #[test]
    fn test_find_uid() {
        let (_tmp, fs) = setup();
        let col = calendar(&fs, "alice/cal");
        fs.upload(&col, "e1.ics", &event("e1")).unwrap();
        assert_eq!(fs.find_uid(&col, "e1"), Ok(Some("e1.ics".to_string())));
        assert_eq!(fs.find_uid(&col, "other"), Ok(None));
    }

    #[test]
    fn test_move_collection() {
        let (_tmp, fs) = setup();
        let col = calendar(&fs, "alice/cal");
        fs.upload(&col, "e1.ics", &event("e1")).unwrap();
        fs.move_collection("alice/cal", "alice/cal2", false).unwrap();
        assert!(fs.collection("alice/cal").unwrap().is_none());
        let moved = fs.collection("alice/cal2").unwrap().unwrap();
        assert_eq!(fs.list(&moved).unwrap().len(), 1);
    }

    #[test]
    fn test_move_collection_no_overwrite() {
        let (_tmp, fs) = setup();
        calendar(&fs, "alice/cal");
        fs.create_collection("alice/cal2", Some(CollectionTag::Calendar), PropMap::new())
            .unwrap();
        assert_eq!(
            fs.move_collection("alice/cal", "alice/cal2", false),
            Err(FsError::Exists)
        );
    }

    #[test]
    fn test_replace_collection() {
        let (_tmp, fs) = setup();
        let col = calendar(&fs, "alice/cal");
        fs.upload(&col, "old.ics", &event("old")).unwrap();
        let items = vec![
            ("a.ics".to_string(), event("a")),
            ("b.ics".to_string(), event("b")),
        ];
        let col = fs
            .replace_collection("alice/cal", CollectionTag::Calendar, &items, PropMap::new())
            .unwrap();
        let names: Vec<String> = fs.list(&col).unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a.ics", "b.ics"]);
    }

    #[test]
    fn test_props_roundtrip() {
        let (_tmp, fs) = setup();
        let mut col = calendar(&fs, "alice/cal");
        let mut props = PropMap::new();
        props.insert("D:displayname".to_string(), "Vacation".to_string());
        props.insert("ICAL:calendar-color".to_string(), "#ff0000ff".to_string());
        fs.set_props(&col, props.clone()).unwrap();
        col = fs.collection("alice/cal").unwrap().unwrap();
        assert_eq!(col.props, props);
        assert_eq!(col.tag, Some(CollectionTag::Calendar));
    }

    #[test]
    fn test_dotfiles_ignored() {
        let (_tmp, fs) = setup();
        let col = calendar(&fs, "alice/cal");
        std::fs::write(fs.node_dir("alice/cal").unwrap().join(".hidden"), b"x").unwrap();
        assert!(fs.list(&col).unwrap().is_empty());
    }

    #[test]
    fn test_verify_reports_mismatch() {
        let (_tmp, fs) = setup();
        let col = calendar(&fs, "alice/cal");
        fs.upload(&col, "ok.ics", &event("e1")).unwrap();
        // sneak a card into a calendar.
        std::fs::write(
            fs.node_dir("alice/cal").unwrap().join("bad.vcf"),
            "BEGIN:VCARD\r\nVERSION:3.0\r\nUID:c1\r\nFN:X\r\nEND:VCARD\r\n",
        )
        .unwrap();
        let issues = fs.verify().unwrap();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("bad.vcf"));
    }
}
