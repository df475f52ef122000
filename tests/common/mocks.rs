#![allow(missing_docs, clippy::unwrap_used)]

use std::collections::{HashMap, VecDeque};
use std::ffi::{OsStr, OsString};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use rfs_client::error::{RemoteResult, Status};
use rfs_client::fs::provider::{
    ChecksummedUpdate, ChildrenPage, RemoteProvider, SpaceUsage, SyncPriority, XattrMode,
};
use rfs_client::fs::{
    FileAttr, FileLocation, FileType, LocationUpdate, ModeBits, OpenFlags, StorageFileId, Uuid,
};
use rfs_client::{HelperSession, StorageHelper};

use super::file_attr;

pub const STORAGE: &str = "storage-1";

/// Everything the mock provider and mock helper serve, plus call counters.
#[derive(Default)]
pub struct MockState {
    pub attrs: Mutex<HashMap<Uuid, FileAttr>>,
    /// Scripted listing pages keyed by `(dir, offset)`.
    pub pages: Mutex<HashMap<(Uuid, usize), ChildrenPage>>,
    pub contents: Mutex<HashMap<Uuid, Vec<u8>>>,
    pub locations: Mutex<HashMap<Uuid, FileLocation>>,
    pub symlinks: Mutex<HashMap<Uuid, OsString>>,
    pub xattrs: Mutex<HashMap<(Uuid, OsString), Bytes>>,
    /// Answers consumed by successive synchronization requests; success once empty.
    pub sync_script: Mutex<VecDeque<Status>>,
    /// Replaces the computed checksum when set.
    pub bad_checksum: AtomicBool,
    /// When set, renames hand out a fresh identifier.
    pub rename_changes_id: AtomicBool,
    /// When set, sessions ask for checksum verification.
    pub consistency_check: AtomicBool,
    pub attr_delay_ms: AtomicU64,
    pub calls: Mutex<HashMap<&'static str, usize>>,
    pub sync_ranges: Mutex<Vec<Range<u64>>>,
    pub session_opens: AtomicUsize,
    pub session_closes: AtomicUsize,
    next_id: AtomicU64,
}

impl MockState {
    fn bump(&self, method: &'static str) {
        *self.calls.lock().unwrap().entry(method).or_default() += 1;
    }

    /// Number of calls made to `method`.
    pub fn calls(&self, method: &str) -> usize {
        self.calls.lock().unwrap().get(method).copied().unwrap_or(0)
    }

    /// Total number of remote calls of any kind.
    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn add(&self, attr: FileAttr) {
        self.attrs.lock().unwrap().insert(attr.uuid.clone(), attr);
    }

    /// Adds a file with `content` and a location knowing `known` of it.
    pub fn add_file(&self, uuid: &str, parent: &str, name: &str, content: &[u8], known: Option<Range<u64>>) {
        let attr = file_attr(uuid, parent, name, content.len() as u64);
        self.add(attr);
        self.contents
            .lock()
            .unwrap()
            .insert(Uuid::from(uuid), content.to_vec());
        let mut location = FileLocation::empty(Uuid::from(uuid), STORAGE, uuid);
        if let Some(range) = known {
            location.blocks.insert(range, None);
        }
        self.locations
            .lock()
            .unwrap()
            .insert(Uuid::from(uuid), location);
    }

    pub fn add_page(&self, dir: &str, offset: usize, children: Vec<FileAttr>, is_last: bool) {
        for child in &children {
            self.add(child.clone());
        }
        self.pages.lock().unwrap().insert(
            (Uuid::from(dir), offset),
            ChildrenPage { children, is_last },
        );
    }

    pub fn script_sync(&self, statuses: impl IntoIterator<Item = Status>) {
        self.sync_script.lock().unwrap().extend(statuses);
    }

    fn fresh_uuid(&self) -> Uuid {
        Uuid::new(format!("gen-{}", self.next_id.fetch_add(1, Ordering::Relaxed)))
    }

    fn attr(&self, uuid: &Uuid) -> RemoteResult<FileAttr> {
        self.attrs
            .lock()
            .unwrap()
            .get(uuid)
            .cloned()
            .ok_or(Status::NotFound)
    }

    fn create(&self, parent: &Uuid, name: &OsStr, file_type: FileType, mode: ModeBits) -> RemoteResult<FileAttr> {
        let mut attrs = self.attrs.lock().unwrap();
        if attrs
            .values()
            .any(|a| a.parent.as_ref() == Some(parent) && a.name == name)
        {
            return Err(Status::AlreadyExists);
        }
        let uuid = self.fresh_uuid();
        let mut attr = file_attr(uuid.as_str(), parent.as_str(), "", 0);
        attr.name = name.to_os_string();
        attr.file_type = file_type;
        attr.mode = mode;
        attrs.insert(uuid, attr.clone());
        Ok(attr)
    }

    fn location(&self, uuid: &Uuid) -> FileLocation {
        self.locations
            .lock()
            .unwrap()
            .get(uuid)
            .cloned()
            .unwrap_or_else(|| FileLocation::empty(uuid.clone(), STORAGE, uuid.as_str()))
    }

    fn synchronize(&self, uuid: &Uuid, range: Range<u64>) -> RemoteResult<LocationUpdate> {
        self.sync_ranges.lock().unwrap().push(range.clone());
        if let Some(status) = self.sync_script.lock().unwrap().pop_front() {
            return Err(status);
        }
        let mut location = self.location(uuid);
        location.blocks.insert(range.clone(), None);
        self.locations
            .lock()
            .unwrap()
            .insert(uuid.clone(), location.clone());
        Ok(LocationUpdate {
            location,
            changed: Some(range),
        })
    }
}

/// A scripted remote provider backed by [`MockState`].
#[derive(Clone, Default)]
pub struct MockProvider {
    pub state: Arc<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn helper(&self) -> MockHelper {
        MockHelper {
            state: Arc::clone(&self.state),
        }
    }
}

impl RemoteProvider for MockProvider {
    async fn get_attr(&self, uuid: &Uuid) -> RemoteResult<FileAttr> {
        self.state.bump("get_attr");
        let delay = self.state.attr_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.state.attr(uuid)
    }

    async fn get_child_attr(&self, parent: &Uuid, name: &OsStr) -> RemoteResult<FileAttr> {
        self.state.bump("get_child_attr");
        self.state
            .attrs
            .lock()
            .unwrap()
            .values()
            .find(|a| a.parent.as_ref() == Some(parent) && a.name == name)
            .cloned()
            .ok_or(Status::NotFound)
    }

    async fn list_children(
        &self,
        dir: &Uuid,
        offset: usize,
        chunk: usize,
    ) -> RemoteResult<ChildrenPage> {
        self.state.bump("list_children");
        if let Some(page) = self
            .state
            .pages
            .lock()
            .unwrap()
            .get(&(dir.clone(), offset))
        {
            return Ok(page.clone());
        }
        let mut children: Vec<FileAttr> = self
            .state
            .attrs
            .lock()
            .unwrap()
            .values()
            .filter(|a| a.parent.as_ref() == Some(dir))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        let end = (offset + chunk).min(children.len());
        let start = offset.min(end);
        Ok(ChildrenPage {
            is_last: end == children.len(),
            children: children[start..end].to_vec(),
        })
    }

    async fn create_dir(&self, parent: &Uuid, name: &OsStr, mode: ModeBits) -> RemoteResult<FileAttr> {
        self.state.bump("create_dir");
        self.state.create(parent, name, FileType::Directory, mode)
    }

    async fn make_file(&self, parent: &Uuid, name: &OsStr, mode: ModeBits) -> RemoteResult<FileAttr> {
        self.state.bump("make_file");
        self.state.create(parent, name, FileType::Regular, mode)
    }

    async fn delete(&self, uuid: &Uuid) -> RemoteResult<()> {
        self.state.bump("delete");
        let mut attrs = self.state.attrs.lock().unwrap();
        if attrs.values().any(|a| a.parent.as_ref() == Some(uuid)) {
            return Err(Status::NotEmpty);
        }
        attrs.remove(uuid).map(|_| ()).ok_or(Status::NotFound)
    }

    async fn rename(&self, uuid: &Uuid, new_parent: &Uuid, new_name: &OsStr) -> RemoteResult<Uuid> {
        self.state.bump("rename");
        let mut attrs = self.state.attrs.lock().unwrap();
        let mut attr = attrs.remove(uuid).ok_or(Status::NotFound)?;
        attrs.retain(|_, a| !(a.parent.as_ref() == Some(new_parent) && a.name == new_name));
        attr.parent = Some(new_parent.clone());
        attr.name = new_name.to_os_string();
        if self.state.rename_changes_id.load(Ordering::Relaxed) {
            attr.uuid = self.state.fresh_uuid();
        }
        let new = attr.uuid.clone();
        attrs.insert(new.clone(), attr);
        Ok(new)
    }

    async fn get_file_location(&self, uuid: &Uuid) -> RemoteResult<FileLocation> {
        self.state.bump("get_file_location");
        Ok(self.state.location(uuid))
    }

    async fn open(&self, uuid: &Uuid, _flags: OpenFlags) -> RemoteResult<String> {
        self.state.bump("open");
        Ok(format!("handle-{uuid}"))
    }

    async fn release(&self, _uuid: &Uuid, _handle_id: &str) -> RemoteResult<()> {
        self.state.bump("release");
        Ok(())
    }

    async fn synchronize_block(
        &self,
        uuid: &Uuid,
        range: Range<u64>,
        priority: SyncPriority,
    ) -> RemoteResult<LocationUpdate> {
        assert_eq!(priority, SyncPriority::Immediate);
        self.state.bump("synchronize_block");
        self.state.synchronize(uuid, range)
    }

    async fn synchronize_block_and_checksum(
        &self,
        uuid: &Uuid,
        range: Range<u64>,
        priority: SyncPriority,
    ) -> RemoteResult<ChecksummedUpdate> {
        assert_eq!(priority, SyncPriority::Immediate);
        self.state.bump("synchronize_block_and_checksum");
        let update = self.state.synchronize(uuid, range.clone())?;
        let checksum = if self.state.bad_checksum.load(Ordering::Relaxed) {
            Bytes::from_static(&[0; 16])
        } else {
            let contents = self.state.contents.lock().unwrap();
            let data = contents.get(uuid).map(Vec::as_slice).unwrap_or_default();
            let end = (range.end as usize).min(data.len());
            let start = (range.start as usize).min(end);
            Bytes::copy_from_slice(&md5::compute(&data[start..end]).0)
        };
        Ok(ChecksummedUpdate { update, checksum })
    }

    async fn change_mode(&self, uuid: &Uuid, mode: ModeBits) -> RemoteResult<()> {
        self.state.bump("change_mode");
        let mut attrs = self.state.attrs.lock().unwrap();
        attrs.get_mut(uuid).ok_or(Status::NotFound)?.mode = mode;
        Ok(())
    }

    async fn update_times(
        &self,
        uuid: &Uuid,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> RemoteResult<()> {
        self.state.bump("update_times");
        let mut attrs = self.state.attrs.lock().unwrap();
        let attr = attrs.get_mut(uuid).ok_or(Status::NotFound)?;
        if let Some(atime) = atime {
            attr.atime = atime;
        }
        if let Some(mtime) = mtime {
            attr.mtime = mtime;
        }
        Ok(())
    }

    async fn truncate(&self, uuid: &Uuid, size: u64) -> RemoteResult<()> {
        self.state.bump("truncate");
        let mut attrs = self.state.attrs.lock().unwrap();
        attrs.get_mut(uuid).ok_or(Status::NotFound)?.size = size;
        if let Some(content) = self.state.contents.lock().unwrap().get_mut(uuid) {
            content.resize(size as usize, 0);
        }
        Ok(())
    }

    async fn make_link(&self, uuid: &Uuid, new_parent: &Uuid, name: &OsStr) -> RemoteResult<FileAttr> {
        self.state.bump("make_link");
        let source = self.state.attr(uuid)?;
        let mut link = self
            .state
            .create(new_parent, name, source.file_type, source.mode)?;
        link.size = source.size;
        link.nlink = source.nlink + 1;
        self.state.add(link.clone());
        Ok(link)
    }

    async fn make_symlink(&self, parent: &Uuid, name: &OsStr, target: &OsStr) -> RemoteResult<FileAttr> {
        self.state.bump("make_symlink");
        let attr = self
            .state
            .create(parent, name, FileType::Symlink, ModeBits::ALL_RWX)?;
        self.state
            .symlinks
            .lock()
            .unwrap()
            .insert(attr.uuid.clone(), target.to_os_string());
        Ok(attr)
    }

    async fn read_symlink(&self, uuid: &Uuid) -> RemoteResult<OsString> {
        self.state.bump("read_symlink");
        self.state
            .symlinks
            .lock()
            .unwrap()
            .get(uuid)
            .cloned()
            .ok_or(Status::InvalidArgument)
    }

    async fn list_xattr(&self, uuid: &Uuid) -> RemoteResult<Vec<OsString>> {
        self.state.bump("list_xattr");
        let mut names: Vec<OsString> = self
            .state
            .xattrs
            .lock()
            .unwrap()
            .keys()
            .filter(|(owner, _)| owner == uuid)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn get_xattr(&self, uuid: &Uuid, name: &OsStr) -> RemoteResult<Bytes> {
        self.state.bump("get_xattr");
        self.state
            .xattrs
            .lock()
            .unwrap()
            .get(&(uuid.clone(), name.to_os_string()))
            .cloned()
            .ok_or(Status::NoData)
    }

    async fn set_xattr(&self, uuid: &Uuid, name: &OsStr, value: Bytes, mode: XattrMode) -> RemoteResult<()> {
        self.state.bump("set_xattr");
        let mut xattrs = self.state.xattrs.lock().unwrap();
        let key = (uuid.clone(), name.to_os_string());
        match (mode, xattrs.contains_key(&key)) {
            (XattrMode::Create, true) => return Err(Status::AlreadyExists),
            (XattrMode::Replace, false) => return Err(Status::NoData),
            _ => {}
        }
        xattrs.insert(key, value);
        Ok(())
    }

    async fn remove_xattr(&self, uuid: &Uuid, name: &OsStr) -> RemoteResult<()> {
        self.state.bump("remove_xattr");
        self.state
            .xattrs
            .lock()
            .unwrap()
            .remove(&(uuid.clone(), name.to_os_string()))
            .map(|_| ())
            .ok_or(Status::NoData)
    }

    async fn fs_stats(&self, _root: &Uuid) -> RemoteResult<SpaceUsage> {
        self.state.bump("fs_stats");
        Ok(SpaceUsage {
            block_size: 4096,
            total_blocks: 1000,
            occupied_blocks: 250,
        })
    }
}

/// Opens [`MockSession`]s over the contents held in [`MockState`].
#[derive(Clone)]
pub struct MockHelper {
    pub state: Arc<MockState>,
}

pub struct MockSession {
    state: Arc<MockState>,
    uuid: Uuid,
}

impl HelperSession for MockSession {
    async fn read(&self, offset: u64, size: u32) -> Result<Bytes, std::io::Error> {
        let contents = self.state.contents.lock().unwrap();
        let data = contents.get(&self.uuid).map(Vec::as_slice).unwrap_or_default();
        let start = (offset as usize).min(data.len());
        let end = (start + size as usize).min(data.len());
        Ok(Bytes::copy_from_slice(&data[start..end]))
    }

    async fn write(&self, offset: u64, data: Bytes) -> Result<usize, std::io::Error> {
        let mut contents = self.state.contents.lock().unwrap();
        let content = contents.entry(self.uuid.clone()).or_default();
        let end = offset as usize + data.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[offset as usize..end].copy_from_slice(&data);
        Ok(data.len())
    }

    async fn close(&self) -> Result<(), std::io::Error> {
        self.state.session_closes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn needs_data_consistency_check(&self) -> bool {
        self.state.consistency_check.load(Ordering::Relaxed)
    }
}

impl StorageHelper for MockHelper {
    type Session = MockSession;

    async fn open(
        &self,
        uuid: &Uuid,
        _backing: &StorageFileId,
        _flags: OpenFlags,
    ) -> Result<MockSession, std::io::Error> {
        self.state.session_opens.fetch_add(1, Ordering::Relaxed);
        Ok(MockSession {
            state: Arc::clone(&self.state),
            uuid: uuid.clone(),
        })
    }
}
