//! Request/response interface to the remote provider.
//!
//! The transport behind this trait is not part of this crate. Every method answers with a
//! [`RemoteResult`]; translation into [`FsError`] happens in [`call`] once a response arrives,
//! except on the synchronization path which inspects raw statuses for its retry budget.

use std::ffi::{OsStr, OsString};
use std::future::Future;
use std::ops::Range;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use crate::error::{FsError, RemoteResult};
use crate::fs::{FileAttr, FileLocation, LocationUpdate, ModeBits, OpenFlags, Uuid};

/// One page of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildrenPage {
    /// Children in provider order. May repeat identifiers seen on earlier pages.
    pub children: Vec<FileAttr>,
    /// Set on the terminal page.
    pub is_last: bool,
}

/// Scheduling hint attached to synchronization requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum SyncPriority {
    /// A caller is blocked on the result.
    Immediate,
}

/// Answer to a combined synchronize-and-checksum request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksummedUpdate {
    /// Location delta, as for a plain synchronization.
    pub update: LocationUpdate,
    /// MD5 digest of the requested range as stored remotely.
    pub checksum: Bytes,
}

/// How `set_xattr` treats an existing attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum XattrMode {
    /// Create or replace.
    #[default]
    Upsert,
    /// Fail with `AlreadyExists` if present.
    Create,
    /// Fail with `NoData` if absent.
    Replace,
}

/// Space accounting for one space, as reported remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpaceUsage {
    /// Block size in bytes.
    pub block_size: u32,
    /// Total blocks available to the space.
    pub total_blocks: u64,
    /// Blocks already in use.
    pub occupied_blocks: u64,
}

/// The remote provider the cache fetches from and forwards mutations to.
pub trait RemoteProvider: Clone + Send + Sync + 'static {
    /// Fetch the attributes of one entry.
    fn get_attr(&self, uuid: &Uuid) -> impl Future<Output = RemoteResult<FileAttr>> + Send;

    /// Fetch the attributes of the child called `name` within `parent`.
    fn get_child_attr(
        &self,
        parent: &Uuid,
        name: &OsStr,
    ) -> impl Future<Output = RemoteResult<FileAttr>> + Send;

    /// Fetch up to `chunk` children of `dir`, starting at raw position `offset`.
    fn list_children(
        &self,
        dir: &Uuid,
        offset: usize,
        chunk: usize,
    ) -> impl Future<Output = RemoteResult<ChildrenPage>> + Send;

    /// Create a directory.
    fn create_dir(
        &self,
        parent: &Uuid,
        name: &OsStr,
        mode: ModeBits,
    ) -> impl Future<Output = RemoteResult<FileAttr>> + Send;

    /// Create an empty regular file.
    fn make_file(
        &self,
        parent: &Uuid,
        name: &OsStr,
        mode: ModeBits,
    ) -> impl Future<Output = RemoteResult<FileAttr>> + Send;

    /// Delete a file or an empty directory.
    fn delete(&self, uuid: &Uuid) -> impl Future<Output = RemoteResult<()>> + Send;

    /// Move an entry; answers with the identifier the entry has afterwards.
    fn rename(
        &self,
        uuid: &Uuid,
        new_parent: &Uuid,
        new_name: &OsStr,
    ) -> impl Future<Output = RemoteResult<Uuid>> + Send;

    /// Fetch the authoritative block map of a file.
    fn get_file_location(
        &self,
        uuid: &Uuid,
    ) -> impl Future<Output = RemoteResult<FileLocation>> + Send;

    /// Register an open of `uuid`; answers with the provider's handle id.
    fn open(
        &self,
        uuid: &Uuid,
        flags: OpenFlags,
    ) -> impl Future<Output = RemoteResult<String>> + Send;

    /// Release a handle obtained from [`open`](Self::open).
    fn release(&self, uuid: &Uuid, handle_id: &str) -> impl Future<Output = RemoteResult<()>> + Send;

    /// Ask the provider to make `range` of `uuid` locally readable.
    fn synchronize_block(
        &self,
        uuid: &Uuid,
        range: Range<u64>,
        priority: SyncPriority,
    ) -> impl Future<Output = RemoteResult<LocationUpdate>> + Send;

    /// Like [`synchronize_block`](Self::synchronize_block), also answering the range's checksum.
    fn synchronize_block_and_checksum(
        &self,
        uuid: &Uuid,
        range: Range<u64>,
        priority: SyncPriority,
    ) -> impl Future<Output = RemoteResult<ChecksummedUpdate>> + Send;

    /// Change permission bits.
    fn change_mode(&self, uuid: &Uuid, mode: ModeBits) -> impl Future<Output = RemoteResult<()>> + Send;

    /// Change access and/or modification times. `None` leaves a time unchanged.
    fn update_times(
        &self,
        uuid: &Uuid,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> impl Future<Output = RemoteResult<()>> + Send;

    /// Set the file size.
    fn truncate(&self, uuid: &Uuid, size: u64) -> impl Future<Output = RemoteResult<()>> + Send;

    /// Create a hard link to `uuid` called `name` in `new_parent`.
    fn make_link(
        &self,
        uuid: &Uuid,
        new_parent: &Uuid,
        name: &OsStr,
    ) -> impl Future<Output = RemoteResult<FileAttr>> + Send;

    /// Create a symbolic link.
    fn make_symlink(
        &self,
        parent: &Uuid,
        name: &OsStr,
        target: &OsStr,
    ) -> impl Future<Output = RemoteResult<FileAttr>> + Send;

    /// Read a symbolic link's target.
    fn read_symlink(&self, uuid: &Uuid) -> impl Future<Output = RemoteResult<OsString>> + Send;

    /// List extended attribute names.
    fn list_xattr(&self, uuid: &Uuid) -> impl Future<Output = RemoteResult<Vec<OsString>>> + Send;

    /// Read one extended attribute.
    fn get_xattr(&self, uuid: &Uuid, name: &OsStr)
    -> impl Future<Output = RemoteResult<Bytes>> + Send;

    /// Write one extended attribute.
    fn set_xattr(
        &self,
        uuid: &Uuid,
        name: &OsStr,
        value: Bytes,
        mode: XattrMode,
    ) -> impl Future<Output = RemoteResult<()>> + Send;

    /// Remove one extended attribute.
    fn remove_xattr(&self, uuid: &Uuid, name: &OsStr)
    -> impl Future<Output = RemoteResult<()>> + Send;

    /// Space usage of the space `root` belongs to.
    fn fs_stats(&self, root: &Uuid) -> impl Future<Output = RemoteResult<SpaceUsage>> + Send;
}

/// Awaits a remote request under `timeout`, translating its status.
pub(crate) async fn call<T>(
    timeout: Duration,
    request: impl Future<Output = RemoteResult<T>>,
) -> Result<T, FsError> {
    Ok(call_raw(timeout, request).await??)
}

/// Awaits a remote request under `timeout`, keeping its raw status.
///
/// The outer error is only ever [`FsError::TimedOut`].
pub(crate) async fn call_raw<T>(
    timeout: Duration,
    request: impl Future<Output = RemoteResult<T>>,
) -> Result<RemoteResult<T>, FsError> {
    tokio::time::timeout(timeout, request)
        .await
        .map_err(|_| FsError::TimedOut)
}
