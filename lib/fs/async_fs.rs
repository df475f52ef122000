//! The filesystem facade the kernel adaptation layer calls into.
//!
//! [`RemoteFs`] ties the metadata cache, the open file registry, block synchronization and the
//! event applier together. Every operation either returns a value or one [`FsError`]; a failed
//! remote mutation leaves the cache as it was.

use std::ffi::{OsStr, OsString};
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::{Bytes, BytesMut};
use tracing::{debug, error, instrument, warn};

use crate::cache::{CacheSettings, MetadataCache};
use crate::config::Config;
use crate::error::FsError;
use crate::events::{EventSender, spawn_applier};
use crate::fs::block_sync::{BlockSync, checksum_matches};
use crate::fs::handles::{OpenFileRegistry, OpenHandle};
use crate::fs::helper::{HelperSession, StorageHelper};
use crate::fs::provider::{RemoteProvider, XattrMode, call};
use crate::fs::{
    DirEntry, FileAttr, FileHandle, FileType, FsStats, ModeBits, OpenFlags, Uuid,
};

/// Longest name the remote side accepts.
const MAX_NAME_LENGTH: u32 = 255;

/// A remote filesystem served through a local metadata cache.
pub struct RemoteFs<P: RemoteProvider, H: StorageHelper> {
    cache: Arc<MetadataCache<P>>,
    registry: Arc<OpenFileRegistry<H>>,
    sync: BlockSync<P>,
    provider: P,
    root: Uuid,
    timeout: Duration,
    events: EventSender,
}

impl<P: RemoteProvider, H: StorageHelper> RemoteFs<P, H> {
    /// Creates the filesystem rooted at `root` and starts its event applier.
    ///
    /// Must be called from within a tokio runtime. The root stays pinned for the lifetime of
    /// the filesystem.
    pub fn new(provider: P, helper: H, root: FileAttr, config: &Config) -> Self {
        let timeout = config.provider_timeout();
        let cache = Arc::new(MetadataCache::new(
            provider.clone(),
            CacheSettings::from(config),
        ));
        cache.pin_attr(&root);
        let registry = Arc::new(OpenFileRegistry::new(helper));
        let (events, _applier) = spawn_applier(Arc::clone(&cache), Arc::clone(&registry));

        Self {
            cache,
            registry,
            sync: BlockSync::new(provider.clone(), &config.sync, timeout),
            provider,
            root: root.uuid,
            timeout,
            events,
        }
    }

    /// The metadata cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<MetadataCache<P>> {
        &self.cache
    }

    /// The open file registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<OpenFileRegistry<H>> {
        &self.registry
    }

    /// Where the transport delivers push events.
    #[must_use]
    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    /// Identifier of the root directory.
    #[must_use]
    pub fn root(&self) -> &Uuid {
        &self.root
    }

    /// Attributes of `uuid`.
    #[instrument(skip(self))]
    pub async fn getattr(&self, uuid: &Uuid) -> Result<FileAttr, FsError> {
        self.cache.getattr(uuid).await
    }

    /// Resolves `name` within `parent`.
    #[instrument(skip(self))]
    pub async fn lookup(&self, parent: &Uuid, name: &OsStr) -> Result<FileAttr, FsError> {
        self.cache.lookup(parent, name).await
    }

    /// Creates a directory.
    #[instrument(skip(self))]
    pub async fn mkdir(
        &self,
        parent: &Uuid,
        name: &OsStr,
        mode: ModeBits,
    ) -> Result<FileAttr, FsError> {
        let attr = call(self.timeout, self.provider.create_dir(parent, name, mode)).await?;
        Ok(self.cache.on_created(attr))
    }

    /// Creates a regular file. `mode` is a raw `st_mode`; any other node type is rejected.
    #[instrument(skip(self))]
    pub async fn mknod(&self, parent: &Uuid, name: &OsStr, mode: u32) -> Result<FileAttr, FsError> {
        let kind = mode & u32::from(libc::S_IFMT);
        if kind != 0 && kind != u32::from(libc::S_IFREG) {
            debug!(kind = format_args!("{kind:o}"), "rejecting non-regular node type");
            return Err(FsError::OperationNotSupported);
        }
        let attr = call(
            self.timeout,
            self.provider
                .make_file(parent, name, ModeBits::from_mode(mode)),
        )
        .await?;
        Ok(self.cache.on_created(attr))
    }

    /// Removes a non-directory entry. An open file stays readable until its last handle closes.
    #[instrument(skip(self))]
    pub async fn unlink(&self, parent: &Uuid, name: &OsStr) -> Result<(), FsError> {
        let attr = self.cache.lookup(parent, name).await?;
        if attr.is_dir() {
            return Err(FsError::IsADirectory);
        }
        call(self.timeout, self.provider.delete(&attr.uuid)).await?;
        self.cache.apply_deleted(&attr.uuid);
        Ok(())
    }

    /// Removes an empty directory.
    #[instrument(skip(self))]
    pub async fn rmdir(&self, parent: &Uuid, name: &OsStr) -> Result<(), FsError> {
        let attr = self.cache.lookup(parent, name).await?;
        if !attr.is_dir() {
            return Err(FsError::NotADirectory);
        }
        call(self.timeout, self.provider.delete(&attr.uuid)).await?;
        self.cache.apply_deleted(&attr.uuid);
        Ok(())
    }

    /// Moves `(parent, name)` to `(new_parent, new_name)`.
    ///
    /// Returns the identifier the entry has afterwards, which may differ from the old one.
    #[instrument(skip(self))]
    pub async fn rename(
        &self,
        parent: &Uuid,
        name: &OsStr,
        new_parent: &Uuid,
        new_name: &OsStr,
    ) -> Result<Uuid, FsError> {
        let attr = self.cache.lookup(parent, name).await?;
        let new = call(
            self.timeout,
            self.provider.rename(&attr.uuid, new_parent, new_name),
        )
        .await?;
        self.cache
            .apply_renamed(&attr.uuid, &new, new_parent, new_name, true);
        debug!(old = %attr.uuid, new = %new, "renamed");
        Ok(new)
    }

    /// Changes permission bits.
    #[instrument(skip(self))]
    pub async fn chmod(&self, uuid: &Uuid, mode: ModeBits) -> Result<FileAttr, FsError> {
        call(self.timeout, self.provider.change_mode(uuid, mode)).await?;
        let now = SystemTime::now();
        match self.cache.update(uuid, |attr| {
            attr.mode = mode;
            attr.ctime = attr.ctime.max(now);
        }) {
            Some(attr) => Ok(attr),
            None => self.cache.getattr(uuid).await,
        }
    }

    /// Sets access and/or modification times. `None` leaves a time unchanged.
    #[instrument(skip(self))]
    pub async fn utime(
        &self,
        uuid: &Uuid,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<FileAttr, FsError> {
        call(self.timeout, self.provider.update_times(uuid, atime, mtime)).await?;
        match self.cache.update(uuid, |attr| {
            if let Some(atime) = atime {
                attr.atime = atime;
            }
            if let Some(mtime) = mtime {
                attr.mtime = mtime;
            }
        }) {
            Some(attr) => Ok(attr),
            None => self.cache.getattr(uuid).await,
        }
    }

    /// Begins listing `uuid`.
    #[instrument(skip(self))]
    pub async fn opendir(&self, uuid: &Uuid) -> Result<(), FsError> {
        self.cache.open_dir(uuid).await.map(|_| ())
    }

    /// Returns up to `chunk` entries of `uuid` from `offset`, `.` and `..` included.
    #[instrument(skip(self))]
    pub async fn readdir(
        &self,
        uuid: &Uuid,
        chunk: usize,
        offset: usize,
    ) -> Result<Vec<DirEntry>, FsError> {
        self.cache.list(uuid, chunk, offset).await
    }

    /// Ends listing `uuid`.
    pub fn releasedir(&self, uuid: &Uuid) {
        self.cache.close_dir(uuid);
    }

    /// Opens a file. The entry stays cached until the handle is released.
    #[instrument(skip(self))]
    pub async fn open(&self, uuid: &Uuid, flags: OpenFlags) -> Result<FileHandle, FsError> {
        let attr = self.cache.getattr(uuid).await?;
        if attr.is_dir() {
            return Err(FsError::IsADirectory);
        }

        self.cache.pin_attr(&attr);
        let opened = self.open_pinned(&attr, flags).await;
        if opened.is_err() {
            self.cache.unpin(uuid);
        }
        let handle = opened?;

        if flags.contains(OpenFlags::TRUNC)
            && attr.size > 0
            && let Err(e) = self.truncate(uuid, 0).await
        {
            if let Err(release) = self.release(handle.fh()).await {
                warn!(uuid = %uuid, error = %release, "failed to release handle after truncate");
            }
            return Err(e);
        }
        Ok(handle.fh())
    }

    async fn open_pinned(
        &self,
        attr: &FileAttr,
        flags: OpenFlags,
    ) -> Result<Arc<OpenHandle<H::Session>>, FsError> {
        let uuid = &attr.uuid;
        let remote_id = call(self.timeout, self.provider.open(uuid, flags)).await?;
        if let Some(handle) = self.registry.register(uuid, flags, remote_id.clone(), None) {
            return Ok(handle);
        }

        let location = match call(self.timeout, self.provider.get_file_location(uuid)).await {
            Ok(location) => location,
            Err(e) => {
                self.release_remote(uuid, &remote_id).await;
                return Err(e);
            }
        };
        self.registry
            .register(uuid, flags, remote_id, Some(location))
            .ok_or_else(|| FsError::Io("open file registration failed".to_owned()))
    }

    /// Reads up to `size` bytes at `offset`, synchronizing unknown ranges first.
    ///
    /// Reads at or past the end of the file return no bytes.
    #[instrument(skip(self))]
    pub async fn read(&self, fh: FileHandle, offset: u64, size: u32) -> Result<Bytes, FsError> {
        let handle = self.registry.get(fh)?;
        let uuid = handle.uuid().clone();
        let file_size = self.cache.getattr(&uuid).await?.size;
        if offset >= file_size || size == 0 {
            return Ok(Bytes::new());
        }
        let wanted = offset..file_size.min(offset.saturating_add(u64::from(size)));

        let default = handle.file().location().default_backing();
        let verify = self.sync.verify_checksums()
            || self
                .registry
                .session(&handle, &default)
                .await?
                .needs_data_consistency_check();

        let digest = self
            .sync
            .ensure_covered(handle.file(), wanted.clone(), file_size, verify)
            .await?;
        let data = self.read_segments(&handle, wanted.clone()).await?;

        if let Some(expected) = digest
            && !checksum_matches(&data, &expected)
        {
            error!(uuid = %uuid, range = ?wanted, "checksum mismatch after synchronization");
            self.registry.clear_blocks(&uuid);
            match call(self.timeout, self.provider.get_file_location(&uuid)).await {
                Ok(location) => self.registry.replace_location(&uuid, location),
                Err(e) => warn!(uuid = %uuid, error = %e, "failed to refetch file location"),
            }
            return Err(FsError::Io("checksum mismatch".to_owned()));
        }
        Ok(data)
    }

    async fn read_segments(
        &self,
        handle: &OpenHandle<H::Session>,
        wanted: Range<u64>,
    ) -> Result<Bytes, FsError> {
        let location = handle.file().location();
        let segments: Vec<_> = location
            .blocks
            .iter()
            .filter(|(range, _)| range.start < wanted.end && range.end > wanted.start)
            .map(|(range, backing)| {
                (
                    range.start.max(wanted.start)..range.end.min(wanted.end),
                    location.backing_for(backing),
                )
            })
            .collect();

        let mut out = BytesMut::new();
        let mut cursor = wanted.start;
        for (range, backing) in segments {
            if range.start != cursor {
                break;
            }
            let session = self.registry.session(handle, &backing).await?;
            let len = u32::try_from(range.end - range.start).unwrap_or(u32::MAX);
            let chunk = session.read(range.start, len).await?;
            let short = chunk.len() < len as usize;
            cursor += chunk.len() as u64;
            if out.is_empty() && (short || cursor == wanted.end) {
                return Ok(chunk);
            }
            out.extend_from_slice(&chunk);
            if short {
                break;
            }
        }
        Ok(out.freeze())
    }

    /// Writes `data` at `offset` through the file's default storage pair.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub async fn write(&self, fh: FileHandle, offset: u64, data: Bytes) -> Result<usize, FsError> {
        let handle = self.registry.get(fh)?;
        let uuid = handle.uuid().clone();
        let default = handle.file().location().default_backing();
        let session = self.registry.session(&handle, &default).await?;
        let written = session.write(offset, data).await?;

        let end = offset + written as u64;
        self.registry.record_written(&uuid, offset..end);
        let now = SystemTime::now();
        self.cache.update(&uuid, |attr| {
            attr.size = attr.size.max(end);
            attr.mtime = attr.mtime.max(now);
        });
        Ok(written)
    }

    /// Releases a handle, closing unreferenced sessions and performing deferred removals.
    #[instrument(skip(self))]
    pub async fn release(&self, fh: FileHandle) -> Result<(), FsError> {
        let released = self.registry.release(fh).await?;
        let outcome = call(
            self.timeout,
            self.provider.release(&released.uuid, &released.remote_id),
        )
        .await;
        self.cache.unpin(&released.uuid);
        outcome
    }

    async fn release_remote(&self, uuid: &Uuid, remote_id: &str) {
        if let Err(e) = call(self.timeout, self.provider.release(uuid, remote_id)).await {
            warn!(uuid = %uuid, error = %e, "failed to release remote handle");
        }
    }

    /// Sets the size of a file.
    #[instrument(skip(self))]
    pub async fn truncate(&self, uuid: &Uuid, size: u64) -> Result<(), FsError> {
        call(self.timeout, self.provider.truncate(uuid, size)).await?;
        let now = SystemTime::now();
        self.cache.update(uuid, |attr| {
            attr.size = size;
            attr.mtime = attr.mtime.max(now);
            attr.ctime = attr.ctime.max(now);
        });
        self.registry.truncate_blocks(uuid, size);
        Ok(())
    }

    /// Creates a hard link to `uuid` called `name` in `new_parent`.
    #[instrument(skip(self))]
    pub async fn link(
        &self,
        uuid: &Uuid,
        new_parent: &Uuid,
        name: &OsStr,
    ) -> Result<FileAttr, FsError> {
        let attr = call(self.timeout, self.provider.make_link(uuid, new_parent, name)).await?;
        Ok(self.cache.on_created(attr))
    }

    /// Creates a symbolic link.
    #[instrument(skip(self))]
    pub async fn symlink(
        &self,
        parent: &Uuid,
        name: &OsStr,
        target: &OsStr,
    ) -> Result<FileAttr, FsError> {
        let attr = call(
            self.timeout,
            self.provider.make_symlink(parent, name, target),
        )
        .await?;
        Ok(self.cache.on_created(attr))
    }

    /// Reads a symbolic link's target.
    #[instrument(skip(self))]
    pub async fn readlink(&self, uuid: &Uuid) -> Result<OsString, FsError> {
        let attr = self.cache.getattr(uuid).await?;
        if attr.file_type != FileType::Symlink {
            return Err(FsError::InvalidArgument);
        }
        call(self.timeout, self.provider.read_symlink(uuid)).await
    }

    /// Lists extended attribute names.
    #[instrument(skip(self))]
    pub async fn listxattr(&self, uuid: &Uuid) -> Result<Vec<OsString>, FsError> {
        call(self.timeout, self.provider.list_xattr(uuid)).await
    }

    /// Reads an extended attribute.
    #[instrument(skip(self))]
    pub async fn getxattr(&self, uuid: &Uuid, name: &OsStr) -> Result<Bytes, FsError> {
        call(self.timeout, self.provider.get_xattr(uuid, name)).await
    }

    /// Writes an extended attribute.
    #[instrument(skip(self, value), fields(len = value.len()))]
    pub async fn setxattr(
        &self,
        uuid: &Uuid,
        name: &OsStr,
        value: Bytes,
        mode: XattrMode,
    ) -> Result<(), FsError> {
        call(
            self.timeout,
            self.provider.set_xattr(uuid, name, value, mode),
        )
        .await
    }

    /// Removes an extended attribute.
    #[instrument(skip(self))]
    pub async fn removexattr(&self, uuid: &Uuid, name: &OsStr) -> Result<(), FsError> {
        call(self.timeout, self.provider.remove_xattr(uuid, name)).await
    }

    /// Space statistics of the space the root belongs to.
    #[instrument(skip(self))]
    pub async fn statfs(&self) -> Result<FsStats, FsError> {
        let usage = call(self.timeout, self.provider.fs_stats(&self.root)).await?;
        Ok(FsStats {
            block_size: usage.block_size,
            total_blocks: usage.total_blocks,
            free_blocks: usage.total_blocks.saturating_sub(usage.occupied_blocks),
            max_filename_length: MAX_NAME_LENGTH,
        })
    }
}
