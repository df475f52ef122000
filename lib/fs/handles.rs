//! Registry of open file handles.
//!
//! Every handle belongs to one [`OpenFile`], shared by all handles on the same identifier, which
//! owns the file's known block map. Storage sessions are shared across handles per
//! (storage, file) pair and closed when the last handle referencing the pair is released.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::error::FsError;
use crate::fs::helper::{HelperSession, StorageHelper};
use crate::fs::session_ward::SessionWard;
use crate::fs::{FileHandle, FileLocation, LocationUpdate, OpenFlags, StorageFileId, Uuid};

/// Per-identifier state shared by every handle open on it.
#[derive(Debug)]
pub struct OpenFile {
    uuid: Uuid,
    location: RwLock<FileLocation>,
    handles: AtomicUsize,
}

impl OpenFile {
    fn new(location: FileLocation) -> Self {
        Self {
            uuid: location.uuid.clone(),
            location: RwLock::new(location),
            handles: AtomicUsize::new(0),
        }
    }

    /// The identifier this file is open on.
    #[must_use]
    pub fn uuid(&self) -> &Uuid {
        &self.uuid
    }

    /// A snapshot of the current location.
    #[must_use]
    pub fn location(&self) -> FileLocation {
        self.location
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether every byte of `range` is known.
    #[must_use]
    pub fn covers(&self, range: Range<u64>) -> bool {
        self.location
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .blocks
            .covers(range)
    }

    /// The unknown sub-ranges of `range`.
    #[must_use]
    pub fn gaps(&self, range: Range<u64>) -> Vec<Range<u64>> {
        self.location
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .blocks
            .gaps(range)
    }

    /// Mutates the location in place.
    pub fn with_location<T>(&self, f: impl FnOnce(&mut FileLocation) -> T) -> T {
        let mut location = self
            .location
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut location)
    }

    /// Number of handles open on this file.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        self.handles.load(Ordering::Acquire)
    }
}

/// One `open()` on a file.
#[derive(Debug)]
pub struct OpenHandle<S> {
    fh: FileHandle,
    flags: OpenFlags,
    remote_id: String,
    file: Arc<OpenFile>,
    /// Pairs this handle holds a session reference on.
    sessions: Mutex<FxHashMap<StorageFileId, Arc<S>>>,
}

impl<S> OpenHandle<S> {
    /// The handle number returned to the kernel.
    #[must_use]
    pub fn fh(&self) -> FileHandle {
        self.fh
    }

    /// The identifier this handle is open on.
    #[must_use]
    pub fn uuid(&self) -> &Uuid {
        &self.file.uuid
    }

    /// Flags the handle was opened with.
    #[must_use]
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// The provider's id for this handle.
    #[must_use]
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// The shared per-file state.
    #[must_use]
    pub fn file(&self) -> &Arc<OpenFile> {
        &self.file
    }
}

/// What a release leaves for the caller to finish remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    /// Identifier the handle was open on.
    pub uuid: Uuid,
    /// The provider's id for the handle.
    pub remote_id: String,
    /// Whether this was the last handle on the identifier.
    pub last_handle: bool,
}

/// Open handles, open files, and shared storage sessions.
pub struct OpenFileRegistry<H: StorageHelper> {
    helper: H,
    handles: scc::HashMap<FileHandle, Arc<OpenHandle<H::Session>>>,
    files: scc::HashMap<Uuid, Arc<OpenFile>>,
    sessions: Mutex<SessionWard<StorageFileId, H::Session>>,
    /// Monotonically increasing file handle counter. Starts at 1 (0 is reserved).
    next_fh: AtomicU64,
}

impl<H: StorageHelper> OpenFileRegistry<H> {
    /// Creates an empty registry opening sessions through `helper`.
    pub fn new(helper: H) -> Self {
        Self {
            helper,
            handles: scc::HashMap::new(),
            files: scc::HashMap::new(),
            sessions: Mutex::new(SessionWard::default()),
            next_fh: AtomicU64::new(1),
        }
    }

    /// The shared state of `uuid` if any handle is open on it.
    #[must_use]
    pub fn open_file(&self, uuid: &Uuid) -> Option<Arc<OpenFile>> {
        self.files.read_sync(uuid, |_, file| Arc::clone(file))
    }

    /// Registers a new handle on `uuid`.
    ///
    /// `location` seeds the shared state when no handle is open on `uuid` yet; it is ignored
    /// otherwise. Returns `None` when the file is not open and no location was supplied, in
    /// which case the caller fetches one and retries.
    pub fn register(
        &self,
        uuid: &Uuid,
        flags: OpenFlags,
        remote_id: String,
        location: Option<FileLocation>,
    ) -> Option<Arc<OpenHandle<H::Session>>> {
        let file = match self.files.entry_sync(uuid.clone()) {
            scc::hash_map::Entry::Occupied(occ) => {
                let file = Arc::clone(occ.get());
                file.handles.fetch_add(1, Ordering::AcqRel);
                file
            }
            scc::hash_map::Entry::Vacant(vac) => {
                let file = Arc::new(OpenFile::new(location?));
                file.handles.fetch_add(1, Ordering::AcqRel);
                vac.insert_entry(Arc::clone(&file));
                file
            }
        };

        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(OpenHandle {
            fh,
            flags,
            remote_id,
            file,
            sessions: Mutex::new(FxHashMap::default()),
        });
        drop(self.handles.insert_sync(fh, Arc::clone(&handle)));
        debug!(fh, uuid = %uuid, "handle registered");
        Some(handle)
    }

    /// Looks up an open handle.
    pub fn get(&self, fh: FileHandle) -> Result<Arc<OpenHandle<H::Session>>, FsError> {
        self.handles
            .read_sync(&fh, |_, handle| Arc::clone(handle))
            .ok_or(FsError::BadFileHandle)
    }

    /// The session for `backing`, shared with every other handle that uses the same pair.
    ///
    /// A handle takes at most one reference per pair, however many reads it performs.
    pub async fn session(
        &self,
        handle: &OpenHandle<H::Session>,
        backing: &StorageFileId,
    ) -> Result<Arc<H::Session>, FsError> {
        if let Some(session) = handle
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(backing)
        {
            return Ok(Arc::clone(session));
        }

        let shared = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .inc(backing);
        let session = if let Some(session) = shared {
            session
        } else {
            let fresh = self
                .helper
                .open(handle.uuid(), backing, handle.flags)
                .await?;
            let (session, spare) = self
                .sessions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(backing.clone(), Arc::new(fresh));
            if let Some(spare) = spare {
                close_session(&spare, backing).await;
            }
            debug!(storage = %backing.storage_id, file = %backing.file_id, "storage session opened");
            session
        };

        // A concurrent read on the same handle may have raced us to the same pair.
        let duplicate = {
            let mut held = handle
                .sessions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = held.get(backing) {
                Some(Arc::clone(existing))
            } else {
                held.insert(backing.clone(), Arc::clone(&session));
                None
            }
        };
        if let Some(existing) = duplicate {
            let closed = self
                .sessions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .dec(backing);
            if let Some(closed) = closed {
                close_session(&closed, backing).await;
            }
            return Ok(existing);
        }
        Ok(session)
    }

    /// Removes a handle, closing sessions no other handle references.
    pub async fn release(&self, fh: FileHandle) -> Result<Released, FsError> {
        let (_, handle) = self
            .handles
            .remove_async(&fh)
            .await
            .ok_or(FsError::BadFileHandle)?;

        let held: Vec<StorageFileId> = handle
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(backing, _)| backing)
            .collect();
        let to_close: Vec<(StorageFileId, Arc<H::Session>)> = {
            let mut ward = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            held.into_iter()
                .filter_map(|backing| ward.dec(&backing).map(|session| (backing, session)))
                .collect()
        };
        for (backing, session) in &to_close {
            close_session(session, backing).await;
        }

        let file = Arc::clone(&handle.file);
        let last_handle = file.handles.fetch_sub(1, Ordering::AcqRel) == 1;
        if last_handle {
            drop(self.files.remove_if_sync(&file.uuid, |current| {
                Arc::ptr_eq(current, &file) && current.handles.load(Ordering::Acquire) == 0
            }));
        }
        debug!(fh, uuid = %file.uuid, last_handle, "handle released");

        Ok(Released {
            uuid: file.uuid.clone(),
            remote_id: handle.remote_id.clone(),
            last_handle,
        })
    }

    /// Applies a location update to an open file. Returns `false` if the file is not open.
    pub fn apply_location(&self, uuid: &Uuid, update: &LocationUpdate) -> bool {
        let Some(file) = self.open_file(uuid) else {
            return false;
        };
        file.with_location(|location| location.apply(update));
        true
    }

    /// Replaces an open file's location wholesale.
    pub fn replace_location(&self, uuid: &Uuid, location: FileLocation) {
        if let Some(file) = self.open_file(uuid) {
            file.with_location(|current| *current = location);
        }
    }

    /// Forgets every known block of an open file.
    pub fn clear_blocks(&self, uuid: &Uuid) {
        if let Some(file) = self.open_file(uuid) {
            file.with_location(|location| location.blocks.clear());
        }
    }

    /// Forgets blocks of an open file at or past `size`.
    pub fn truncate_blocks(&self, uuid: &Uuid, size: u64) {
        if let Some(file) = self.open_file(uuid) {
            file.with_location(|location| location.blocks.truncate(size));
        }
    }

    /// Records bytes just written through the file's default pair.
    pub fn record_written(&self, uuid: &Uuid, range: Range<u64>) {
        if let Some(file) = self.open_file(uuid) {
            file.with_location(|location| location.blocks.insert(range, None));
        }
    }

    /// Number of open handles.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Number of open storage sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

async fn close_session<S: HelperSession>(session: &Arc<S>, backing: &StorageFileId) {
    match session.close().await {
        Ok(()) => debug!(storage = %backing.storage_id, file = %backing.file_id, "storage session closed"),
        Err(e) => warn!(
            storage = %backing.storage_id,
            file = %backing.file_id,
            error = %e,
            "failed to close storage session"
        ),
    }
}
