//! Concurrent metadata cache in front of the remote provider.
//!
//! All in-memory mutations go through one state lock covering the entry store and the directory
//! listings, so a reader never observes an entry without the listing change that accompanies it.
//! The lock is never held across an `.await`: remote fetches run unlocked and their results are
//! folded in afterwards. Concurrent attribute misses for one identifier share a single request,
//! and concurrent listings of one directory share a single page fetch.

use std::ffi::{OsStr, OsString};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::eviction;
use crate::cache::listing::{DirListing, FetchGates, ListedChild, ListingState};
use crate::cache::single_flight::SingleFlight;
use crate::cache::store::Removal;
use crate::cache::{AttrMerge, CacheState, merge_attrs};
use crate::config::Config;
use crate::error::FsError;
use crate::fs::provider::{ChildrenPage, RemoteProvider, call};
use crate::fs::{DirEntry, FileAttr, FileType, Uuid};

/// Tunables the cache needs, extracted from [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    /// Maximum number of cached entries.
    pub max_entries: usize,
    /// How long a complete listing is served without refetching.
    pub directory_expiry: Duration,
    /// Page size requested from the provider.
    pub prefetch_size: usize,
    /// Hide regular files that are not fully replicated.
    pub show_only_full_replicas: bool,
    /// Deadline for each remote request.
    pub provider_timeout: Duration,
}

impl From<&Config> for CacheSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_entries: config.cache.max_entries,
            directory_expiry: config.directory_expiry(),
            prefetch_size: config.readdir.prefetch_size,
            show_only_full_replicas: config.readdir.show_only_full_replicas,
            provider_timeout: config.provider_timeout(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// The metadata cache: entry store, directory listings, and the fetch paths that fill them.
pub struct MetadataCache<P: RemoteProvider> {
    state: Mutex<CacheState>,
    provider: P,
    attr_flights: SingleFlight<Uuid, Result<FileAttr, FsError>>,
    gates: FetchGates,
    epochs: AtomicU64,
    settings: CacheSettings,
}

impl<P: RemoteProvider> MetadataCache<P> {
    /// Creates an empty cache.
    pub fn new(provider: P, settings: CacheSettings) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            provider,
            attr_flights: SingleFlight::default(),
            gates: FetchGates::default(),
            epochs: AtomicU64::new(0),
            settings,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The settings this cache runs with.
    #[must_use]
    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    // Entry store surface.

    /// Returns a cached entry, marking it most recently used.
    #[must_use]
    pub fn get(&self, uuid: &Uuid) -> Option<FileAttr> {
        self.lock().store.get(uuid).cloned()
    }

    /// Inserts or overwrites an entry, then enforces the capacity bound.
    pub fn put(&self, attr: FileAttr) {
        let uuid = attr.uuid.clone();
        let mut state = self.lock();
        state.store.put(attr);
        let evicted = eviction::enforce_capacity(&mut state, self.settings.max_entries, Some(&uuid));
        drop(state);
        self.forget_gates(&evicted);
    }

    /// Removes an entry and its listing membership; protected entries are removed on unpin.
    pub fn remove(&self, uuid: &Uuid) -> Removal {
        let mut state = self.lock();
        if let Some(parent) = state.store.peek(uuid).and_then(|a| a.parent.clone())
            && let Some(listing) = state.listings.get_mut(&parent)
        {
            listing.remove(uuid);
        }
        let outcome = state.store.remove(uuid);
        if !matches!(outcome, Removal::Deferred) && state.listings.remove(uuid).is_some() {
            drop(state);
            self.gates.forget(uuid);
        }
        outcome
    }

    /// Whether `uuid` is cached.
    #[must_use]
    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.lock().store.contains(uuid)
    }

    /// Number of cached entries.
    #[must_use]
    pub fn size(&self) -> usize {
        self.lock().store.len()
    }

    /// Pins a cached entry against eviction. Returns `false` if it is not cached.
    pub fn pin(&self, uuid: &Uuid) -> bool {
        self.lock().store.pin(uuid)
    }

    /// Caches `attr` if needed and pins it in one step.
    pub fn pin_attr(&self, attr: &FileAttr) {
        let mut state = self.lock();
        if !state.store.contains(&attr.uuid) {
            state.store.put(attr.clone());
        }
        state.store.pin(&attr.uuid);
        let evicted =
            eviction::enforce_capacity(&mut state, self.settings.max_entries, Some(&attr.uuid));
        drop(state);
        self.forget_gates(&evicted);
    }

    /// Drops one pin, performing any removal that was deferred on it.
    pub fn unpin(&self, uuid: &Uuid) {
        let dropped = self.lock().store.unpin(uuid);
        for attr in dropped {
            debug!(uuid = %attr.uuid, "deferred removal performed on unpin");
        }
    }

    /// Number of pins held on `uuid`.
    #[must_use]
    pub fn pins(&self, uuid: &Uuid) -> usize {
        self.lock().store.pins(uuid)
    }

    /// Whether `uuid` was deleted while cached.
    #[must_use]
    pub fn is_deleted(&self, uuid: &Uuid) -> bool {
        self.lock().store.is_deleted(uuid)
    }

    /// Number of directories that still track a page fetch gate.
    #[must_use]
    pub fn fetch_gates(&self) -> usize {
        self.gates.len()
    }

    /// Current state of a directory's listing.
    #[must_use]
    pub fn listing_state(&self, dir: &Uuid) -> ListingState {
        match self.lock().listings.get(dir) {
            None => ListingState::Empty,
            Some(listing) if listing.is_complete() => ListingState::Complete,
            Some(_) => ListingState::Fetching,
        }
    }

    // Fetch paths.

    /// Attributes of `uuid`, from cache or from the provider.
    pub async fn getattr(&self, uuid: &Uuid) -> Result<FileAttr, FsError> {
        if let Some(attr) = self.get(uuid) {
            debug!(uuid = %uuid, "attribute cache hit");
            return Ok(attr);
        }
        if self.is_deleted(uuid) {
            return Err(FsError::NotFound);
        }

        debug!(uuid = %uuid, "attribute cache miss");
        let provider = self.provider.clone();
        let timeout = self.settings.provider_timeout;
        let id = uuid.clone();
        let fetched = self
            .attr_flights
            .run(uuid.clone(), move || async move {
                call(timeout, provider.get_attr(&id)).await
            })
            .await
            .unwrap_or_else(|| Err(FsError::Io("attribute fetch panicked".to_owned())))?;

        self.admit(fetched).ok_or(FsError::NotFound)
    }

    /// Resolves `name` within `parent`, from the name index or from the provider.
    pub async fn lookup(&self, parent: &Uuid, name: &OsStr) -> Result<FileAttr, FsError> {
        {
            let mut state = self.lock();
            let hit = state.store.lookup(parent, name).map(|a| a.uuid.clone());
            if let Some(uuid) = hit
                && let Some(attr) = state.store.get(&uuid)
            {
                return Ok(attr.clone());
            }
        }

        let attr = call(
            self.settings.provider_timeout,
            self.provider.get_child_attr(parent, name),
        )
        .await?;
        self.admit(attr).ok_or(FsError::NotFound)
    }

    /// Folds fetched attributes into the cache. `None` if the identifier was deleted meanwhile.
    pub(crate) fn admit(&self, attr: FileAttr) -> Option<FileAttr> {
        let (cached, evicted) = self.lock().admit(attr, self.settings.max_entries);
        self.forget_gates(&evicted);
        cached
    }

    // Directory listings.

    /// Begins a listing session on `dir`, expiring stale listings first.
    pub async fn open_dir(&self, dir: &Uuid) -> Result<FileAttr, FsError> {
        let attr = self.getattr(dir).await?;
        if !attr.is_dir() {
            return Err(FsError::NotADirectory);
        }
        self.sweep_expired();
        Ok(attr)
    }

    /// Ends a listing session. Cached data stays.
    pub fn close_dir(&self, dir: &Uuid) {
        debug!(uuid = %dir, "listing session closed");
    }

    /// Returns up to `chunk` entries of `dir` starting at `offset`.
    ///
    /// Offsets 0 and 1 are `.` and `..`. Pages are fetched from the provider until enough
    /// visible entries are cached or the terminal page arrives; a complete, unexpired listing
    /// is served without any remote call.
    pub async fn list(
        &self,
        dir: &Uuid,
        chunk: usize,
        offset: usize,
    ) -> Result<Vec<DirEntry>, FsError> {
        let dir_attr = self.getattr(dir).await?;
        if !dir_attr.is_dir() {
            return Err(FsError::NotADirectory);
        }
        if offset == 0 {
            self.sweep_expired();
        }

        let wanted = offset.saturating_add(chunk);
        loop {
            if let Some(entries) = self.try_serve(&dir_attr, chunk, offset, wanted) {
                return Ok(entries);
            }

            let Some(_lease) = self.gates.try_claim(dir) else {
                self.gates.wait_idle(dir).await;
                continue;
            };

            // Another task may have fetched while we waited for the lease.
            let Some((epoch, cursor)) = self.next_fetch(dir, wanted) else {
                continue;
            };

            debug!(uuid = %dir, cursor, "fetching directory page");
            let page = call(
                self.settings.provider_timeout,
                self.provider
                    .list_children(dir, cursor, self.settings.prefetch_size),
            )
            .await?;
            self.absorb_page(dir, epoch, page);
        }
    }

    fn try_serve(
        &self,
        dir_attr: &FileAttr,
        chunk: usize,
        offset: usize,
        wanted: usize,
    ) -> Option<Vec<DirEntry>> {
        let strict = self.settings.show_only_full_replicas;
        let mut state = self.lock();
        let listing = state
            .listings
            .entry(dir_attr.uuid.clone())
            .or_insert_with(|| self.fresh_listing());
        if !listing.is_complete() && listing.visible_len(strict) + 2 < wanted {
            return None;
        }

        let dot = DirEntry {
            name: OsString::from("."),
            uuid: dir_attr.uuid.clone(),
            file_type: FileType::Directory,
        };
        let dotdot = DirEntry {
            name: OsString::from(".."),
            uuid: dir_attr
                .parent
                .clone()
                .unwrap_or_else(|| dir_attr.uuid.clone()),
            file_type: FileType::Directory,
        };
        let children = listing.visible(strict).map(|child| DirEntry {
            name: child.name.clone(),
            uuid: child.uuid.clone(),
            file_type: child.file_type,
        });
        Some(
            [dot, dotdot]
                .into_iter()
                .chain(children)
                .skip(offset)
                .take(chunk)
                .collect(),
        )
    }

    fn next_fetch(&self, dir: &Uuid, wanted: usize) -> Option<(u64, usize)> {
        let strict = self.settings.show_only_full_replicas;
        let state = self.lock();
        let listing = state.listings.get(dir)?;
        if listing.is_complete() || listing.visible_len(strict) + 2 >= wanted {
            return None;
        }
        Some((listing.epoch(), listing.cursor()))
    }

    fn absorb_page(&self, dir: &Uuid, epoch: u64, page: ChildrenPage) {
        let expires_at = Instant::now() + self.settings.directory_expiry;
        let capacity = self.settings.max_entries;
        let raw_len = page.children.len();
        // An empty non-terminal page would make no progress.
        let is_last = page.is_last || raw_len == 0;
        if raw_len == 0 && !page.is_last {
            warn!(uuid = %dir, "provider returned an empty non-terminal page");
        }

        let mut state = self.lock();
        if state.listings.get(dir).is_none_or(|l| l.epoch() != epoch) {
            debug!(uuid = %dir, "listing invalidated during fetch, discarding page");
            return;
        }

        let mut evicted = Vec::new();
        for child in page.children {
            if state.store.is_deleted(&child.uuid) {
                continue;
            }
            let listed = ListedChild::from(&child);
            let uuid = child.uuid.clone();
            if state.listings.get(dir).is_some_and(|l| l.contains(&uuid)) {
                continue;
            }
            if state.store.contains(&uuid) {
                let mut outcome = AttrMerge::Ignored;
                state.store.update(&uuid, |cached| {
                    outcome = merge_attrs(cached, &child);
                });
                if outcome == AttrMerge::Ignored {
                    debug!(uuid = %uuid, dir = %dir, "child is cached under another parent");
                    continue;
                }
            } else {
                state.store.put(child);
                evicted.extend(eviction::enforce_capacity(&mut state, capacity, Some(&uuid)));
            }
            if let Some(listing) = state.listings.get_mut(dir) {
                listing.push(listed);
            }
        }
        if let Some(listing) = state.listings.get_mut(dir) {
            listing.absorb_page(raw_len, is_last, expires_at);
        }
        drop(state);
        self.forget_gates(&evicted);
    }

    fn fresh_listing(&self) -> DirListing {
        DirListing::new(
            self.epochs.fetch_add(1, Ordering::Relaxed),
            Instant::now() + self.settings.directory_expiry,
        )
    }

    fn forget_gates(&self, dirs: &[Uuid]) {
        for dir in dirs {
            self.gates.forget(dir);
        }
    }

    /// Runs the directory expiry sweep now. Returns how many listings were dropped.
    pub fn sweep_expired(&self) -> usize {
        let dropped = eviction::sweep_expired(&mut self.lock(), Instant::now());
        self.forget_gates(&dropped);
        dropped.len()
    }

    /// Runs [`sweep_expired`](Self::sweep_expired) every `period` until the cache is dropped.
    pub fn spawn_expiry_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let dropped = cache.sweep_expired();
                if dropped > 0 {
                    debug!(dropped, "expiry sweep dropped listings");
                }
            }
        })
    }

    // Mutations, local and event-driven.

    /// Records an entry created by a local operation and lists it in its parent if listed.
    pub(crate) fn on_created(&self, attr: FileAttr) -> FileAttr {
        let listed = ListedChild::from(&attr);
        let parent = attr.parent.clone();
        let mut state = self.lock();
        let (cached, evicted) = state.admit(attr.clone(), self.settings.max_entries);
        if let Some(parent) = parent
            && let Some(listing) = state.listings.get_mut(&parent)
        {
            listing.push(listed);
        }
        drop(state);
        self.forget_gates(&evicted);
        cached.unwrap_or(attr)
    }

    /// Applies a deletion known to have happened remotely.
    pub fn apply_deleted(&self, uuid: &Uuid) {
        let dropped = self.lock().delete(uuid);
        self.forget_gates(&dropped);
    }

    /// Applies a rename. With `materialize`, a changed identifier is cached right away under
    /// the new identifier; otherwise it is resolved on next access.
    ///
    /// Returns `false` if `old` was not cached.
    pub fn apply_renamed(
        &self,
        old: &Uuid,
        new: &Uuid,
        new_parent: &Uuid,
        new_name: &OsStr,
        materialize: bool,
    ) -> bool {
        let dropped = self.lock().rename(
            old,
            new,
            new_parent,
            new_name,
            materialize,
            self.settings.max_entries,
        );
        match dropped {
            Some(dropped) => {
                self.forget_gates(&dropped);
                true
            }
            None => false,
        }
    }

    /// Merges pushed attributes into a cached entry.
    ///
    /// Returns the size the file shrank to, if it did, so open block maps can follow.
    pub fn apply_attr_changed(&self, attr: &FileAttr) -> Option<u64> {
        let strict = self.settings.show_only_full_replicas;
        let mut state = self.lock();
        if state.store.is_deleted(&attr.uuid) {
            debug!(uuid = %attr.uuid, "ignoring attribute update for deleted entry");
            return None;
        }
        let mut outcome = AttrMerge::Ignored;
        state.store.update(&attr.uuid, |cached| {
            outcome = merge_attrs(cached, attr);
        })?;
        let AttrMerge::Merged { shrunk_to } = outcome else {
            info!(uuid = %attr.uuid, "ignoring attribute update from a different parent");
            return None;
        };

        let (parent, file_type) = state
            .store
            .peek(&attr.uuid)
            .map(|a| (a.parent.clone(), a.file_type))?;
        if let Some(parent) = parent
            && let Some(listing) = state.listings.get_mut(&parent)
        {
            if strict && file_type == FileType::Regular && !attr.fully_replicated {
                listing.remove(&attr.uuid);
            } else {
                listing.set_replicated(&attr.uuid, attr.fully_replicated);
            }
        }
        shrunk_to
    }

    /// Applies `f` to a cached entry in place; `None` if it is not cached.
    pub(crate) fn update(&self, uuid: &Uuid, f: impl FnOnce(&mut FileAttr)) -> Option<FileAttr> {
        self.lock().store.update(uuid, f).cloned()
    }
}
