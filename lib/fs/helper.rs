//! Byte I/O against the backing storage.
//!
//! A [`StorageHelper`] opens one [`HelperSession`] per (storage, file) pair. Sessions are shared
//! between every open handle referencing the same pair; the registry closes a session once the
//! last handle referencing it is released.

use std::future::Future;

use bytes::Bytes;

use crate::fs::{OpenFlags, StorageFileId, Uuid};

/// An open session against one backing object.
pub trait HelperSession: Send + Sync + 'static {
    /// Read up to `size` bytes starting at byte `offset` of the backing object.
    fn read(
        &self,
        offset: u64,
        size: u32,
    ) -> impl Future<Output = Result<Bytes, std::io::Error>> + Send;

    /// Write `data` at byte `offset`; answers with the number of bytes written.
    fn write(
        &self,
        offset: u64,
        data: Bytes,
    ) -> impl Future<Output = Result<usize, std::io::Error>> + Send;

    /// Release any resources held by this session.
    ///
    /// Called once, when the last handle referencing the session is released. The default
    /// implementation is a no-op.
    fn close(&self) -> impl Future<Output = Result<(), std::io::Error>> + Send {
        async { Ok(()) }
    }

    /// Whether reads through this session must be checked against a remote checksum.
    fn needs_data_consistency_check(&self) -> bool {
        false
    }
}

/// Opens storage sessions.
pub trait StorageHelper: Clone + Send + Sync + 'static {
    /// The session type returned by [`open`](Self::open).
    type Session: HelperSession;

    /// Open a session on `backing` for file `uuid`.
    fn open(
        &self,
        uuid: &Uuid,
        backing: &StorageFileId,
        flags: OpenFlags,
    ) -> impl Future<Output = Result<Self::Session, std::io::Error>> + Send;
}
