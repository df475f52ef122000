//! Filesystem-facing types and the layers that serve them.
/// The filesystem facade exposed to the kernel adaptation layer.
pub mod async_fs;
/// Known byte ranges of a file and where they live.
pub mod block_map;
/// On-demand synchronization of byte ranges.
pub mod block_sync;
/// Open file handles, their block maps, and shared storage sessions.
pub mod handles;
/// Byte I/O against the backing storage.
pub mod helper;
/// The request/response interface to the remote provider.
pub mod provider;
/// Reference-counted sharing of storage sessions.
pub mod session_ward;

pub use async_fs::RemoteFs;
pub use block_map::{BlockMap, FileLocation, LocationUpdate, StorageFileId};

use std::ffi::OsString;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use bitflags::bitflags;

/// Globally unique identifier of one filesystem object, stable across in-place renames.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uuid(Arc<str>);

impl Uuid {
    /// Wraps an identifier string handed out by the remote provider.
    #[must_use]
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// The raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uuid({})", self.0)
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Uuid {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Type representing a file handle.
pub type FileHandle = u64;

bitflags! {
    /// Mode bits of an entry, without the file type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ModeBits: u32 {
        /// Other: execute permission.
        const OTHER_EXECUTE = 0o001;
        /// Other: write permission.
        const OTHER_WRITE   = 0o002;
        /// Other: read permission.
        const OTHER_READ    = 0o004;

        /// Group: execute permission.
        const GROUP_EXECUTE = 0o010;
        /// Group: write permission.
        const GROUP_WRITE   = 0o020;
        /// Group: read permission.
        const GROUP_READ    = 0o040;

        /// Owner: execute permission.
        const OWNER_EXECUTE = 0o100;
        /// Owner: write permission.
        const OWNER_WRITE   = 0o200;
        /// Owner: read permission.
        const OWNER_READ    = 0o400;

        /// Sticky bit.
        const STICKY        = 0o1000;
        /// Set-group-ID bit.
        const SETGID        = 0o2000;
        /// Set-user-ID bit.
        const SETUID        = 0o4000;

        /// Every permission bit for every class.
        const ALL_RWX = 0o777;
    }
}

impl ModeBits {
    /// Keeps only permission and special bits from a raw `st_mode`, dropping the type bits.
    #[must_use]
    pub fn from_mode(mode: u32) -> Self {
        Self::from_bits_truncate(mode)
    }
}

bitflags! {
    /// Flags for opening a file, similar to Unix open(2) flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        /// Open for reading only.
        const RDONLY = libc::O_RDONLY;
        /// Open for writing only.
        const WRONLY = libc::O_WRONLY;
        /// Open for reading and writing.
        const RDWR = libc::O_RDWR;
        /// Append on each write.
        const APPEND = libc::O_APPEND;
        /// Truncate to zero length.
        const TRUNC = libc::O_TRUNC;
        /// Create file if it does not exist.
        const CREAT = libc::O_CREAT;
        /// Error if file already exists (with `CREAT`).
        const EXCL = libc::O_EXCL;
        /// Synchronous writes.
        const SYNC = libc::O_SYNC;
        /// Fail if not a directory.
        const DIRECTORY = libc::O_DIRECTORY;
    }
}

/// The node types the remote provider knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    /// A regular file.
    Regular,
    /// A directory.
    Directory,
    /// A symbolic link.
    Symlink,
}

/// Last-known attributes of one file or directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttr {
    /// Identifier of the object.
    pub uuid: Uuid,
    /// Identifier of the containing directory; `None` for a root.
    pub parent: Option<Uuid>,
    /// Name within the parent directory.
    pub name: OsString,
    /// Node type.
    pub file_type: FileType,
    /// Permission and special bits.
    pub mode: ModeBits,
    /// Owning user.
    pub uid: u32,
    /// Owning group.
    pub gid: u32,
    /// Last access time.
    pub atime: SystemTime,
    /// Last modification time.
    pub mtime: SystemTime,
    /// Last status change time.
    pub ctime: SystemTime,
    /// Size in bytes.
    pub size: u64,
    /// Hard link count.
    pub nlink: u32,
    /// Whether the file's data is completely available without synchronization.
    pub fully_replicated: bool,
    /// Opaque replication/location reference handed out by the provider.
    pub replica_ref: Option<Arc<str>>,
}

impl FileAttr {
    /// Whether this entry is a directory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    /// Whether this entry has no parent.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// The name of this entry within the listed directory, including `.` and `..`.
    pub name: OsString,
    /// Identifier the name resolves to.
    pub uuid: Uuid,
    /// Node type of the target.
    pub file_type: FileType,
}

/// Filesystem statistics returned by [`RemoteFs::statfs`].
///
/// Block-related sizes are in units of `block_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsStats {
    /// Filesystem block size (bytes).
    pub block_size: u32,
    /// Total number of data blocks.
    pub total_blocks: u64,
    /// Number of free blocks.
    pub free_blocks: u64,
    /// Maximum filename length (bytes).
    pub max_filename_length: u32,
}
