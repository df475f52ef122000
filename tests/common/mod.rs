#![allow(dead_code, missing_docs, clippy::unwrap_used)]

pub mod mocks;

use std::ffi::OsString;
use std::time::{Duration, SystemTime};

use rfs_client::Config;
use rfs_client::fs::{FileAttr, FileType, ModeBits, Uuid};

/// Builds a directory entry with sensible defaults.
pub fn dir_attr(uuid: &str, parent: Option<&str>, name: &str) -> FileAttr {
    FileAttr {
        uuid: Uuid::from(uuid),
        parent: parent.map(Uuid::from),
        name: OsString::from(name),
        file_type: FileType::Directory,
        mode: ModeBits::from_mode(0o755),
        uid: 1000,
        gid: 1000,
        atime: SystemTime::UNIX_EPOCH,
        mtime: SystemTime::UNIX_EPOCH,
        ctime: SystemTime::UNIX_EPOCH,
        size: 0,
        nlink: 2,
        fully_replicated: true,
        replica_ref: None,
    }
}

/// Builds a regular file entry with sensible defaults.
pub fn file_attr(uuid: &str, parent: &str, name: &str, size: u64) -> FileAttr {
    FileAttr {
        file_type: FileType::Regular,
        mode: ModeBits::from_mode(0o644),
        size,
        nlink: 1,
        ..dir_attr(uuid, Some(parent), name)
    }
}

/// A configuration with short retry delays, suitable for tests.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.sync.retry_delay_ms = 1;
    config.sync.max_retry_delay_ms = 5;
    config.provider_timeout_secs = 5;
    config
}

/// Polls `check` until it holds, or panics after one second.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition did not hold within 1 second");
}
