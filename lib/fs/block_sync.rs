//! On-demand synchronization of byte ranges.
//!
//! A read whose range is not fully known asks the provider to make the missing bytes available.
//! Each request runs as a small state machine:
//!
//! ```text
//! Idle -> Requested -> Applied
//!              |  ^
//!              v  |
//!             Retry(kind, remaining) -> Failed(kind)
//! ```
//!
//! `TryAgain` and `Canceled` answers draw from separate budgets, with an exponential, jittered
//! delay between attempts. A successful answer that still leaves the range unknown counts as
//! `TryAgain`.

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng as _;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{FsError, Status};
use crate::fs::Uuid;
use crate::fs::handles::OpenFile;
use crate::fs::provider::{RemoteProvider, SyncPriority, call_raw};

/// Retry budgets and backoff for synchronization requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after `TryAgain` answers.
    pub try_again_retries: u32,
    /// Retries allowed after `Canceled` answers.
    pub canceled_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl From<&SyncConfig> for RetryPolicy {
    fn from(config: &SyncConfig) -> Self {
        Self {
            try_again_retries: config.try_again_retries,
            canceled_retries: config.canceled_retries,
            base_delay: Duration::from_millis(config.retry_delay_ms),
            max_delay: Duration::from_millis(config.max_retry_delay_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based), jitter included.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX));
        let capped = exp.min(self.max_delay);
        let jitter_ms = u64::try_from(capped.as_millis() / 4).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };
        (capped + jitter).min(self.max_delay)
    }
}

/// A transient answer the retry loop absorbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transient {
    /// `TryAgain`, or a success that did not cover the range.
    TryAgain,
    /// `Canceled`.
    Canceled,
}

#[derive(Debug)]
enum SyncState {
    Idle,
    Requested,
    Applied(Option<Bytes>),
    Retry { kind: Transient, remaining: u32 },
    Failed(FsError),
}

/// Remaining retries, tracked per transient kind.
#[derive(Debug, Clone, Copy)]
struct Budget {
    try_again: u32,
    canceled: u32,
    attempts: u32,
}

impl Budget {
    fn new(policy: &RetryPolicy) -> Self {
        Self {
            try_again: policy.try_again_retries,
            canceled: policy.canceled_retries,
            attempts: 0,
        }
    }

    fn on_transient(&mut self, kind: Transient) -> SyncState {
        let left = match kind {
            Transient::TryAgain => &mut self.try_again,
            Transient::Canceled => &mut self.canceled,
        };
        if *left == 0 {
            return SyncState::Failed(match kind {
                Transient::TryAgain => FsError::TemporarilyUnavailable,
                Transient::Canceled => FsError::Canceled,
            });
        }
        *left -= 1;
        SyncState::Retry {
            kind,
            remaining: *left,
        }
    }

    fn on_status(&mut self, status: Status) -> SyncState {
        match status {
            Status::TryAgain => self.on_transient(Transient::TryAgain),
            Status::Canceled => self.on_transient(Transient::Canceled),
            other => SyncState::Failed(other.into()),
        }
    }
}

/// Expands the hull of `gaps` to at least `min_size` bytes, clamped to the end of the file.
///
/// A file smaller than `min_size` is synchronized whole. Returns `None` when there is nothing to
/// synchronize.
#[must_use]
pub fn expand_range(gaps: &[Range<u64>], file_size: u64, min_size: u64) -> Option<Range<u64>> {
    let start = gaps.first()?.start;
    let end = gaps.last()?.end;
    if start >= end {
        return None;
    }
    if file_size < min_size {
        return Some(0..file_size.max(end));
    }
    if end - start >= min_size {
        return Some(start..end);
    }
    Some(start..start.saturating_add(min_size).min(file_size).max(end))
}

/// Issues synchronization requests on behalf of reads.
#[derive(Debug, Clone)]
pub struct BlockSync<P> {
    provider: P,
    policy: RetryPolicy,
    min_block_size: u64,
    verify_checksums: bool,
    timeout: Duration,
}

impl<P: RemoteProvider> BlockSync<P> {
    /// Creates a synchronizer.
    pub fn new(provider: P, config: &SyncConfig, timeout: Duration) -> Self {
        Self {
            provider,
            policy: RetryPolicy::from(config),
            min_block_size: config.min_block_size.as_u64(),
            verify_checksums: config.verify_checksums,
            timeout,
        }
    }

    /// The retry policy in force.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Whether reads are verified regardless of what the storage session asks for.
    #[must_use]
    pub fn verify_checksums(&self) -> bool {
        self.verify_checksums
    }

    /// Makes `wanted` readable in `file`'s block map.
    ///
    /// Without `checksum`, nothing is requested when the range is already known; otherwise the
    /// gaps are expanded and synchronized. With `checksum`, `wanted` itself is always
    /// synchronized and the remote digest of those bytes is returned for verification.
    pub async fn ensure_covered(
        &self,
        file: &Arc<OpenFile>,
        wanted: Range<u64>,
        file_size: u64,
        checksum: bool,
    ) -> Result<Option<Bytes>, FsError> {
        if wanted.is_empty() {
            return Ok(None);
        }
        let request = if checksum {
            wanted.clone()
        } else {
            let gaps = file.gaps(wanted.clone());
            let Some(request) = expand_range(&gaps, file_size, self.min_block_size) else {
                return Ok(None);
            };
            request
        };

        let uuid = file.uuid().clone();
        let mut budget = Budget::new(&self.policy);
        let mut state = SyncState::Idle;
        loop {
            state = match state {
                SyncState::Idle => {
                    debug!(uuid = %uuid, range = ?request, checksum, "synchronizing range");
                    SyncState::Requested
                }
                SyncState::Requested => {
                    budget.attempts += 1;
                    self.attempt(file, &uuid, request.clone(), wanted.clone(), checksum, &mut budget)
                        .await?
                }
                SyncState::Retry { kind, remaining } => {
                    let delay = self.policy.backoff(budget.attempts - 1);
                    info!(
                        uuid = %uuid,
                        range = ?request,
                        ?kind,
                        remaining,
                        delay_ms = delay.as_millis(),
                        "retrying synchronization"
                    );
                    tokio::time::sleep(delay).await;
                    SyncState::Requested
                }
                SyncState::Applied(digest) => return Ok(digest),
                SyncState::Failed(e) => {
                    warn!(uuid = %uuid, range = ?request, error = %e, attempts = budget.attempts, "synchronization failed");
                    return Err(e);
                }
            };
        }
    }

    async fn attempt(
        &self,
        file: &Arc<OpenFile>,
        uuid: &Uuid,
        request: Range<u64>,
        wanted: Range<u64>,
        checksum: bool,
        budget: &mut Budget,
    ) -> Result<SyncState, FsError> {
        let (update, digest) = if checksum {
            let answer = call_raw(
                self.timeout,
                self.provider.synchronize_block_and_checksum(
                    uuid,
                    request,
                    SyncPriority::Immediate,
                ),
            )
            .await?;
            match answer {
                Ok(answer) => (answer.update, Some(answer.checksum)),
                Err(status) => return Ok(budget.on_status(status)),
            }
        } else {
            let answer = call_raw(
                self.timeout,
                self.provider
                    .synchronize_block(uuid, request, SyncPriority::Immediate),
            )
            .await?;
            match answer {
                Ok(update) => (update, None),
                Err(status) => return Ok(budget.on_status(status)),
            }
        };

        file.with_location(|location| location.apply(&update));
        if !file.covers(wanted.clone()) {
            debug!(uuid = %uuid, range = ?wanted, "synchronization left range uncovered");
            return Ok(budget.on_transient(Transient::TryAgain));
        }
        Ok(SyncState::Applied(digest))
    }
}

/// Whether `data` hashes to the 16-byte MD5 digest `expected`.
#[must_use]
pub fn checksum_matches(data: &[u8], expected: &[u8]) -> bool {
    md5::compute(data).0.as_slice() == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn small_gap_is_expanded_to_minimum() {
        assert_eq!(expand_range(&[100..200], 10 * MIB, MIB), Some(100..100 + MIB));
    }

    #[test]
    fn expansion_is_clamped_to_file_end() {
        let size = 2 * MIB;
        assert_eq!(
            expand_range(&[size - 10..size], size, MIB),
            Some(size - 10..size)
        );
    }

    #[test]
    fn file_below_minimum_is_synchronized_whole() {
        assert_eq!(expand_range(&[5..6], 4096, MIB), Some(0..4096));
    }

    #[test]
    fn large_gap_hull_is_kept() {
        assert_eq!(
            expand_range(&[0..10, 3 * MIB..4 * MIB], 8 * MIB, MIB),
            Some(0..4 * MIB)
        );
    }

    #[test]
    fn no_gaps_means_no_request() {
        assert_eq!(expand_range(&[], 100, MIB), None);
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = RetryPolicy {
            try_again_retries: 3,
            canceled_retries: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        };
        let first = policy.backoff(0);
        assert!(first >= Duration::from_millis(10) && first <= Duration::from_millis(12));
        assert_eq!(policy.backoff(10), Duration::from_millis(50));
    }

    #[test]
    fn budgets_are_independent() {
        let mut budget = Budget::new(&RetryPolicy {
            try_again_retries: 1,
            canceled_retries: 2,
            ..RetryPolicy::default()
        });
        assert!(matches!(
            budget.on_status(Status::TryAgain),
            SyncState::Retry { remaining: 0, .. }
        ));
        assert!(matches!(
            budget.on_status(Status::Canceled),
            SyncState::Retry { remaining: 1, .. }
        ));
        assert!(matches!(
            budget.on_status(Status::TryAgain),
            SyncState::Failed(FsError::TemporarilyUnavailable)
        ));
        assert!(matches!(
            budget.on_status(Status::NotFound),
            SyncState::Failed(FsError::NotFound)
        ));
    }

    #[test]
    fn md5_digest_is_compared() {
        let digest = md5::compute(b"hello").0;
        assert!(checksum_matches(b"hello", &digest));
        assert!(!checksum_matches(b"hellO", &digest));
    }
}
