//! Interval map of the byte ranges known to be readable for one file.
//!
//! Segments never overlap. Adjacent segments backed by the same storage pair are coalesced, so
//! the map stays proportional to the number of distinct backing ranges, not to the number of
//! synchronizations that produced it.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use crate::fs::Uuid;

/// A (storage, file-id) pair naming one backing object a storage session is opened against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageFileId {
    /// Identifier of the storage the data lives on.
    pub storage_id: Arc<str>,
    /// Identifier of the file within that storage.
    pub file_id: Arc<str>,
}

impl StorageFileId {
    /// Builds a pair from its two identifiers.
    #[must_use]
    pub fn new(storage_id: impl Into<Arc<str>>, file_id: impl Into<Arc<str>>) -> Self {
        Self {
            storage_id: storage_id.into(),
            file_id: file_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    end: u64,
    backing: Option<StorageFileId>,
}

/// Known byte ranges, each optionally annotated with the pair that stores it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockMap {
    segments: BTreeMap<u64, Segment>,
}

impl BlockMap {
    /// Creates an empty block map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of disjoint segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Returns `true` when no byte is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Records `range` as known, overwriting whatever was recorded for those bytes before.
    pub fn insert(&mut self, range: Range<u64>, backing: Option<StorageFileId>) {
        if range.is_empty() {
            return;
        }
        self.clear_range(range.clone());

        let mut start = range.start;
        let mut end = range.end;

        let left = self
            .segments
            .range(..start)
            .next_back()
            .filter(|(_, seg)| seg.end == start && seg.backing == backing)
            .map(|(&s, _)| s);
        if let Some(left_start) = left {
            self.segments.remove(&left_start);
            start = left_start;
        }

        let right = self
            .segments
            .get(&end)
            .filter(|seg| seg.backing == backing)
            .map(|seg| seg.end);
        if let Some(right_end) = right {
            self.segments.remove(&end);
            end = right_end;
        }

        self.segments.insert(start, Segment { end, backing });
    }

    /// Forgets every byte in `range`, splitting segments that straddle its edges.
    pub fn clear_range(&mut self, range: Range<u64>) {
        if range.is_empty() {
            return;
        }
        // Segments are disjoint and sorted, so their ends are sorted as well.
        let overlapping: Vec<u64> = self
            .segments
            .range(..range.end)
            .rev()
            .take_while(|(_, seg)| seg.end > range.start)
            .map(|(&s, _)| s)
            .collect();

        for start in overlapping {
            let Some(seg) = self.segments.remove(&start) else {
                continue;
            };
            if start < range.start {
                self.segments.insert(
                    start,
                    Segment {
                        end: range.start,
                        backing: seg.backing.clone(),
                    },
                );
            }
            if seg.end > range.end {
                self.segments.insert(
                    range.end,
                    Segment {
                        end: seg.end,
                        backing: seg.backing,
                    },
                );
            }
        }
    }

    /// Forgets every byte at or past `size`.
    pub fn truncate(&mut self, size: u64) {
        self.clear_range(size..u64::MAX);
    }

    /// Forgets everything.
    pub fn clear(&mut self) {
        self.segments.clear();
    }

    /// The sub-ranges of `range` that are not known, in ascending order.
    #[must_use]
    pub fn gaps(&self, range: Range<u64>) -> Vec<Range<u64>> {
        let mut gaps = Vec::new();
        if range.is_empty() {
            return gaps;
        }

        let first = self
            .segments
            .range(..=range.start)
            .next_back()
            .map_or(range.start, |(&s, _)| s);

        let mut cursor = range.start;
        for (&start, seg) in self.segments.range(first..range.end) {
            if seg.end <= cursor {
                continue;
            }
            if start > cursor {
                gaps.push(cursor..start);
            }
            cursor = seg.end;
            if cursor >= range.end {
                break;
            }
        }
        if cursor < range.end {
            gaps.push(cursor..range.end);
        }
        gaps
    }

    /// Whether every byte in `range` is known.
    #[must_use]
    pub fn covers(&self, range: Range<u64>) -> bool {
        self.gaps(range).is_empty()
    }

    /// The segment containing `offset`, with its backing pair.
    #[must_use]
    pub fn segment_at(&self, offset: u64) -> Option<(Range<u64>, Option<&StorageFileId>)> {
        self.segments
            .range(..=offset)
            .next_back()
            .filter(|(_, seg)| seg.end > offset)
            .map(|(&start, seg)| (start..seg.end, seg.backing.as_ref()))
    }

    /// Iterates segments in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (Range<u64>, Option<&StorageFileId>)> + '_ {
        self.segments
            .iter()
            .map(|(&start, seg)| (start..seg.end, seg.backing.as_ref()))
    }

    /// Copies every segment of `other` into this map; `other` wins where both know a byte.
    pub fn merge(&mut self, other: &Self) {
        for (range, backing) in other.iter() {
            self.insert(range, backing.cloned());
        }
    }

    /// Replaces what is known inside `range` with `other`'s view of the same range.
    ///
    /// Bytes outside `range` are left untouched, even if `other` knows about them.
    pub fn replace_within(&mut self, range: Range<u64>, other: &Self) {
        self.clear_range(range.clone());
        for (seg, backing) in other.iter() {
            let start = seg.start.max(range.start);
            let end = seg.end.min(range.end);
            if start < end {
                self.insert(start..end, backing.cloned());
            }
        }
    }
}

/// Where the bytes of one file live, as last reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLocation {
    /// The file this location describes.
    pub uuid: Uuid,
    /// Storage holding segments that carry no explicit backing pair.
    pub storage_id: Arc<str>,
    /// File identifier within `storage_id`.
    pub file_id: Arc<str>,
    /// The known byte ranges.
    pub blocks: BlockMap,
}

impl FileLocation {
    /// A location with no known bytes.
    #[must_use]
    pub fn empty(
        uuid: Uuid,
        storage_id: impl Into<Arc<str>>,
        file_id: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            uuid,
            storage_id: storage_id.into(),
            file_id: file_id.into(),
            blocks: BlockMap::new(),
        }
    }

    /// The pair used for segments without an explicit backing.
    #[must_use]
    pub fn default_backing(&self) -> StorageFileId {
        StorageFileId {
            storage_id: Arc::clone(&self.storage_id),
            file_id: Arc::clone(&self.file_id),
        }
    }

    /// Resolves a segment's backing, falling back to the file's default pair.
    #[must_use]
    pub fn backing_for(&self, backing: Option<&StorageFileId>) -> StorageFileId {
        backing.cloned().unwrap_or_else(|| self.default_backing())
    }

    /// Applies an update received from a synchronization or a location-changed event.
    pub fn apply(&mut self, update: &LocationUpdate) {
        self.storage_id = Arc::clone(&update.location.storage_id);
        self.file_id = Arc::clone(&update.location.file_id);
        match &update.changed {
            Some(range) => self.blocks.replace_within(range.clone(), &update.location.blocks),
            None => self.blocks.merge(&update.location.blocks),
        }
    }
}

/// A block map delta delivered by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationUpdate {
    /// The provider's view of the file's location.
    pub location: FileLocation,
    /// When present, only bytes in this range are guaranteed to reflect `location`.
    pub changed: Option<Range<u64>>,
}

impl LocationUpdate {
    /// An update covering the whole location.
    #[must_use]
    pub fn full(location: FileLocation) -> Self {
        Self {
            location,
            changed: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(name: &str) -> StorageFileId {
        StorageFileId::new("storage", name)
    }

    #[test]
    fn gaps_report_holes_between_segments() {
        let mut map = BlockMap::new();
        map.insert(10..20, None);
        map.insert(30..40, None);

        assert_eq!(map.gaps(0..50), vec![0..10, 20..30, 40..50]);
        assert_eq!(map.gaps(12..18), Vec::<Range<u64>>::new());
        assert_eq!(map.gaps(15..35), vec![20..30]);
        assert!(map.covers(10..20));
        assert!(!map.covers(10..21));
    }

    #[test]
    fn adjacent_segments_with_same_backing_coalesce() {
        let mut map = BlockMap::new();
        map.insert(0..10, Some(pair("a")));
        map.insert(10..20, Some(pair("a")));
        map.insert(20..30, Some(pair("b")));

        assert_eq!(map.len(), 2);
        assert_eq!(map.segment_at(15), Some((0..20, Some(&pair("a")))));
        assert_eq!(map.segment_at(30), None);
    }

    #[test]
    fn insert_overwrites_the_middle_of_a_segment() {
        let mut map = BlockMap::new();
        map.insert(0..30, Some(pair("a")));
        map.insert(10..20, Some(pair("b")));

        let segments: Vec<_> = map.iter().map(|(r, b)| (r, b.cloned())).collect();
        assert_eq!(
            segments,
            vec![
                (0..10, Some(pair("a"))),
                (10..20, Some(pair("b"))),
                (20..30, Some(pair("a"))),
            ]
        );
    }

    #[test]
    fn truncate_drops_bytes_past_the_new_size() {
        let mut map = BlockMap::new();
        map.insert(0..100, None);
        map.truncate(40);

        assert!(map.covers(0..40));
        assert_eq!(map.gaps(0..100), vec![40..100]);
    }

    #[test]
    fn replace_within_leaves_outside_bytes_alone() {
        let mut current = BlockMap::new();
        current.insert(0..100, Some(pair("old")));

        let mut delta = BlockMap::new();
        delta.insert(0..200, Some(pair("new")));

        current.replace_within(50..60, &delta);

        assert_eq!(current.segment_at(10), Some((0..50, Some(&pair("old")))));
        assert_eq!(current.segment_at(55), Some((50..60, Some(&pair("new")))));
        assert_eq!(current.segment_at(70), Some((60..100, Some(&pair("old")))));
        assert!(!current.covers(100..101));
    }

    #[test]
    fn ranged_update_moves_the_default_pair() {
        let mut location = FileLocation::empty(Uuid::from("f"), "storage", "old");
        location.blocks.insert(0..10, None);

        let mut moved = FileLocation::empty(Uuid::from("f"), "storage", "new");
        moved.blocks.insert(0..40, None);
        location.apply(&LocationUpdate {
            location: moved,
            changed: Some(20..30),
        });

        assert_eq!(location.default_backing(), pair("new"));
        assert!(location.blocks.covers(20..30));
        assert!(!location.blocks.covers(10..20), "bytes outside the changed range are untouched");
    }
}
