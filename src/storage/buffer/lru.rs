use super::replacer::{FrameId, Replacer};
use std::collections::HashSet;
use std::collections::VecDeque;

/// Least-recently-used eviction. A frame's recency is the moment its
/// last pin dropped; the frame unpinned longest ago goes first.
#[derive(Debug)]
pub struct LruReplacer {
    /// Unpin order, oldest at the front. May contain stale entries for
    /// frames that were re-pinned; `members` is authoritative.
    queue: VecDeque<FrameId>,
    members: HashSet<FrameId>,
    max_size: usize,
}

impl LruReplacer {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size),
            members: HashSet::with_capacity(max_size),
            max_size,
        }
    }
}

impl Replacer for LruReplacer {
    fn evict(&mut self) -> Option<FrameId> {
        while let Some(frame_id) = self.queue.pop_front() {
            if self.members.remove(&frame_id) {
                return Some(frame_id);
            }
            // Stale entry for a frame that was pinned again; skip
        }
        None
    }

    fn pin(&mut self, frame_id: FrameId) {
        self.members.remove(&frame_id);
    }

    fn unpin(&mut self, frame_id: FrameId) {
        if self.members.len() >= self.max_size {
            return;
        }
        if self.members.insert(frame_id) {
            self.queue.push_back(frame_id);
        }
    }

    fn size(&self) -> usize {
        self.members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_in_unpin_order() {
        let mut replacer = LruReplacer::new(3);

        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);

        replacer.unpin(1);
        replacer.unpin(2);
        replacer.unpin(3);
        assert_eq!(replacer.size(), 3);

        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(3));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_pinned_frame_is_skipped() {
        let mut replacer = LruReplacer::new(3);

        replacer.unpin(1);
        replacer.unpin(2);
        replacer.pin(1);
        assert_eq!(replacer.size(), 1);

        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), None);

        replacer.unpin(1);
        assert_eq!(replacer.evict(), Some(1));
    }

    #[test]
    fn test_duplicate_unpin_is_ignored() {
        let mut replacer = LruReplacer::new(2);

        replacer.unpin(1);
        replacer.unpin(1);
        assert_eq!(replacer.size(), 1);
    }

    #[test]
    fn test_pin_unknown_frame_is_safe() {
        let mut replacer = LruReplacer::new(2);

        replacer.pin(999);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_capacity_is_bounded() {
        let mut replacer = LruReplacer::new(2);

        replacer.unpin(1);
        replacer.unpin(2);
        replacer.unpin(3);
        assert_eq!(replacer.size(), 2);
    }

    #[test]
    fn test_repin_resets_recency() {
        let mut replacer = LruReplacer::new(3);

        replacer.unpin(1);
        replacer.unpin(2);
        replacer.unpin(3);

        // Frame 2 is used again and then released
        replacer.pin(2);
        replacer.unpin(2);

        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(3));
        assert_eq!(replacer.evict(), Some(2));
    }
}
