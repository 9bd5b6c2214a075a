use std::fmt::Debug;

pub type FrameId = u32;

/// Eviction policy for the buffer pool. The pool calls `pin` when a
/// frame gains its first pin and `unpin` when the last pin drops; only
/// unpinned frames are candidates for `evict`.
pub trait Replacer: Send + Sync + Debug {
    /// Pick a victim frame, removing it from the candidate set. None
    /// means every frame is pinned.
    fn evict(&mut self) -> Option<FrameId>;

    /// Remove a frame from the candidate set.
    fn pin(&mut self, frame_id: FrameId);

    /// Add a frame to the candidate set.
    fn unpin(&mut self, frame_id: FrameId);

    /// Number of evictable frames.
    fn size(&self) -> usize;
}
