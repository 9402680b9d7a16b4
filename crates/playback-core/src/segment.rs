//! Ordered backlog of fetched segments.
//!
//! Insertion order is playback order. No operation blocks; thread safety is
//! delegated to the caller's own lock (the controller serializes all access).

use std::collections::VecDeque;
use std::sync::Arc;

/// Opaque, shareable reference to a segment's fetched bytes.
///
/// The bytes are released when the last handle is dropped, which is how a
/// queue wipe frees backing storage.
#[derive(Clone, Debug)]
pub struct SegmentHandle(Arc<Vec<u8>>);

impl SegmentHandle {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Arc::new(bytes))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}

/// One fetched segment awaiting consumption.
#[derive(Clone, Debug)]
pub struct Segment {
    /// Quality tier the segment was fetched at.
    pub quality: i32,
    /// Start time within the stream, in seconds.
    pub start_time: f64,
    /// Reference to the fetched bytes.
    pub handle: SegmentHandle,
}

impl Segment {
    pub fn new(quality: i32, start_time: f64, handle: SegmentHandle) -> Self {
        Self {
            quality,
            start_time,
            handle,
        }
    }
}

/// FIFO backlog of fetched segments.
#[derive(Debug, Default)]
pub struct SegmentQueue {
    segments: VecDeque<Segment>,
}

impl SegmentQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a segment to the tail.
    pub fn append(&mut self, segment: Segment) {
        tracing::debug!(
            quality = segment.quality,
            start_time = segment.start_time,
            preloaded = self.segments.len() + 1,
            "segment appended"
        );
        self.segments.push_back(segment);
    }

    /// Remaining unconsumed segment count.
    pub fn preloaded_count(&self) -> usize {
        self.segments.len()
    }

    /// Consume the segment at the head of the backlog.
    pub fn take_next(&mut self) -> Option<Segment> {
        self.segments.pop_front()
    }

    /// Release all entries and their backing bytes.
    pub fn clear(&mut self) {
        if !self.segments.is_empty() {
            tracing::debug!(released = self.segments.len(), "segment backlog cleared");
        }
        self.segments.clear();
    }
}
