//! Drift-based video frame gating.
//!
//! The audio clock is the master. Each candidate frame's container timestamp
//! is compared against it; the gate decides whether the frame is presented
//! now, held for the next tick, or dropped.

use crate::config::SyncConfig;

/// Outcome of a drift decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncDecision {
    /// Present the frame this tick.
    Present,
    /// Video is ahead of audio; retry the same frame next tick.
    Hold,
    /// Video is behind audio; discard and read the next frame immediately.
    Drop,
}

/// Decision function mapping audio/video clock delta to present/hold/drop.
#[derive(Clone, Copy, Debug)]
pub struct SyncGate {
    config: SyncConfig,
}

impl SyncGate {
    pub fn new(config: SyncConfig) -> Self {
        Self { config }
    }

    /// Decide what to do with a frame stamped `frame_us` when the audio clock
    /// reads `audio_us`.
    ///
    /// The hold bound is inclusive and the drop bound exclusive: a frame
    /// sitting exactly on the drop threshold is still presented.
    pub fn decide(&self, audio_us: i64, frame_us: i64) -> SyncDecision {
        let delta = audio_us - frame_us;
        if delta <= -self.config.hold_threshold_us {
            SyncDecision::Hold
        } else if delta > self.config.drop_threshold_us {
            SyncDecision::Drop
        } else {
            SyncDecision::Present
        }
    }
}
