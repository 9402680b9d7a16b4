use serde::{Deserialize, Serialize};

/// Lifecycle state shared by the playback controller and the audio pipeline.
///
/// Transitions are owned by the state machines in `playback-core`; no other
/// code path assigns this value.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    /// Constructed but not yet started.
    Initialized,
    /// Actively decoding/presenting.
    Playing,
    /// Suspended; resumable without rebuilding sources.
    Paused,
    /// Tearing down and rebuilding sources around a seek target.
    Seeking,
    /// Terminal for the owning instance.
    Stopped,
}

/// Reason playback reached a terminal state.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEndReason {
    /// Natural end of the video elementary stream.
    EndOfStream,
    /// Decoder, source, or renderer error interrupted playback.
    Error,
    /// Playback was explicitly stopped by a command.
    Stopped,
}

/// Point-in-time view of the player for host/UI surfaces.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerStatus {
    /// Current controller state.
    pub state: PlaybackState,
    /// Playback position in milliseconds (audio clock + seek base).
    pub position_ms: i64,
    /// Unconsumed segments in the backlog.
    pub preloaded_segments: usize,
    /// Non-empty video frames read from the source.
    pub frames_read: u64,
    /// Video frames actually presented.
    pub frames_rendered: u64,
    /// Video frames dropped by the drift gate.
    pub frames_dropped: u64,
    /// End reason when playback has reached a terminal state.
    pub end_reason: Option<PlaybackEndReason>,
}
