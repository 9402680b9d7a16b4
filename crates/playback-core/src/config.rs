/// Drift window for the video sync gate.
///
/// The window is asymmetric on purpose: holding a frame only delays one tick,
/// dropping one loses a visible frame.
#[derive(Clone, Copy, Debug)]
pub struct SyncConfig {
    /// Hold the frame when the audio clock trails it by at least this much.
    pub hold_threshold_us: i64,
    /// Drop the frame when the audio clock leads it by more than this.
    pub drop_threshold_us: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            hold_threshold_us: 10_000,
            drop_threshold_us: 40_000,
        }
    }
}

/// Tuning parameters shared by the controller and the audio pipeline.
///
/// The defaults reproduce the empirically tuned values of the reference
/// player; none of them is a hard invariant.
#[derive(Clone, Copy, Debug)]
pub struct PlayerConfig {
    /// Drift window for present/hold/drop decisions.
    pub sync: SyncConfig,
    /// Request the next segment when fewer than this many are preloaded.
    pub prefetch_watermark: usize,
    /// PCM staging capacity as a multiple of the sink's minimum buffer size.
    ///
    /// The sink device object itself is created at twice the staging size.
    pub staging_margin: usize,
    /// Feed loop yields once this many frames are queued ahead of the device
    /// (~0.1 s at 44.1 kHz).
    pub feed_backlog_frames: i64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            prefetch_watermark: 3,
            staging_margin: 4,
            feed_backlog_frames: 4_410,
        }
    }
}
