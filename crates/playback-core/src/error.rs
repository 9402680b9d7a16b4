//! Typed errors for the playback core.
//!
//! Every operation reports failure through its return value; recoverable
//! conditions (format change, discontinuity, spurious empty buffers) are
//! absorbed inside the pipeline and never surface here.

use thiserror::Error;

/// Source metadata was missing a required field.
#[derive(Debug, Error)]
pub enum FormatError {
    /// The elementary stream is not the expected codec.
    #[error("unexpected mime type: {0}")]
    WrongMime(String),

    /// The source did not report a sample rate.
    #[error("source did not report a sample rate")]
    MissingSampleRate,

    /// The source did not report a channel count.
    #[error("source did not report a channel count")]
    MissingChannels,
}

/// `AudioPipeline::start` failed; no half-constructed state is left behind.
#[derive(Debug, Error)]
pub enum StartError {
    /// Refreshing the source format failed.
    #[error("format refresh failed: {0}")]
    Format(#[from] FormatError),

    /// The decoder rejected its codec-initialization bytes.
    #[error("decoder rejected codec configuration: {0}")]
    DecoderConfig(String),

    /// The derived format carries a zero sample rate.
    #[error("invalid audio format: zero sample rate")]
    InvalidFormat,

    /// The pipeline instance is terminally stopped.
    #[error("pipeline is stopped")]
    Stopped,

    /// The output sink could not be (re)created.
    #[error("audio sink error: {0}")]
    Sink(#[from] SinkError),
}

/// Compressed-audio decode failure.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Expected at input boundaries; not fatal.
    #[error("decoder needs more input")]
    NeedMoreInput,

    /// Any other mid-stream failure; ends the current feed cycle.
    #[error("decode failed: {0}")]
    Fatal(String),
}

/// Elementary-stream read failure reported by a source.
#[derive(Debug, Error)]
#[error("source read failed: {0}")]
pub struct SourceError(pub String);

/// Output sink creation or device negotiation failure.
#[derive(Debug, Error)]
pub enum SinkError {
    /// No usable output device or runtime.
    #[error("audio sink unavailable: {0}")]
    Unavailable(String),

    /// Backend-specific failure from the device layer.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Building the demuxed sources for playback failed.
#[derive(Debug, Error)]
pub enum OpenError {
    /// No demuxed audio or video track could be located.
    #[error("no playable tracks in the segment backlog")]
    NoTracks,

    /// Hardware/decoder construction failed for a track.
    #[error("codec initialization failed: {0}")]
    CodecInit(String),
}

/// `PlayerController::play` / `seek` failure; sources are left cleared.
#[derive(Debug, Error)]
pub enum PlayError {
    /// No demuxed audio or video track could be located.
    #[error("no playable tracks in the segment backlog")]
    NoSource,

    /// Decoder construction failed for a track.
    #[error("codec initialization failed: {0}")]
    CodecInit(String),

    /// The audio source format was unusable.
    #[error("audio format error: {0}")]
    Format(#[from] FormatError),

    /// The audio pipeline failed to start.
    #[error("audio pipeline start failed: {0}")]
    Audio(#[from] StartError),
}

impl From<OpenError> for PlayError {
    fn from(err: OpenError) -> Self {
        match err {
            OpenError::NoTracks => PlayError::NoSource,
            OpenError::CodecInit(msg) => PlayError::CodecInit(msg),
        }
    }
}

/// Frame presentation failure from the renderer collaborator.
#[derive(Debug, Error)]
#[error("render failed: {0}")]
pub struct RenderError(pub String);
