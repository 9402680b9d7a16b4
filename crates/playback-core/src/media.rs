//! Collaborator contracts consumed by the playback core.
//!
//! The core never reaches for an ambient runtime or global SDK object: the
//! controller and pipeline receive these capabilities as constructor
//! arguments, and tests supply the in-memory fakes from [`crate::testing`].

use crate::error::{DecodeError, OpenError, RenderError, SinkError, SourceError};
use crate::segment::SegmentQueue;

/// PCM sample encodings understood by the output sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PcmEncoding {
    /// Interleaved signed 16-bit little-endian samples.
    Pcm16,
}

/// One demuxed, still-compressed buffer from an elementary stream.
///
/// For audio this is a single access-unit; for video it is one decoded frame's
/// payload as produced by the (external) hardware decode path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaBuffer {
    /// Payload bytes. May be empty for spurious buffers some decoders emit.
    pub data: Vec<u8>,
    /// Container timestamp in microseconds, when the source provides one.
    pub time_us: Option<i64>,
}

/// Result of one `Source::read` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceRead {
    /// A media buffer was produced.
    Buffer(MediaBuffer),
    /// The stream format changed; callers must re-derive format info.
    FormatChanged,
    /// A break in the time sequence, e.g. at a segment boundary.
    Discontinuity,
    /// Informational: the decode path recycled its output buffers.
    OutputBuffersChanged,
    /// No more data in this source.
    EndOfStream,
}

/// Stream format derived from container metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceFormat {
    /// Container mime type of the elementary stream.
    pub mime: String,
    /// Sample rate in Hz, when the container reports one.
    pub sample_rate: Option<u32>,
    /// Channel count, when the container reports one.
    pub channel_count: Option<u16>,
    /// Channel mask; absent means "use channel order".
    pub channel_mask: Option<u32>,
    /// Opaque decoder-initialization bytes (ESDS-equivalent).
    pub codec_config: Option<Vec<u8>>,
}

/// Active audio format held by the pipeline, re-derived on format changes.
#[derive(Clone, Debug, Default)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channel_count: u16,
    pub channel_mask: u32,
    pub codec_config: Option<Vec<u8>>,
}

/// A demuxed elementary stream: the single polymorphic source capability.
pub trait Source: Send {
    fn start(&mut self) -> Result<(), SourceError>;
    fn stop(&mut self);
    fn format(&self) -> SourceFormat;
    fn read(&mut self) -> Result<SourceRead, SourceError>;
}

/// The demuxed sources for one playback session.
pub struct MediaSources {
    /// Compressed audio access-units; `None` engages the silence fallback.
    pub audio: Option<Box<dyn Source>>,
    /// Decoded video frames.
    pub video: Box<dyn Source>,
}

/// Builds [`MediaSources`] from the current segment backlog.
pub trait SourceFactory: Send {
    fn open(&mut self, segments: &mut SegmentQueue) -> Result<MediaSources, OpenError>;
}

/// Geometry of the decoder's output frames.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamInfo {
    /// Samples per channel in one decoded frame.
    pub frame_size: usize,
    /// Channels in the decoded output.
    pub channel_count: usize,
}

/// Compressed-audio decoder: frame-in / PCM-out.
///
/// The internal algorithm is out of scope; only this contract is used.
pub trait AudioDecoder: Send {
    /// Initialize from codec-configuration bytes.
    fn configure(&mut self, codec_config: &[u8]) -> Result<(), DecodeError>;

    /// Queue compressed input; returns the number of bytes consumed.
    fn fill(&mut self, data: &[u8]) -> Result<usize, DecodeError>;

    /// Produce one interleaved PCM frame, or [`DecodeError::NeedMoreInput`]
    /// when the queued input is exhausted.
    fn decode_frame(&mut self) -> Result<Vec<i16>, DecodeError>;

    /// Geometry of the most recently decoded frame.
    fn stream_info(&self) -> StreamInfo;
}

/// Creates a fresh decoder instance; seeks discard decoder-internal history,
/// so the pipeline rebuilds its decoder from this on every start.
pub trait DecoderFactory: Send + Sync {
    fn new_decoder(&self) -> Box<dyn AudioDecoder>;
}

/// Parameters for (re)creating the sink's device object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SinkSpec {
    pub sample_rate: u32,
    pub channel_count: u16,
    pub channel_mask: u32,
    pub encoding: PcmEncoding,
    /// Device queue size in bytes.
    pub buffer_bytes: usize,
}

/// Output device abstraction; its playback head defines "now".
///
/// The capability set mirrors a platform audio track so a pure in-memory fake
/// can stand in for the device in tests.
pub trait AudioSink: Send {
    /// Minimum device buffer size in bytes for the given format.
    fn min_buffer_size(&self, sample_rate: u32, channel_count: u16, encoding: PcmEncoding) -> usize;

    /// (Re)create the device object. Any previous device is released first.
    fn create(&mut self, spec: &SinkSpec) -> Result<(), SinkError>;

    fn play(&mut self);
    fn pause(&mut self);
    fn stop(&mut self);

    /// Discard queued-but-unplayed data.
    fn flush(&mut self);

    /// Tear down the device object.
    fn release(&mut self);

    /// Write interleaved PCM, blocking while the device queue is full and
    /// draining. Returns the number of frames written, which may be short if
    /// the sink is stopped or released mid-write.
    fn write(&mut self, data: &[u8]) -> usize;

    /// Frames rendered to hardware since device creation.
    fn playback_head_position(&self) -> u64;
}

/// Creates a fresh [`AudioSink`] for each pipeline instance.
pub trait SinkFactory: Send {
    fn new_sink(&self) -> Result<Box<dyn AudioSink>, SinkError>;
}

/// Presents decoded video frames; pixel format and scaling live behind it.
pub trait Renderer: Send {
    fn present(&mut self, frame: &[u8]) -> Result<(), RenderError>;
}

/// Segment fetch collaborator.
pub trait SegmentProvider: Send {
    /// Fire-and-forget request for the next sequential segment.
    fn request_next(&self);

    /// Blocking request for a segment covering `seconds`; returns the
    /// segment's actual start time, which may differ from the request.
    fn request_for_time(&self, seconds: f64) -> f64;
}
