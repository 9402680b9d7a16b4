//! In-memory fakes for the collaborator contracts.
//!
//! The sink/decoder/source/renderer traits exist precisely so the platform
//! pieces can be swapped for these in tests; host applications can reuse them
//! for their own test suites.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::{DecodeError, OpenError, RenderError, SinkError, SourceError};
use crate::media::{
    AudioDecoder, AudioSink, DecoderFactory, MediaBuffer, MediaSources, PcmEncoding, Renderer,
    SegmentProvider, SinkFactory, SinkSpec, Source, SourceFactory, SourceFormat, SourceRead,
    StreamInfo,
};
use crate::pipeline::EXPECTED_AUDIO_MIME;
use crate::segment::SegmentQueue;

/// A plausible AAC source format for tests.
pub fn aac_format(sample_rate: u32, channel_count: u16) -> SourceFormat {
    SourceFormat {
        mime: EXPECTED_AUDIO_MIME.to_string(),
        sample_rate: Some(sample_rate),
        channel_count: Some(channel_count),
        channel_mask: Some(0x3),
        codec_config: Some(vec![0x12, 0x10]),
    }
}

/// A plausible decoded-video source format for tests.
pub fn video_format() -> SourceFormat {
    SourceFormat {
        mime: "video/avc".to_string(),
        ..SourceFormat::default()
    }
}

#[derive(Debug, Default)]
pub struct FakeSinkState {
    pub min_buffer_bytes: usize,
    pub created: Vec<SinkSpec>,
    pub play_calls: usize,
    pub pause_calls: usize,
    pub stop_calls: usize,
    pub flush_calls: usize,
    pub release_calls: usize,
    /// Byte length of each write call, in order.
    pub writes: Vec<usize>,
    /// Contents of the most recent write.
    pub last_write: Vec<u8>,
    pub head_frames: u64,
    /// Advance the playback head as frames are written (instant consumption).
    pub auto_advance_head: bool,
    pub frame_bytes: usize,
}

/// In-memory output device. Clones share one recorded state.
#[derive(Clone, Debug)]
pub struct FakeSink {
    state: Arc<Mutex<FakeSinkState>>,
}

impl FakeSink {
    pub fn new(min_buffer_bytes: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeSinkState {
                min_buffer_bytes,
                auto_advance_head: true,
                frame_bytes: 4,
                ..FakeSinkState::default()
            })),
        }
    }

    pub fn state(&self) -> Arc<Mutex<FakeSinkState>> {
        self.state.clone()
    }

    pub fn set_head(&self, frames: u64) {
        self.state.lock().unwrap().head_frames = frames;
    }

    pub fn set_auto_advance(&self, enabled: bool) {
        self.state.lock().unwrap().auto_advance_head = enabled;
    }
}

impl AudioSink for FakeSink {
    fn min_buffer_size(&self, _rate: u32, _channels: u16, _encoding: PcmEncoding) -> usize {
        self.state.lock().unwrap().min_buffer_bytes
    }

    fn create(&mut self, spec: &SinkSpec) -> Result<(), SinkError> {
        let mut st = self.state.lock().unwrap();
        st.frame_bytes = (spec.channel_count as usize * 2).max(1);
        st.created.push(spec.clone());
        Ok(())
    }

    fn play(&mut self) {
        self.state.lock().unwrap().play_calls += 1;
    }

    fn pause(&mut self) {
        self.state.lock().unwrap().pause_calls += 1;
    }

    fn stop(&mut self) {
        self.state.lock().unwrap().stop_calls += 1;
    }

    fn flush(&mut self) {
        self.state.lock().unwrap().flush_calls += 1;
    }

    fn release(&mut self) {
        self.state.lock().unwrap().release_calls += 1;
    }

    fn write(&mut self, data: &[u8]) -> usize {
        let mut st = self.state.lock().unwrap();
        st.writes.push(data.len());
        st.last_write = data.to_vec();
        let frames = data.len() / st.frame_bytes;
        if st.auto_advance_head {
            st.head_frames += frames as u64;
        }
        frames
    }

    fn playback_head_position(&self) -> u64 {
        self.state.lock().unwrap().head_frames
    }
}

/// Hands out clones of one [`FakeSink`] so tests observe every pipeline
/// instance through a single recorded state.
pub struct FakeSinkFactory {
    sink: FakeSink,
}

impl FakeSinkFactory {
    pub fn new(sink: FakeSink) -> Self {
        Self { sink }
    }
}

impl SinkFactory for FakeSinkFactory {
    fn new_sink(&self) -> Result<Box<dyn AudioSink>, SinkError> {
        Ok(Box::new(self.sink.clone()))
    }
}

#[derive(Debug)]
pub struct FakeSourceState {
    pub format: SourceFormat,
    pub script: VecDeque<Result<SourceRead, SourceError>>,
    pub reads: usize,
    pub started: bool,
    pub stopped: bool,
    /// What `read` returns once the script is exhausted.
    pub end_behavior: SourceRead,
}

/// Scripted elementary stream. Clones share one state.
#[derive(Clone, Debug)]
pub struct FakeSource {
    state: Arc<Mutex<FakeSourceState>>,
}

impl FakeSource {
    pub fn new(format: SourceFormat) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeSourceState {
                format,
                script: VecDeque::new(),
                reads: 0,
                started: false,
                stopped: false,
                end_behavior: SourceRead::EndOfStream,
            })),
        }
    }

    pub fn state(&self) -> Arc<Mutex<FakeSourceState>> {
        self.state.clone()
    }

    pub fn push(&self, read: SourceRead) {
        self.state.lock().unwrap().script.push_back(Ok(read));
    }

    pub fn push_error(&self, err: SourceError) {
        self.state.lock().unwrap().script.push_back(Err(err));
    }

    pub fn push_buffer(&self, data: Vec<u8>, time_us: Option<i64>) {
        self.push(SourceRead::Buffer(MediaBuffer { data, time_us }));
    }

    pub fn reads(&self) -> usize {
        self.state.lock().unwrap().reads
    }
}

impl Source for FakeSource {
    fn start(&mut self) -> Result<(), SourceError> {
        self.state.lock().unwrap().started = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.state.lock().unwrap().stopped = true;
    }

    fn format(&self) -> SourceFormat {
        self.state.lock().unwrap().format.clone()
    }

    fn read(&mut self) -> Result<SourceRead, SourceError> {
        let mut st = self.state.lock().unwrap();
        st.reads += 1;
        match st.script.pop_front() {
            Some(read) => read,
            None => Ok(st.end_behavior.clone()),
        }
    }
}

/// Passthrough decoder: queued access-unit bytes come back out as PCM16
/// samples in frames of `frame_samples`.
#[derive(Debug)]
pub struct FakeDecoder {
    pending: VecDeque<Vec<u8>>,
    frame_samples: usize,
    configured_with: Option<Vec<u8>>,
    fail_configure: bool,
    fail_decode: bool,
}

impl FakeDecoder {
    pub fn new(frame_samples: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            frame_samples,
            configured_with: None,
            fail_configure: false,
            fail_decode: false,
        }
    }
}

impl AudioDecoder for FakeDecoder {
    fn configure(&mut self, codec_config: &[u8]) -> Result<(), DecodeError> {
        if self.fail_configure {
            return Err(DecodeError::Fatal("configuration rejected".to_string()));
        }
        self.configured_with = Some(codec_config.to_vec());
        Ok(())
    }

    fn fill(&mut self, data: &[u8]) -> Result<usize, DecodeError> {
        self.pending.push_back(data.to_vec());
        Ok(data.len())
    }

    fn decode_frame(&mut self) -> Result<Vec<i16>, DecodeError> {
        if self.fail_decode {
            return Err(DecodeError::Fatal("bitstream error".to_string()));
        }
        let Some(front) = self.pending.front_mut() else {
            return Err(DecodeError::NeedMoreInput);
        };
        let take = (self.frame_samples * 2).min(front.len());
        let chunk: Vec<u8> = front.drain(..take).collect();
        if front.is_empty() {
            self.pending.pop_front();
        }
        if chunk.is_empty() {
            return Err(DecodeError::NeedMoreInput);
        }
        let samples = chunk
            .chunks(2)
            .map(|pair| i16::from_le_bytes([pair[0], *pair.get(1).unwrap_or(&0)]))
            .collect();
        Ok(samples)
    }

    fn stream_info(&self) -> StreamInfo {
        StreamInfo {
            frame_size: self.frame_samples / 2,
            channel_count: 2,
        }
    }
}

/// Builds [`FakeDecoder`] instances and counts how many were created.
pub struct FakeDecoderFactory {
    frame_samples: usize,
    fail_configure: bool,
    fail_decode: bool,
    created: Arc<Mutex<usize>>,
}

impl FakeDecoderFactory {
    pub fn new(frame_samples: usize) -> Self {
        Self {
            frame_samples,
            fail_configure: false,
            fail_decode: false,
            created: Arc::new(Mutex::new(0)),
        }
    }

    pub fn failing_configure(mut self) -> Self {
        self.fail_configure = true;
        self
    }

    pub fn failing_decode(mut self) -> Self {
        self.fail_decode = true;
        self
    }

    pub fn created_count(&self) -> Arc<Mutex<usize>> {
        self.created.clone()
    }
}

impl DecoderFactory for FakeDecoderFactory {
    fn new_decoder(&self) -> Box<dyn AudioDecoder> {
        *self.created.lock().unwrap() += 1;
        let mut decoder = FakeDecoder::new(self.frame_samples);
        decoder.fail_configure = self.fail_configure;
        decoder.fail_decode = self.fail_decode;
        Box::new(decoder)
    }
}

#[derive(Debug, Default)]
pub struct FakeRendererState {
    /// Byte length of each presented frame.
    pub presented: Vec<usize>,
    pub fail: bool,
}

/// Records presented frames. Clones share one state.
#[derive(Clone, Debug, Default)]
pub struct FakeRenderer {
    state: Arc<Mutex<FakeRendererState>>,
}

impl FakeRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Arc<Mutex<FakeRendererState>> {
        self.state.clone()
    }
}

impl Renderer for FakeRenderer {
    fn present(&mut self, frame: &[u8]) -> Result<(), RenderError> {
        let mut st = self.state.lock().unwrap();
        if st.fail {
            return Err(RenderError("presentation failed".to_string()));
        }
        st.presented.push(frame.len());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeProviderState {
    pub next_requests: usize,
    pub time_requests: Vec<f64>,
    /// Returned as the actual start time of a time-targeted request.
    pub segment_start: f64,
}

/// Records fetch requests. Clones share one state.
#[derive(Clone, Debug, Default)]
pub struct FakeSegmentProvider {
    state: Arc<Mutex<FakeProviderState>>,
}

impl FakeSegmentProvider {
    pub fn new(segment_start: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeProviderState {
                segment_start,
                ..FakeProviderState::default()
            })),
        }
    }

    pub fn state(&self) -> Arc<Mutex<FakeProviderState>> {
        self.state.clone()
    }
}

impl SegmentProvider for FakeSegmentProvider {
    fn request_next(&self) {
        self.state.lock().unwrap().next_requests += 1;
    }

    fn request_for_time(&self, seconds: f64) -> f64 {
        let mut st = self.state.lock().unwrap();
        st.time_requests.push(seconds);
        st.segment_start
    }
}

/// Scripted source factory: each `open` pops the next prepared result.
#[derive(Default)]
pub struct FakeSourceFactory {
    results: Mutex<VecDeque<Result<MediaSources, OpenError>>>,
    opens: Arc<Mutex<usize>>,
}

impl FakeSourceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: Result<MediaSources, OpenError>) {
        self.results.lock().unwrap().push_back(result);
    }

    pub fn opens(&self) -> Arc<Mutex<usize>> {
        self.opens.clone()
    }
}

impl SourceFactory for FakeSourceFactory {
    fn open(&mut self, _segments: &mut SegmentQueue) -> Result<MediaSources, OpenError> {
        *self.opens.lock().unwrap() += 1;
        match self.results.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Err(OpenError::NoTracks),
        }
    }
}
