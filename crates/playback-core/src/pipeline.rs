//! Decoded-audio feed pipeline and playback clock.
//!
//! Owns the compressed-audio source, the decoder, the PCM staging buffer, and
//! the output sink. A dedicated feed thread drives [`AudioPipeline::update`];
//! the controller reads the clock through [`AudioPipeline::timestamp_us`].
//!
//! ## Locking
//! - `state` + [`CreditGate`]: pause/resume/stop signalling. A `play` issued
//!   before the feed thread reaches its wait point banks a credit, so the
//!   release is never lost.
//! - `feed`: the PCM-write/flush sequence (source, decoder, staging, sink).
//!   The clock offset is only ever written while this lock is held; reads go
//!   through an atomic so the controller's tick never waits on a decode
//!   cycle.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};

use crossbeam_channel::Sender;
use playback_types::PlaybackState;

use crate::config::PlayerConfig;
use crate::error::{DecodeError, FormatError, StartError};
use crate::gate::CreditGate;
use crate::media::{
    AudioDecoder, AudioFormat, AudioSink, DecoderFactory, MediaBuffer, PcmEncoding, SinkSpec,
    Source, SourceRead,
};
use crate::staging::PcmStagingBuffer;

/// The only compressed-audio mime type this pipeline accepts.
pub const EXPECTED_AUDIO_MIME: &str = "audio/mp4a-latm";

const SILENCE_SAMPLE_RATE: u32 = 44_100;
const SILENCE_CHANNELS: u16 = 2;

/// Outcome of one feed cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedDisposition {
    /// Source exhausted; poll again once more data arrives.
    Wait,
    /// Cycle completed; keep feeding.
    Continue,
    /// Terminal: the feed loop must exit.
    Finish,
}

/// Notifications from the pipeline to its owning controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayerEvent {
    /// The audio source hit a time-sequence break (e.g. end of a segment);
    /// feeding resumes when a new segment is appended.
    Discontinuity,
}

struct FeedState {
    source: Option<Box<dyn Source>>,
    format: AudioFormat,
    decoder: Option<Box<dyn AudioDecoder>>,
    staging: PcmStagingBuffer,
    sink: Box<dyn AudioSink>,
    sink_open: bool,
}

/// State-driven decode/feed pipeline with a device-derived clock.
pub struct AudioPipeline {
    state: Mutex<PlaybackState>,
    gate: CreditGate,
    feed: Mutex<FeedState>,
    decoders: Arc<dyn DecoderFactory>,
    events: Sender<PlayerEvent>,
    staging_margin: usize,
    /// Clock anchor mapping device position to container time.
    offset_us: AtomicI64,
    /// Re-anchor from the next access-unit's container timestamp.
    needs_offset: AtomicBool,
    sample_rate: AtomicU32,
    frames_written: AtomicU64,
    /// Source exhausted; feed cycles are no-ops until new data is appended.
    waiting: AtomicBool,
}

impl AudioPipeline {
    pub fn new(
        sink: Box<dyn AudioSink>,
        decoders: Arc<dyn DecoderFactory>,
        events: Sender<PlayerEvent>,
        config: &PlayerConfig,
    ) -> Self {
        Self {
            state: Mutex::new(PlaybackState::Initialized),
            gate: CreditGate::new(),
            feed: Mutex::new(FeedState {
                source: None,
                format: AudioFormat::default(),
                decoder: None,
                staging: PcmStagingBuffer::new(0),
                sink,
                sink_open: false,
            }),
            decoders,
            events,
            staging_margin: config.staging_margin,
            offset_us: AtomicI64::new(0),
            needs_offset: AtomicBool::new(true),
            sample_rate: AtomicU32::new(0),
            frames_written: AtomicU64::new(0),
            waiting: AtomicBool::new(true),
        }
    }

    pub fn play_state(&self) -> PlaybackState {
        *self.state.lock().unwrap()
    }

    /// Bind a new compressed-audio source and derive its format.
    ///
    /// Passing `None` engages the silence fallback: a 44100 Hz stereo format
    /// that keeps the clock advancing for pure-video streams.
    pub fn configure_source(&self, source: Option<Box<dyn Source>>) -> Result<(), FormatError> {
        let mut feed = self.feed.lock().unwrap();
        if let Some(mut old) = feed.source.take() {
            old.stop();
        }
        feed.source = source;
        if let Some(src) = feed.source.as_mut() {
            if let Err(e) = src.start() {
                tracing::warn!(error = %e, "audio source failed to start");
            }
        }
        self.waiting.store(false, Ordering::Relaxed);
        Self::update_format_info(&mut feed)?;
        self.sample_rate
            .store(feed.format.sample_rate, Ordering::Relaxed);
        Ok(())
    }

    fn update_format_info(feed: &mut FeedState) -> Result<(), FormatError> {
        let Some(source) = feed.source.as_ref() else {
            tracing::warn!("no audio source; using silence format");
            feed.format = AudioFormat {
                sample_rate: SILENCE_SAMPLE_RATE,
                channel_count: SILENCE_CHANNELS,
                channel_mask: 0,
                codec_config: None,
            };
            return Ok(());
        };

        let fmt = source.format();
        if !fmt.mime.eq_ignore_ascii_case(EXPECTED_AUDIO_MIME) {
            tracing::error!(mime = %fmt.mime, "unexpected audio mime type");
            return Err(FormatError::WrongMime(fmt.mime));
        }
        let sample_rate = fmt.sample_rate.ok_or(FormatError::MissingSampleRate)?;
        let channel_count = fmt.channel_count.ok_or(FormatError::MissingChannels)?;
        let channel_mask = match fmt.channel_mask {
            Some(mask) => mask,
            None => {
                if channel_count > 2 {
                    tracing::debug!(channel_count, "no channel mask; using channel order");
                }
                0
            }
        };
        if fmt.codec_config.is_none() {
            // Degraded but not fatal; decode will fail loudly if it matters.
            tracing::error!("source carries no codec-initialization bytes");
        }
        feed.format = AudioFormat {
            sample_rate,
            channel_count,
            channel_mask,
            codec_config: fmt.codec_config,
        };
        Ok(())
    }

    /// (Re)initialize the decoder and the output device for the current
    /// format, then transition to Playing.
    pub fn start(&self) -> Result<(), StartError> {
        if self.play_state() == PlaybackState::Stopped {
            return Err(StartError::Stopped);
        }

        let mut feed = self.feed.lock().unwrap();
        feed.staging.clear();
        Self::update_format_info(&mut feed)?;

        let mut decoder = self.decoders.new_decoder();
        if let Some(cfg) = feed.format.codec_config.clone() {
            // A rejected configuration drops the fresh decoder on the floor;
            // the previous one is untouched.
            decoder
                .configure(&cfg)
                .map_err(|e| StartError::DecoderConfig(e.to_string()))?;
        }
        if feed.format.sample_rate == 0 {
            tracing::error!("zero sample rate");
            return Err(StartError::InvalidFormat);
        }

        let rate = feed.format.sample_rate;
        let channels = feed.format.channel_count;
        let channel_mask = feed.format.channel_mask;
        let min = feed.sink.min_buffer_size(rate, channels, PcmEncoding::Pcm16);
        let staging_bytes = min * self.staging_margin;
        tracing::debug!(min_buffer_bytes = min, staging_bytes, "sizing pcm staging");

        feed.decoder = Some(decoder);
        feed.staging = PcmStagingBuffer::new(staging_bytes);

        if feed.sink_open {
            tracing::debug!("releasing previous output device");
            feed.sink.release();
            feed.sink_open = false;
        }
        feed.sink.create(&SinkSpec {
            sample_rate: rate,
            channel_count: channels,
            channel_mask,
            encoding: PcmEncoding::Pcm16,
            buffer_bytes: staging_bytes * 2,
        })?;
        feed.sink_open = true;
        feed.sink.play();
        drop(feed);

        self.sample_rate.store(rate, Ordering::Relaxed);
        let prev = {
            let mut s = self.state.lock().unwrap();
            let prev = *s;
            *s = PlaybackState::Playing;
            prev
        };
        if matches!(
            prev,
            PlaybackState::Paused | PlaybackState::Seeking | PlaybackState::Initialized
        ) {
            self.gate.release();
        }
        self.waiting.store(false, Ordering::Relaxed);
        self.frames_written.store(0, Ordering::Relaxed);
        tracing::info!(sample_rate = rate, channels, "audio pipeline started");
        Ok(())
    }

    /// Resume (or begin) playback on the existing device.
    pub fn play(&self) {
        self.waiting.store(false, Ordering::Relaxed);
        let prev = {
            let mut s = self.state.lock().unwrap();
            if *s == PlaybackState::Playing || *s == PlaybackState::Stopped {
                return;
            }
            let prev = *s;
            *s = PlaybackState::Playing;
            prev
        };
        tracing::info!(from = ?prev, credits = self.gate.credits(), "audio pipeline playing");
        self.gate.release();
        let mut feed = self.feed.lock().unwrap();
        if feed.sink_open {
            feed.sink.play();
        }
        drop(feed);
        self.frames_written.store(0, Ordering::Relaxed);
    }

    pub fn pause(&self) {
        {
            let mut s = self.state.lock().unwrap();
            if *s != PlaybackState::Playing {
                return;
            }
            *s = PlaybackState::Paused;
        }
        tracing::info!("audio pipeline paused");
        let mut feed = self.feed.lock().unwrap();
        if feed.sink_open {
            feed.sink.pause();
        }
    }

    /// Halt the device. `seeking` additionally discards the decoder, because
    /// a seek invalidates its internal frame history; it is rebuilt on the
    /// next `start`.
    pub fn stop(&self, seeking: bool) {
        let prev = {
            let mut s = self.state.lock().unwrap();
            if *s == PlaybackState::Stopped && !seeking {
                return;
            }
            let prev = *s;
            *s = if seeking {
                PlaybackState::Seeking
            } else {
                PlaybackState::Stopped
            };
            prev
        };
        tracing::info!(seeking, from = ?prev, "audio pipeline stopping");
        if matches!(
            prev,
            PlaybackState::Paused | PlaybackState::Seeking | PlaybackState::Initialized
        ) {
            self.gate.release();
        }
        let mut feed = self.feed.lock().unwrap();
        if seeking {
            feed.decoder = None;
        }
        if feed.sink_open {
            feed.sink.stop();
        }
    }

    /// Discard queued-but-unplayed device data. No-op while Playing.
    pub fn flush(&self) {
        if self.play_state() == PlaybackState::Playing {
            return;
        }
        let mut feed = self.feed.lock().unwrap();
        if feed.sink_open {
            feed.sink.flush();
        }
        drop(feed);
        self.frames_written.store(0, Ordering::Relaxed);
    }

    /// Full teardown: device released, decoder and source dropped. The
    /// instance is terminally stopped afterwards.
    pub fn close(&self) {
        self.stop(false);
        let mut feed = self.feed.lock().unwrap();
        if let Some(mut src) = feed.source.take() {
            src.stop();
        }
        feed.decoder = None;
        if feed.sink_open {
            feed.sink.release();
            feed.sink_open = false;
        }
        tracing::debug!("audio pipeline closed");
    }

    /// Clear the end-of-stream latch after new segment data arrives.
    pub fn resume_feeding(&self) {
        self.waiting.store(false, Ordering::Relaxed);
    }

    /// Re-anchor the clock from the next access-unit's container timestamp.
    pub fn force_timestamp_update(&self) {
        self.needs_offset.store(true, Ordering::Relaxed);
    }

    /// Anchor the clock: device-relative position maps to container time
    /// `offset_secs` onward.
    pub fn set_timestamp_offset(&self, offset_secs: f64) {
        tracing::debug!(offset_secs, "anchoring audio clock");
        self.offset_us
            .store((offset_secs * 1_000_000.0) as i64, Ordering::Relaxed);
        self.needs_offset.store(false, Ordering::Relaxed);
    }

    /// Current playback timestamp in microseconds of container time.
    ///
    /// With no live device this returns the last known anchor, which keeps
    /// the controller's clock consistent across teardown windows.
    pub fn timestamp_us(&self) -> i64 {
        let offset_us = self.offset_us.load(Ordering::Relaxed);
        let head = {
            let feed = self.feed.lock().unwrap();
            if !feed.sink_open {
                tracing::debug!("no output device; reporting last clock anchor");
                return offset_us;
            }
            feed.sink.playback_head_position()
        };
        let rate = self.sample_rate.load(Ordering::Relaxed);
        if rate == 0 {
            return offset_us;
        }
        let secs = head as f64 / rate as f64;
        offset_us + (secs * 1_000_000.0) as i64
    }

    /// Approximate frames queued in the device but not yet played; the feed
    /// loop's backpressure signal.
    pub fn queued_frames(&self) -> i64 {
        let feed = self.feed.lock().unwrap();
        if !feed.sink_open {
            return 0;
        }
        let head = feed.sink.playback_head_position() as i64;
        (self.frames_written.load(Ordering::Relaxed) / 2) as i64 - head
    }

    /// Consume audio access-units until `target_secs` of container time,
    /// then anchor the clock at the last consumed timestamp.
    ///
    /// Returns `false` if the stream ends (or fails) before the target. With
    /// no audio source the anchor is set to the target directly.
    pub fn read_until(&self, target_secs: f64) -> bool {
        let mut feed = self.feed.lock().unwrap();
        let target_us = (target_secs * 1_000_000.0) as i64;
        let mut time_us: i64 = 0;
        tracing::info!(target_secs, "reading audio ahead to seek target");

        if feed.source.is_none() {
            time_us = target_us;
        } else {
            while time_us < target_us {
                let Some(src) = feed.source.as_mut() else {
                    break;
                };
                match src.read() {
                    Ok(SourceRead::Buffer(buffer)) => {
                        time_us = match buffer.time_us {
                            Some(t) => t,
                            None => {
                                tracing::debug!("access-unit missing time value");
                                0
                            }
                        };
                    }
                    Ok(SourceRead::FormatChanged) => {
                        tracing::info!("audio format changed during read-ahead");
                    }
                    Ok(SourceRead::Discontinuity | SourceRead::OutputBuffersChanged) => {}
                    Ok(SourceRead::EndOfStream) => {
                        tracing::warn!("end of audio stream before seek target");
                        return false;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "read-ahead failed");
                        return false;
                    }
                }
                std::thread::yield_now();
            }
        }

        self.offset_us.store(time_us, Ordering::Relaxed);
        self.needs_offset.store(false, Ordering::Relaxed);
        true
    }

    /// One decode/feed cycle. See [`FeedDisposition`] for the contract.
    pub fn update(&self) -> FeedDisposition {
        self.update_cycle(true)
    }

    fn update_cycle(&self, allow_restart: bool) -> FeedDisposition {
        if self.waiting.load(Ordering::Relaxed) {
            return if self.play_state() == PlaybackState::Stopped {
                FeedDisposition::Finish
            } else {
                FeedDisposition::Wait
            };
        }

        loop {
            let state = self.play_state();
            match state {
                PlaybackState::Playing => break,
                PlaybackState::Stopped => {
                    tracing::debug!("pipeline stopped; ending feed updates");
                    return FeedDisposition::Finish;
                }
                PlaybackState::Initialized | PlaybackState::Paused | PlaybackState::Seeking => {
                    tracing::debug!(state = ?state, credits = self.gate.credits(), "feed thread parked");
                    self.gate.wait();
                }
            }
        }

        let mut feed = self.feed.lock().unwrap();
        let read = match feed.source.as_mut() {
            None => return self.write_silence(&mut feed),
            Some(src) => src.read(),
        };

        match read {
            Ok(SourceRead::Buffer(buffer)) => self.feed_buffer(&mut feed, buffer),
            Ok(SourceRead::FormatChanged) => {
                tracing::info!("audio stream format changed");
                drop(feed);
                self.flush();
                if let Err(e) = self.start() {
                    tracing::error!(error = %e, "restart after format change failed");
                    return FeedDisposition::Finish;
                }
                if allow_restart {
                    self.update_cycle(false)
                } else {
                    FeedDisposition::Continue
                }
            }
            Ok(SourceRead::Discontinuity | SourceRead::EndOfStream) => {
                tracing::info!("end of audio stream");
                self.waiting.store(true, Ordering::Relaxed);
                drop(feed);
                let _ = self.events.send(PlayerEvent::Discontinuity);
                FeedDisposition::Wait
            }
            Ok(SourceRead::OutputBuffersChanged) => FeedDisposition::Continue,
            Err(e) => {
                tracing::error!(error = %e, "audio source read failed");
                FeedDisposition::Finish
            }
        }
    }

    fn feed_buffer(&self, feed: &mut FeedState, buffer: MediaBuffer) -> FeedDisposition {
        let time_us = buffer.time_us.unwrap_or(0);
        // The first access-unit of a playback segment anchors the clock;
        // audio device position starts at zero, container time does not.
        if self.needs_offset.load(Ordering::Relaxed) {
            self.set_timestamp_offset(time_us as f64 / 1_000_000.0);
        }
        if buffer.data.is_empty() {
            return FeedDisposition::Continue;
        }

        let FeedState {
            decoder,
            staging,
            sink,
            ..
        } = feed;
        let Some(decoder) = decoder.as_mut() else {
            tracing::warn!("no decoder; dropping access-unit");
            return FeedDisposition::Continue;
        };

        let mut flushed_frames: u64 = 0;
        let data = &buffer.data;
        let mut pos = 0;
        while pos < data.len() {
            let consumed = match decoder.fill(&data[pos..]) {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(error = %e, "decoder refused input");
                    return FeedDisposition::Finish;
                }
            };
            if consumed == 0 {
                tracing::error!("decoder consumed no input");
                return FeedDisposition::Finish;
            }
            pos += consumed;

            loop {
                match decoder.decode_frame() {
                    Ok(pcm) => {
                        let bytes = pcm_to_bytes(&pcm);
                        staging.append(&bytes, |chunk| {
                            flushed_frames += sink.write(chunk) as u64;
                        });
                    }
                    Err(DecodeError::NeedMoreInput) => break,
                    Err(DecodeError::Fatal(e)) => {
                        tracing::error!(error = %e, "decode failed");
                        return FeedDisposition::Finish;
                    }
                }
            }
        }
        staging.flush(|chunk| {
            flushed_frames += sink.write(chunk) as u64;
        });
        if flushed_frames > 0 {
            self.frames_written
                .fetch_add(flushed_frames, Ordering::Relaxed);
        }
        FeedDisposition::Continue
    }

    /// Keep the clock advancing at real rate when there is nothing to decode.
    fn write_silence(&self, feed: &mut FeedState) -> FeedDisposition {
        let capacity = feed.staging.capacity();
        if capacity == 0 {
            return FeedDisposition::Continue;
        }
        let zeros = vec![0u8; capacity];
        let frames = feed.sink.write(&zeros) as u64;
        if frames > 0 {
            self.frames_written.fetch_add(frames, Ordering::Relaxed);
        }
        tracing::trace!(bytes = capacity, "fed silence");
        FeedDisposition::Continue
    }
}

fn pcm_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

/// Drive a pipeline's feed cycle until it reports `Finish`, then release the
/// device.
///
/// Yields the scheduler while the device-side backlog estimate exceeds
/// `backlog_frames` to avoid buffering unboundedly ahead of the device.
pub fn run_feed_loop(pipeline: &AudioPipeline, backlog_frames: i64) {
    loop {
        match pipeline.update() {
            FeedDisposition::Continue => {
                if pipeline.queued_frames() > backlog_frames {
                    std::thread::yield_now();
                }
            }
            FeedDisposition::Wait => std::thread::sleep(std::time::Duration::from_millis(10)),
            FeedDisposition::Finish => break,
        }
    }
    pipeline.close();
    tracing::debug!("audio feed loop ending");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDecoderFactory, FakeSink, FakeSource, aac_format, video_format};
    use crossbeam_channel::{Receiver, unbounded};

    const MIN_BUF: usize = 256;
    const STAGING: usize = MIN_BUF * 4;

    fn pipeline(
        sink: &FakeSink,
        decoders: FakeDecoderFactory,
    ) -> (AudioPipeline, Receiver<PlayerEvent>) {
        let (tx, rx) = unbounded();
        let p = AudioPipeline::new(
            Box::new(sink.clone()),
            Arc::new(decoders),
            tx,
            &PlayerConfig::default(),
        );
        (p, rx)
    }

    fn aac_source_with(aus: &[(usize, i64)]) -> FakeSource {
        let source = FakeSource::new(aac_format(44_100, 2));
        for (len, time) in aus {
            source.push_buffer(vec![0x5A; *len], Some(*time));
        }
        source
    }

    #[test]
    fn configure_wrong_mime_is_fatal_and_stays_initialized() {
        let sink = FakeSink::new(MIN_BUF);
        let (p, _rx) = pipeline(&sink, FakeDecoderFactory::new(128));
        let source = FakeSource::new(video_format());

        let err = p.configure_source(Some(Box::new(source))).unwrap_err();
        assert!(matches!(err, FormatError::WrongMime(_)));
        assert_eq!(p.play_state(), PlaybackState::Initialized);
    }

    #[test]
    fn configure_missing_sample_rate_is_fatal() {
        let sink = FakeSink::new(MIN_BUF);
        let (p, _rx) = pipeline(&sink, FakeDecoderFactory::new(128));
        let mut format = aac_format(44_100, 2);
        format.sample_rate = None;
        let source = FakeSource::new(format);

        let err = p.configure_source(Some(Box::new(source))).unwrap_err();
        assert!(matches!(err, FormatError::MissingSampleRate));
    }

    #[test]
    fn configure_without_codec_config_degrades() {
        let sink = FakeSink::new(MIN_BUF);
        let (p, _rx) = pipeline(&sink, FakeDecoderFactory::new(128));
        let mut format = aac_format(44_100, 2);
        format.codec_config = None;
        let source = FakeSource::new(format);

        assert!(p.configure_source(Some(Box::new(source))).is_ok());
        assert!(p.start().is_ok());
    }

    #[test]
    fn start_sizes_device_from_minimum_buffer() {
        let sink = FakeSink::new(MIN_BUF);
        let (p, _rx) = pipeline(&sink, FakeDecoderFactory::new(128));
        let source = aac_source_with(&[]);

        p.configure_source(Some(Box::new(source))).unwrap();
        p.start().unwrap();

        let st = sink.state();
        let st = st.lock().unwrap();
        assert_eq!(st.created.len(), 1);
        let spec = &st.created[0];
        assert_eq!(spec.sample_rate, 44_100);
        assert_eq!(spec.channel_count, 2);
        // Device object carries twice the staging size (8x the minimum).
        assert_eq!(spec.buffer_bytes, STAGING * 2);
        assert_eq!(st.play_calls, 1);
        drop(st);
        assert_eq!(p.play_state(), PlaybackState::Playing);
    }

    #[test]
    fn start_rejects_zero_sample_rate() {
        let sink = FakeSink::new(MIN_BUF);
        let (p, _rx) = pipeline(&sink, FakeDecoderFactory::new(128));
        let source = FakeSource::new(aac_format(0, 2));

        p.configure_source(Some(Box::new(source))).unwrap();
        let err = p.start().unwrap_err();
        assert!(matches!(err, StartError::InvalidFormat));
        assert_eq!(p.play_state(), PlaybackState::Initialized);
    }

    #[test]
    fn start_rejected_codec_config_leaves_no_device() {
        let sink = FakeSink::new(MIN_BUF);
        let (p, _rx) = pipeline(&sink, FakeDecoderFactory::new(128).failing_configure());
        let source = aac_source_with(&[]);

        p.configure_source(Some(Box::new(source))).unwrap();
        let err = p.start().unwrap_err();
        assert!(matches!(err, StartError::DecoderConfig(_)));
        assert!(sink.state().lock().unwrap().created.is_empty());
        assert_eq!(p.play_state(), PlaybackState::Initialized);
    }

    #[test]
    fn silence_update_writes_zeroed_staging_and_advances_clock() {
        let sink = FakeSink::new(MIN_BUF);
        let (p, _rx) = pipeline(&sink, FakeDecoderFactory::new(128));

        p.configure_source(None).unwrap();
        p.start().unwrap();
        let before = p.timestamp_us();

        assert_eq!(p.update(), FeedDisposition::Continue);

        let st = sink.state();
        let st = st.lock().unwrap();
        assert_eq!(st.writes, vec![STAGING]);
        assert!(st.last_write.iter().all(|b| *b == 0));
        drop(st);
        assert!(p.timestamp_us() > before);
    }

    #[test]
    fn decode_path_batches_frames_into_staging_flushes() {
        let sink = FakeSink::new(MIN_BUF);
        // 128 samples = 256 bytes per decoded frame; 4 frames fill staging.
        let (p, _rx) = pipeline(&sink, FakeDecoderFactory::new(128));
        let source = aac_source_with(&[(STAGING, 5_000_000)]);

        p.configure_source(Some(Box::new(source))).unwrap();
        p.start().unwrap();
        assert_eq!(p.update(), FeedDisposition::Continue);

        assert_eq!(sink.state().lock().unwrap().writes, vec![STAGING]);
        // Clock anchored from the first access-unit's container time.
        assert!(p.timestamp_us() >= 5_000_000);
    }

    #[test]
    fn exact_multiple_yields_full_capacity_writes_only() {
        let sink = FakeSink::new(MIN_BUF);
        let (p, _rx) = pipeline(&sink, FakeDecoderFactory::new(128));
        let source = aac_source_with(&[
            (STAGING, 0),
            (STAGING, 23_220),
            (STAGING, 46_440),
            (STAGING, 69_660),
        ]);

        p.configure_source(Some(Box::new(source))).unwrap();
        p.start().unwrap();
        for _ in 0..4 {
            assert_eq!(p.update(), FeedDisposition::Continue);
        }

        assert_eq!(
            sink.state().lock().unwrap().writes,
            vec![STAGING, STAGING, STAGING, STAGING]
        );
    }

    #[test]
    fn end_of_stream_waits_and_signals_discontinuity() {
        let sink = FakeSink::new(MIN_BUF);
        let (p, rx) = pipeline(&sink, FakeDecoderFactory::new(128));
        let source = aac_source_with(&[]);
        let reads = source.clone();

        p.configure_source(Some(Box::new(source))).unwrap();
        p.start().unwrap();

        assert_eq!(p.update(), FeedDisposition::Wait);
        assert_eq!(rx.try_recv(), Ok(PlayerEvent::Discontinuity));

        // Latched: no further source reads until feeding resumes.
        assert_eq!(p.update(), FeedDisposition::Wait);
        assert_eq!(reads.reads(), 1);

        reads.push_buffer(vec![0x5A; 256], Some(100_000));
        p.resume_feeding();
        assert_eq!(p.update(), FeedDisposition::Continue);
    }

    #[test]
    fn fatal_decode_error_finishes_cycle() {
        let sink = FakeSink::new(MIN_BUF);
        let (p, _rx) = pipeline(&sink, FakeDecoderFactory::new(128).failing_decode());
        let source = aac_source_with(&[(256, 0)]);

        p.configure_source(Some(Box::new(source))).unwrap();
        p.start().unwrap();
        assert_eq!(p.update(), FeedDisposition::Finish);
    }

    #[test]
    fn source_error_finishes_cycle() {
        let sink = FakeSink::new(MIN_BUF);
        let (p, _rx) = pipeline(&sink, FakeDecoderFactory::new(128));
        let source = aac_source_with(&[]);
        source.push_error(crate::error::SourceError("transport died".to_string()));

        p.configure_source(Some(Box::new(source))).unwrap();
        p.start().unwrap();
        assert_eq!(p.update(), FeedDisposition::Finish);
    }

    #[test]
    fn format_change_restarts_device_and_continues() {
        let sink = FakeSink::new(MIN_BUF);
        let decoders = FakeDecoderFactory::new(128);
        let created = decoders.created_count();
        let (p, _rx) = pipeline(&sink, decoders);
        let source = FakeSource::new(aac_format(44_100, 2));
        source.push(SourceRead::FormatChanged);
        source.push_buffer(vec![0x5A; 256], Some(0));

        p.configure_source(Some(Box::new(source))).unwrap();
        p.start().unwrap();
        assert_eq!(*created.lock().unwrap(), 1);

        assert_eq!(p.update(), FeedDisposition::Continue);

        // Restarted: fresh decoder, fresh device, and the queued access-unit
        // was consumed by the single recursed cycle.
        assert_eq!(*created.lock().unwrap(), 2);
        assert_eq!(sink.state().lock().unwrap().created.len(), 2);
        assert!(!sink.state().lock().unwrap().writes.is_empty());
    }

    #[test]
    fn stop_for_seek_discards_decoder_until_restart() {
        let sink = FakeSink::new(MIN_BUF);
        let decoders = FakeDecoderFactory::new(128);
        let created = decoders.created_count();
        let (p, _rx) = pipeline(&sink, decoders);
        let source = aac_source_with(&[]);

        p.configure_source(Some(Box::new(source))).unwrap();
        p.start().unwrap();
        p.stop(true);
        assert_eq!(p.play_state(), PlaybackState::Seeking);

        p.start().unwrap();
        p.play();
        assert_eq!(p.play_state(), PlaybackState::Playing);
        assert_eq!(*created.lock().unwrap(), 2);
    }

    #[test]
    fn play_and_pause_are_idempotent() {
        let sink = FakeSink::new(MIN_BUF);
        let (p, _rx) = pipeline(&sink, FakeDecoderFactory::new(128));
        p.configure_source(None).unwrap();
        p.start().unwrap();

        p.play();
        let st = sink.state();
        assert_eq!(st.lock().unwrap().play_calls, 1);

        p.pause();
        p.pause();
        assert_eq!(st.lock().unwrap().pause_calls, 1);
        assert_eq!(p.play_state(), PlaybackState::Paused);

        p.play();
        assert_eq!(st.lock().unwrap().play_calls, 2);
        assert_eq!(p.play_state(), PlaybackState::Playing);
    }

    #[test]
    fn resume_before_feed_thread_waits_banks_a_credit() {
        let sink = FakeSink::new(MIN_BUF);
        let (p, _rx) = pipeline(&sink, FakeDecoderFactory::new(128));
        p.configure_source(None).unwrap();
        p.start().unwrap();

        p.pause();
        p.play();
        // No thread was parked on the gate, so the release is banked rather
        // than lost and a later wait consumes it without blocking.
        assert!(p.gate.credits() >= 1);
        assert_eq!(p.update(), FeedDisposition::Continue);
    }

    #[test]
    fn stopped_pipeline_short_circuits_update() {
        let sink = FakeSink::new(MIN_BUF);
        let (p, _rx) = pipeline(&sink, FakeDecoderFactory::new(128));
        p.configure_source(None).unwrap();
        p.start().unwrap();
        p.stop(false);
        assert_eq!(p.update(), FeedDisposition::Finish);
    }

    #[test]
    fn update_parks_while_paused_until_play() {
        let sink = FakeSink::new(MIN_BUF);
        let (p, _rx) = pipeline(&sink, FakeDecoderFactory::new(128));
        p.configure_source(None).unwrap();
        p.start().unwrap();
        p.pause();

        let p = Arc::new(p);
        let worker = p.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = std::thread::spawn(move || {
            let _ = tx.send(());
            worker.update()
        });

        let _ = rx.recv();
        // Give the worker a moment to park on the gate before resuming.
        std::thread::sleep(std::time::Duration::from_millis(20));
        p.play();
        assert_eq!(handle.join().unwrap(), FeedDisposition::Continue);
    }

    #[test]
    fn timestamps_are_monotonic_for_fixed_format() {
        let sink = FakeSink::new(MIN_BUF);
        let (p, _rx) = pipeline(&sink, FakeDecoderFactory::new(128));
        p.configure_source(None).unwrap();
        p.start().unwrap();

        let mut last = p.timestamp_us();
        for _ in 0..5 {
            p.update();
            let now = p.timestamp_us();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn timestamp_without_device_reports_last_anchor() {
        let sink = FakeSink::new(MIN_BUF);
        let (p, _rx) = pipeline(&sink, FakeDecoderFactory::new(128));
        p.set_timestamp_offset(12.5);
        assert_eq!(p.timestamp_us(), 12_500_000);
    }

    #[test]
    fn queued_frames_follows_written_over_two_minus_head() {
        let sink = FakeSink::new(MIN_BUF);
        sink.set_auto_advance(false);
        let (p, _rx) = pipeline(&sink, FakeDecoderFactory::new(128));
        p.configure_source(None).unwrap();
        p.start().unwrap();
        p.update();

        // One silence write of STAGING bytes = STAGING/4 frames.
        let written = (STAGING / 4) as i64;
        assert_eq!(p.queued_frames(), written / 2);
        sink.set_head(10);
        assert_eq!(p.queued_frames(), written / 2 - 10);
    }

    #[test]
    fn read_until_anchors_clock_at_reached_time() {
        let sink = FakeSink::new(MIN_BUF);
        sink.set_auto_advance(false);
        let (p, _rx) = pipeline(&sink, FakeDecoderFactory::new(128));
        let source = aac_source_with(&[(64, 0), (64, 21_333), (64, 42_666)]);

        p.configure_source(Some(Box::new(source))).unwrap();
        p.start().unwrap();
        assert!(p.read_until(0.04));
        assert_eq!(p.timestamp_us(), 42_666);
    }

    #[test]
    fn read_until_reports_end_of_stream() {
        let sink = FakeSink::new(MIN_BUF);
        let (p, _rx) = pipeline(&sink, FakeDecoderFactory::new(128));
        let source = aac_source_with(&[(64, 0)]);

        p.configure_source(Some(Box::new(source))).unwrap();
        p.start().unwrap();
        assert!(!p.read_until(10.0));
    }

    #[test]
    fn read_until_without_source_anchors_at_target() {
        let sink = FakeSink::new(MIN_BUF);
        sink.set_auto_advance(false);
        let (p, _rx) = pipeline(&sink, FakeDecoderFactory::new(128));
        p.configure_source(None).unwrap();
        p.start().unwrap();
        assert!(p.read_until(7.25));
        assert_eq!(p.timestamp_us(), 7_250_000);
    }

    #[test]
    fn feed_loop_exits_on_stop_and_releases_device() {
        let sink = FakeSink::new(MIN_BUF);
        let (p, rx) = pipeline(&sink, FakeDecoderFactory::new(128));
        let source = aac_source_with(&[(256, 0)]);

        p.configure_source(Some(Box::new(source))).unwrap();
        p.start().unwrap();

        let p = Arc::new(p);
        let worker = p.clone();
        let backlog = PlayerConfig::default().feed_backlog_frames;
        let handle = std::thread::spawn(move || run_feed_loop(&worker, backlog));

        // The single access-unit is consumed, then the source reports end of
        // stream and the loop idles in Wait.
        assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(5)), Ok(PlayerEvent::Discontinuity));

        p.stop(false);
        handle.join().unwrap();
        assert!(sink.state().lock().unwrap().release_calls >= 1);
    }
}
