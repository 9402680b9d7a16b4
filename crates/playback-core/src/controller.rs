//! Top-level playback state machine and per-tick video pump.
//!
//! The controller owns the segment backlog, the demuxed sources, and the
//! audio pipeline. An external render-loop clock drives [`PlayerController::update`];
//! a dedicated thread (spawned on `play`) drives the audio feed loop.
//!
//! One controller lock guards the backlog, the source handles, and the
//! pending video frame; `update` holds it for the whole tick, which
//! serializes pump ticks against concurrent `seek`/`stop` calls.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, unbounded};
use playback_types::{PlaybackEndReason, PlaybackState, PlayerStatus};

use crate::config::PlayerConfig;
use crate::error::{PlayError, StartError};
use crate::media::{
    DecoderFactory, MediaBuffer, Renderer, SegmentProvider, SinkFactory, Source, SourceFactory,
    SourceRead,
};
use crate::pipeline::{AudioPipeline, PlayerEvent, run_feed_loop};
use crate::segment::{Segment, SegmentQueue};
use crate::sync::{SyncDecision, SyncGate};

/// Outcome of one pump tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickResult {
    /// Nothing to present this tick (not playing, frame held, or a
    /// recoverable source condition).
    NoOp,
    /// A video frame was presented.
    Rendered,
    /// Playback reached a terminal condition; see the status end reason.
    Terminal,
}

/// External capabilities handed to the controller at construction.
///
/// Nothing in the core reaches for a global SDK object; everything it calls
/// out to arrives here.
pub struct Collaborators {
    /// Builds demuxed sources from the segment backlog.
    pub sources: Box<dyn SourceFactory>,
    /// Builds a fresh compressed-audio decoder per pipeline start.
    pub decoders: Arc<dyn DecoderFactory>,
    /// Builds the output device abstraction for each pipeline instance.
    pub sink: Box<dyn SinkFactory>,
    /// Presents decoded video frames.
    pub renderer: Box<dyn Renderer>,
    /// Segment fetcher.
    pub segments: Box<dyn SegmentProvider>,
}

struct ControllerInner {
    state: PlaybackState,
    segments: SegmentQueue,
    video: Option<Box<dyn Source>>,
    pending_video: Option<MediaBuffer>,
    audio: Option<Arc<AudioPipeline>>,
    feed_thread: Option<JoinHandle<()>>,
    sync: SyncGate,
    factory: Box<dyn SourceFactory>,
    decoders: Arc<dyn DecoderFactory>,
    sink_factory: Box<dyn SinkFactory>,
    renderer: Box<dyn Renderer>,
    provider: Box<dyn SegmentProvider>,
    last_video_time_us: i64,
    video_frame_delta_us: i64,
    frames_read: u64,
    frames_rendered: u64,
    frames_dropped: u64,
    seek_base_ms: i64,
    end_reason: Option<PlaybackEndReason>,
}

/// The playback controller: play/pause/stop/seek plus the per-tick pump.
pub struct PlayerController {
    inner: Mutex<ControllerInner>,
    config: PlayerConfig,
    events_tx: Sender<PlayerEvent>,
    events_rx: Receiver<PlayerEvent>,
}

impl PlayerController {
    pub fn new(collaborators: Collaborators, config: PlayerConfig) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            inner: Mutex::new(ControllerInner {
                state: PlaybackState::Stopped,
                segments: SegmentQueue::new(),
                video: None,
                pending_video: None,
                audio: None,
                feed_thread: None,
                sync: SyncGate::new(config.sync),
                factory: collaborators.sources,
                decoders: collaborators.decoders,
                sink_factory: collaborators.sink,
                renderer: collaborators.renderer,
                provider: collaborators.segments,
                last_video_time_us: 0,
                video_frame_delta_us: 0,
                frames_read: 0,
                frames_rendered: 0,
                frames_dropped: 0,
                seek_base_ms: 0,
                end_reason: None,
            }),
            config,
            events_tx,
            events_rx,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.inner.lock().unwrap().state
    }

    /// Pipeline notifications (discontinuities) for the host to react to.
    pub fn events(&self) -> &Receiver<PlayerEvent> {
        &self.events_rx
    }

    /// Append a fetched segment to the backlog.
    ///
    /// If the audio pipeline is parked at an end-of-stream boundary, the new
    /// data re-arms it.
    pub fn feed_segment(&self, segment: Segment) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.segments.append(segment);
        if let Some(audio) = inner.audio.as_ref() {
            audio.resume_feeding();
        }
    }

    /// Start playing the current segment backlog. No-op while already
    /// Playing.
    pub fn play(&self) -> Result<(), PlayError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == PlaybackState::Playing {
            tracing::debug!("already playing");
            return Ok(());
        }
        tracing::info!(
            preloaded = inner.segments.preloaded_count(),
            "starting playback"
        );
        self.start_playback(&mut inner, None)
    }

    /// Pause when playing, resume when paused.
    pub fn toggle_pause(&self) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        match inner.state {
            PlaybackState::Paused => {
                inner.state = PlaybackState::Playing;
                if let Some(audio) = inner.audio.as_ref() {
                    audio.play();
                }
            }
            PlaybackState::Playing => {
                inner.state = PlaybackState::Paused;
                if let Some(audio) = inner.audio.as_ref() {
                    audio.pause();
                }
            }
            _ => {}
        }
    }

    /// Stop playback. The instance can be restarted with `play`.
    pub fn stop(&self) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if matches!(
            inner.state,
            PlaybackState::Playing | PlaybackState::Paused
        ) {
            tracing::info!("stopping playback");
            Self::halt(inner, PlaybackEndReason::Stopped);
        }
    }

    /// Seek to `time` seconds: tear down sources, wipe the backlog, fetch a
    /// segment covering the target, rebuild, and resume.
    ///
    /// On failure the controller stays in Seeking; the pump recovers once
    /// segments arrive.
    pub fn seek(&self, time: f64) -> Result<(), PlayError> {
        let time = time.max(0.0);
        let mut inner = self.inner.lock().unwrap();
        tracing::info!(target_secs = time, "seeking");
        inner.state = PlaybackState::Seeking;

        if let Some(audio) = inner.audio.as_ref() {
            audio.stop(true);
        }
        if let Some(mut video) = inner.video.take() {
            video.stop();
        }
        inner.pending_video = None;
        inner.last_video_time_us = 0;
        inner.video_frame_delta_us = 0;
        inner.frames_read = 0;
        inner.segments.clear();

        let segment_start = inner.provider.request_for_time(time);
        inner.seek_base_ms = (segment_start * 1000.0) as i64;
        tracing::info!(
            requested_secs = time,
            segment_start_secs = segment_start,
            "segment requested for seek"
        );

        self.start_playback(&mut inner, Some(time))
    }

    /// Tear everything down: stop the pipeline, join the feed thread, drop
    /// sources, wipe the backlog. Safe to call at any point.
    pub fn reset(&self) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        tracing::info!("resetting player");
        inner.state = PlaybackState::Stopped;
        if let Some(audio) = inner.audio.take() {
            audio.stop(false);
        }
        if let Some(handle) = inner.feed_thread.take() {
            let _ = handle.join();
        }
        if let Some(mut video) = inner.video.take() {
            video.stop();
        }
        inner.pending_video = None;
        inner.segments.clear();
        inner.last_video_time_us = 0;
        inner.video_frame_delta_us = 0;
        inner.frames_read = 0;
        inner.frames_rendered = 0;
        inner.frames_dropped = 0;
        inner.seek_base_ms = 0;
    }

    /// Playback position: audio clock plus the seek base.
    pub fn position_ms(&self) -> i64 {
        let inner = self.inner.lock().unwrap();
        Self::position_ms_locked(&inner)
    }

    pub fn status(&self) -> PlayerStatus {
        let inner = self.inner.lock().unwrap();
        PlayerStatus {
            state: inner.state,
            position_ms: Self::position_ms_locked(&inner),
            preloaded_segments: inner.segments.preloaded_count(),
            frames_read: inner.frames_read,
            frames_rendered: inner.frames_rendered,
            frames_dropped: inner.frames_dropped,
            end_reason: inner.end_reason,
        }
    }

    /// One pump tick: prefetch, read one video frame, gate it against the
    /// audio clock, present/hold/drop.
    pub fn update(&self) -> TickResult {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        if inner.state == PlaybackState::Seeking {
            let preloaded = inner.segments.preloaded_count();
            tracing::debug!(preloaded, "waiting for segments to resume from seek");
            if preloaded < 1 {
                return TickResult::NoOp;
            }
            inner.state = PlaybackState::Playing;
            if let Some(audio) = inner.audio.as_ref() {
                audio.play();
            }
        }

        if inner.state != PlaybackState::Playing {
            return TickResult::NoOp;
        }

        if inner.segments.preloaded_count() < self.config.prefetch_watermark {
            inner.provider.request_next();
        }

        loop {
            if inner.pending_video.is_none() {
                let Some(video) = inner.video.as_mut() else {
                    return TickResult::NoOp;
                };
                match video.read() {
                    Ok(SourceRead::Buffer(buffer)) => {
                        if !buffer.data.is_empty() {
                            inner.frames_read += 1;
                        }
                        inner.pending_video = Some(buffer);
                    }
                    Ok(
                        SourceRead::FormatChanged
                        | SourceRead::Discontinuity
                        | SourceRead::OutputBuffersChanged,
                    ) => {
                        tracing::debug!("video source reported a recoverable condition");
                        return TickResult::NoOp;
                    }
                    Ok(SourceRead::EndOfStream) => {
                        tracing::info!("end of video stream");
                        inner.end_reason = Some(PlaybackEndReason::EndOfStream);
                        return TickResult::Terminal;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "video read failed");
                        Self::halt(inner, PlaybackEndReason::Error);
                        return TickResult::Terminal;
                    }
                }
            }

            let Some(frame) = inner.pending_video.take() else {
                continue;
            };

            if frame.data.is_empty() {
                // Some decoders return spurious empty buffers; ignore them.
                tracing::trace!("discarding empty video buffer");
                continue;
            }

            let Some(time_us) = frame.time_us else {
                tracing::warn!("video frame missing time value; stopping");
                Self::halt(inner, PlaybackEndReason::Error);
                return TickResult::Terminal;
            };

            let audio_us = match inner.audio.as_ref() {
                Some(audio) => audio.timestamp_us(),
                // No audio clock: let the frame's own time keep video moving.
                None => time_us,
            };

            if time_us > inner.last_video_time_us {
                inner.video_frame_delta_us = time_us - inner.last_video_time_us;
            } else if time_us < inner.last_video_time_us {
                tracing::warn!(
                    time_us,
                    last_time_us = inner.last_video_time_us,
                    "video timestamp went backwards"
                );
            }
            let decision = inner.sync.decide(audio_us, time_us);
            tracing::debug!(
                audio_us,
                video_us = time_us,
                delta_us = audio_us - time_us,
                frame_delta_us = inner.video_frame_delta_us,
                decision = ?decision,
                "sync gate"
            );
            inner.last_video_time_us = time_us;

            match decision {
                SyncDecision::Hold => {
                    inner.pending_video = Some(frame);
                    std::thread::yield_now();
                    return TickResult::NoOp;
                }
                SyncDecision::Drop => {
                    inner.frames_dropped += 1;
                    continue;
                }
                SyncDecision::Present => match inner.renderer.present(&frame.data) {
                    Ok(()) => {
                        inner.frames_rendered += 1;
                        return TickResult::Rendered;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "renderer failed; stopping");
                        Self::halt(inner, PlaybackEndReason::Error);
                        return TickResult::Terminal;
                    }
                },
            }
        }
    }

    fn position_ms_locked(inner: &ControllerInner) -> i64 {
        let clock_ms = inner
            .audio
            .as_ref()
            .map(|audio| audio.timestamp_us() / 1000)
            .unwrap_or(0);
        clock_ms + inner.seek_base_ms
    }

    fn halt(inner: &mut ControllerInner, reason: PlaybackEndReason) {
        inner.state = PlaybackState::Stopped;
        inner.end_reason = Some(reason);
        if let Some(audio) = inner.audio.as_ref() {
            audio.stop(false);
        }
    }

    /// Build sources from the backlog and (re)start the audio pipeline.
    ///
    /// `anchor` lands the audio clock on a seek target before playback
    /// resumes. On any failure, sources are left cleared and a freshly
    /// created pipeline is torn back down.
    fn start_playback(
        &self,
        inner: &mut ControllerInner,
        anchor: Option<f64>,
    ) -> Result<(), PlayError> {
        let sources = {
            let ControllerInner {
                factory, segments, ..
            } = inner;
            factory.open(segments)?
        };

        let mut video = sources.video;
        if let Err(e) = video.start() {
            tracing::error!(error = %e, "video source failed to start");
            return Err(PlayError::CodecInit(e.to_string()));
        }

        let pipeline = match inner.audio.as_ref() {
            Some(p) if p.play_state() != PlaybackState::Stopped => p.clone(),
            _ => {
                // A previous pipeline is terminally stopped; its feed thread
                // is exiting or gone.
                if let Some(handle) = inner.feed_thread.take() {
                    let _ = handle.join();
                }
                let sink = inner.sink_factory.new_sink().map_err(StartError::Sink)?;
                let pipeline = Arc::new(AudioPipeline::new(
                    sink,
                    inner.decoders.clone(),
                    self.events_tx.clone(),
                    &self.config,
                ));
                let worker = pipeline.clone();
                let backlog = self.config.feed_backlog_frames;
                inner.feed_thread = Some(std::thread::spawn(move || {
                    run_feed_loop(&worker, backlog);
                }));
                inner.audio = Some(pipeline.clone());
                pipeline
            }
        };

        let started = (|| {
            pipeline.configure_source(sources.audio)?;
            if let Some(target) = anchor {
                pipeline.force_timestamp_update();
                if !pipeline.read_until(target) {
                    tracing::warn!(target_secs = target, "audio ended before seek target");
                }
            }
            pipeline.start()?;
            Ok::<(), PlayError>(())
        })();

        if let Err(e) = started {
            video.stop();
            pipeline.stop(false);
            inner.audio = None;
            if let Some(handle) = inner.feed_thread.take() {
                let _ = handle.join();
            }
            return Err(e);
        }
        pipeline.play();

        inner.video = Some(video);
        inner.state = PlaybackState::Playing;
        inner.end_reason = None;
        Ok(())
    }
}

impl Drop for PlayerController {
    fn drop(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OpenError;
    use crate::media::MediaSources;
    use crate::segment::SegmentHandle;
    use crate::testing::{
        FakeDecoderFactory, FakeRenderer, FakeSegmentProvider, FakeSink, FakeSinkFactory,
        FakeSource, FakeSourceFactory, aac_format, video_format,
    };
    use std::time::Duration;

    struct Rig {
        controller: PlayerController,
        sink: FakeSink,
        renderer: FakeRenderer,
        provider: FakeSegmentProvider,
        opens: Arc<Mutex<usize>>,
    }

    fn rig(results: Vec<Result<MediaSources, OpenError>>, segment_start: f64) -> Rig {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let sink = FakeSink::new(256);
        sink.set_auto_advance(false);
        let renderer = FakeRenderer::new();
        let provider = FakeSegmentProvider::new(segment_start);
        let factory = FakeSourceFactory::new();
        for result in results {
            factory.push(result);
        }
        let opens = factory.opens();
        let controller = PlayerController::new(
            Collaborators {
                sources: Box::new(factory),
                decoders: Arc::new(FakeDecoderFactory::new(128)),
                sink: Box::new(FakeSinkFactory::new(sink.clone())),
                renderer: Box::new(renderer.clone()),
                segments: Box::new(provider.clone()),
            },
            PlayerConfig::default(),
        );
        Rig {
            controller,
            sink,
            renderer,
            provider,
            opens,
        }
    }

    fn media(video: &FakeSource, audio: Option<&FakeSource>) -> MediaSources {
        MediaSources {
            audio: audio.map(|a| Box::new(a.clone()) as Box<dyn Source>),
            video: Box::new(video.clone()),
        }
    }

    fn segment(start: f64) -> Segment {
        Segment::new(0, start, SegmentHandle::new(vec![0u8; 8]))
    }

    /// Pin the audio clock to `us` by positioning the fake playback head
    /// (silence path: offset stays zero).
    fn set_audio_clock(sink: &FakeSink, us: i64) {
        sink.set_head((us as f64 * 44_100.0 / 1_000_000.0).round() as u64);
    }

    #[test]
    fn play_without_tracks_fails_with_no_source() {
        let r = rig(vec![Err(OpenError::NoTracks)], 0.0);
        let err = r.controller.play().unwrap_err();
        assert!(matches!(err, PlayError::NoSource));
        assert_eq!(r.controller.state(), PlaybackState::Stopped);
    }

    #[test]
    fn play_surfaces_codec_init_failure() {
        let r = rig(vec![Err(OpenError::CodecInit("h264".to_string()))], 0.0);
        let err = r.controller.play().unwrap_err();
        assert!(matches!(err, PlayError::CodecInit(_)));
        assert_eq!(r.controller.state(), PlaybackState::Stopped);
    }

    #[test]
    fn play_is_idempotent_while_playing() {
        let video = FakeSource::new(video_format());
        let r = rig(vec![Ok(media(&video, None))], 0.0);

        r.controller.play().unwrap();
        assert_eq!(r.controller.state(), PlaybackState::Playing);
        r.controller.play().unwrap();
        assert_eq!(*r.opens.lock().unwrap(), 1);
        r.controller.reset();
    }

    #[test]
    fn update_is_a_noop_when_not_playing() {
        let r = rig(vec![], 0.0);
        assert_eq!(r.controller.update(), TickResult::NoOp);
        assert_eq!(r.provider.state().lock().unwrap().next_requests, 0);
    }

    #[test]
    fn prefetch_fires_below_watermark_only() {
        let video = FakeSource::new(video_format());
        let r = rig(vec![Ok(media(&video, None))], 0.0);
        r.controller.play().unwrap();

        r.controller.feed_segment(segment(0.0));
        r.controller.feed_segment(segment(10.0));

        video.push_buffer(vec![1u8; 16], Some(0));
        assert_eq!(r.controller.update(), TickResult::Rendered);
        // Two preloaded segments: below the watermark of three.
        assert_eq!(r.provider.state().lock().unwrap().next_requests, 1);

        r.controller.feed_segment(segment(20.0));
        video.push_buffer(vec![1u8; 16], Some(0));
        assert_eq!(r.controller.update(), TickResult::Rendered);
        // Three preloaded: watermark satisfied, no further request.
        assert_eq!(r.provider.state().lock().unwrap().next_requests, 1);
        r.controller.reset();
    }

    #[test]
    fn frame_ahead_of_clock_is_held_and_retried() {
        let video = FakeSource::new(video_format());
        let r = rig(vec![Ok(media(&video, None))], 0.0);
        r.controller.play().unwrap();
        for i in 0..3 {
            r.controller.feed_segment(segment(i as f64 * 10.0));
        }

        set_audio_clock(&r.sink, 1_000_000);
        // delta = -10 ms exactly: held.
        video.push_buffer(vec![1u8; 16], Some(1_010_000));
        assert_eq!(r.controller.update(), TickResult::NoOp);
        assert_eq!(r.controller.update(), TickResult::NoOp);
        // The held frame was re-evaluated, not re-read.
        assert_eq!(video.reads(), 1);
        assert!(r.renderer.state().lock().unwrap().presented.is_empty());

        set_audio_clock(&r.sink, 1_010_000);
        assert_eq!(r.controller.update(), TickResult::Rendered);
        assert_eq!(video.reads(), 1);
        r.controller.reset();
    }

    #[test]
    fn frame_behind_clock_is_dropped_and_next_presented() {
        let video = FakeSource::new(video_format());
        let r = rig(vec![Ok(media(&video, None))], 0.0);
        r.controller.play().unwrap();
        for i in 0..3 {
            r.controller.feed_segment(segment(i as f64 * 10.0));
        }

        set_audio_clock(&r.sink, 2_000_000);
        video.push_buffer(vec![1u8; 10], Some(1_000_000));
        video.push_buffer(vec![1u8; 20], Some(1_999_000));
        assert_eq!(r.controller.update(), TickResult::Rendered);

        let status = r.controller.status();
        assert_eq!(status.frames_dropped, 1);
        assert_eq!(status.frames_rendered, 1);
        assert_eq!(r.renderer.state().lock().unwrap().presented, vec![20]);
        r.controller.reset();
    }

    #[test]
    fn frame_on_drop_boundary_is_still_presented() {
        let video = FakeSource::new(video_format());
        let r = rig(vec![Ok(media(&video, None))], 0.0);
        r.controller.play().unwrap();
        for i in 0..3 {
            r.controller.feed_segment(segment(i as f64 * 10.0));
        }

        // delta = +40 ms exactly: presented, not dropped.
        set_audio_clock(&r.sink, 1_040_000);
        video.push_buffer(vec![1u8; 16], Some(1_000_000));
        assert_eq!(r.controller.update(), TickResult::Rendered);
        assert_eq!(r.controller.status().frames_dropped, 0);
        r.controller.reset();
    }

    #[test]
    fn spurious_empty_frames_are_discarded() {
        let video = FakeSource::new(video_format());
        let r = rig(vec![Ok(media(&video, None))], 0.0);
        r.controller.play().unwrap();
        for i in 0..3 {
            r.controller.feed_segment(segment(i as f64 * 10.0));
        }

        video.push_buffer(Vec::new(), None);
        video.push_buffer(vec![1u8; 12], Some(0));
        assert_eq!(r.controller.update(), TickResult::Rendered);

        let status = r.controller.status();
        assert_eq!(status.frames_read, 1);
        assert_eq!(r.renderer.state().lock().unwrap().presented, vec![12]);
        r.controller.reset();
    }

    #[test]
    fn frame_without_time_value_stops_playback() {
        let video = FakeSource::new(video_format());
        let r = rig(vec![Ok(media(&video, None))], 0.0);
        r.controller.play().unwrap();
        for i in 0..3 {
            r.controller.feed_segment(segment(i as f64 * 10.0));
        }

        video.push_buffer(vec![1u8; 8], None);
        assert_eq!(r.controller.update(), TickResult::Terminal);
        let status = r.controller.status();
        assert_eq!(status.state, PlaybackState::Stopped);
        assert_eq!(status.end_reason, Some(PlaybackEndReason::Error));
        r.controller.reset();
    }

    #[test]
    fn video_end_of_stream_is_terminal() {
        let video = FakeSource::new(video_format());
        let r = rig(vec![Ok(media(&video, None))], 0.0);
        r.controller.play().unwrap();
        for i in 0..3 {
            r.controller.feed_segment(segment(i as f64 * 10.0));
        }

        assert_eq!(r.controller.update(), TickResult::Terminal);
        assert_eq!(
            r.controller.status().end_reason,
            Some(PlaybackEndReason::EndOfStream)
        );
        r.controller.reset();
    }

    #[test]
    fn recoverable_video_conditions_are_noops() {
        let video = FakeSource::new(video_format());
        let r = rig(vec![Ok(media(&video, None))], 0.0);
        r.controller.play().unwrap();
        for i in 0..3 {
            r.controller.feed_segment(segment(i as f64 * 10.0));
        }

        video.push(SourceRead::FormatChanged);
        video.push(SourceRead::Discontinuity);
        video.push(SourceRead::OutputBuffersChanged);
        assert_eq!(r.controller.update(), TickResult::NoOp);
        assert_eq!(r.controller.update(), TickResult::NoOp);
        assert_eq!(r.controller.update(), TickResult::NoOp);
        assert_eq!(r.controller.state(), PlaybackState::Playing);
        r.controller.reset();
    }

    #[test]
    fn toggle_pause_round_trips() {
        let video = FakeSource::new(video_format());
        let r = rig(vec![Ok(media(&video, None))], 0.0);
        r.controller.play().unwrap();

        r.controller.toggle_pause();
        assert_eq!(r.controller.state(), PlaybackState::Paused);
        assert_eq!(r.sink.state().lock().unwrap().pause_calls, 1);
        assert_eq!(r.controller.update(), TickResult::NoOp);

        r.controller.toggle_pause();
        assert_eq!(r.controller.state(), PlaybackState::Playing);
        r.controller.reset();
    }

    #[test]
    fn stop_halts_pipeline_and_records_reason() {
        let video = FakeSource::new(video_format());
        let r = rig(vec![Ok(media(&video, None))], 0.0);
        r.controller.play().unwrap();

        r.controller.stop();
        let status = r.controller.status();
        assert_eq!(status.state, PlaybackState::Stopped);
        assert_eq!(status.end_reason, Some(PlaybackEndReason::Stopped));
        assert!(r.sink.state().lock().unwrap().stop_calls >= 1);
        assert_eq!(r.controller.update(), TickResult::NoOp);
        r.controller.reset();
    }

    #[test]
    fn play_after_stop_builds_a_fresh_pipeline() {
        let video1 = FakeSource::new(video_format());
        let video2 = FakeSource::new(video_format());
        let r = rig(
            vec![Ok(media(&video1, None)), Ok(media(&video2, None))],
            0.0,
        );

        r.controller.play().unwrap();
        r.controller.stop();
        r.controller.play().unwrap();

        assert_eq!(*r.opens.lock().unwrap(), 2);
        assert_eq!(r.controller.state(), PlaybackState::Playing);
        // Two devices were created over the two pipeline instances.
        assert_eq!(r.sink.state().lock().unwrap().created.len(), 2);
        r.controller.reset();
    }

    #[test]
    fn seek_wipes_backlog_and_lands_clock_on_target() {
        let video1 = FakeSource::new(video_format());
        let video2 = FakeSource::new(video_format());
        let audio2 = FakeSource::new(aac_format(44_100, 2));
        audio2.push_buffer(vec![0x5A; 64], Some(10_000_000));
        audio2.push_buffer(vec![0x5A; 64], Some(11_000_000));
        audio2.push_buffer(vec![0x5A; 64], Some(12_000_000));

        let r = rig(
            vec![Ok(media(&video1, None)), Ok(media(&video2, Some(&audio2)))],
            10.0,
        );
        r.controller.play().unwrap();
        r.controller.feed_segment(segment(0.0));
        r.controller.feed_segment(segment(10.0));

        r.controller.seek(12.0).unwrap();

        assert_eq!(r.provider.state().lock().unwrap().time_requests, vec![12.0]);
        let status = r.controller.status();
        assert_eq!(status.state, PlaybackState::Playing);
        // Backlog was wiped; only what the fetch collaborator pushes later
        // will refill it.
        assert_eq!(status.preloaded_segments, 0);
        // Clock anchored at the access-unit that reached the target, plus
        // the actual segment start as the position base.
        assert_eq!(status.position_ms, 12_000 + 10_000);
        r.controller.reset();
    }

    #[test]
    fn failed_seek_recovers_through_update_when_segments_arrive() {
        let video = FakeSource::new(video_format());
        let r = rig(vec![Ok(media(&video, None)), Err(OpenError::NoTracks)], 0.0);
        r.controller.play().unwrap();

        let err = r.controller.seek(5.0).unwrap_err();
        assert!(matches!(err, PlayError::NoSource));
        assert_eq!(r.controller.state(), PlaybackState::Seeking);

        // No segments yet: the pump idles.
        assert_eq!(r.controller.update(), TickResult::NoOp);
        assert_eq!(r.controller.state(), PlaybackState::Seeking);

        // A ready segment lets the pump resume playing.
        r.controller.feed_segment(segment(5.0));
        assert_eq!(r.controller.update(), TickResult::NoOp);
        assert_eq!(r.controller.state(), PlaybackState::Playing);
        r.controller.reset();
    }

    #[test]
    fn feed_segment_rearms_audio_after_discontinuity() {
        let video = FakeSource::new(video_format());
        let audio = FakeSource::new(aac_format(44_100, 2));
        let r = rig(vec![Ok(media(&video, Some(&audio)))], 0.0);
        r.controller.play().unwrap();

        // The audio source starts exhausted: the pipeline reports the
        // boundary and parks.
        let events = r.controller.events();
        assert_eq!(
            events.recv_timeout(Duration::from_secs(5)),
            Ok(PlayerEvent::Discontinuity)
        );

        // New segment data re-arms the feed loop, which hits the (still
        // empty) source and reports the next boundary.
        r.controller.feed_segment(segment(10.0));
        assert_eq!(
            events.recv_timeout(Duration::from_secs(5)),
            Ok(PlayerEvent::Discontinuity)
        );
        r.controller.reset();
    }

    #[test]
    fn reset_clears_state_and_releases_the_device() {
        let video = FakeSource::new(video_format());
        let r = rig(vec![Ok(media(&video, None))], 0.0);
        r.controller.play().unwrap();
        r.controller.feed_segment(segment(0.0));

        r.controller.reset();

        let status = r.controller.status();
        assert_eq!(status.state, PlaybackState::Stopped);
        assert_eq!(status.preloaded_segments, 0);
        assert_eq!(status.frames_read, 0);
        assert_eq!(status.frames_rendered, 0);
        assert!(r.sink.state().lock().unwrap().release_calls >= 1);
        let video_state = video.state();
        assert!(video_state.lock().unwrap().stopped);
    }
}
