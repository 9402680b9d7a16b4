//! CPAL-backed output sink.
//!
//! The device stream is owned by a dedicated thread (CPAL streams must stay
//! on the thread that created them); the sink object talks to it through a
//! command channel and a shared bounded ring:
//! - `write` pushes interleaved PCM16 into the ring, blocking while it is
//!   full and the device is draining
//! - the stream callback drains the ring without blocking, maps channels,
//!   and converts to the device sample format; underruns are filled with
//!   silence
//! - the playback head counts frames the callback actually consumed, which
//!   is what the pipeline's clock reads

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};

use crate::error::SinkError;
use crate::media::{AudioSink, PcmEncoding, SinkFactory, SinkSpec};

enum StreamCommand {
    Play,
    Pause,
    Release,
}

struct Ring {
    queue: VecDeque<i16>,
    released: bool,
}

struct SinkShared {
    ring: Mutex<Ring>,
    cv: Condvar,
    capacity_samples: usize,
    src_channels: usize,
    head_frames: AtomicU64,
    playing: AtomicBool,
    paused: AtomicBool,
    stopped: AtomicBool,
}

impl SinkShared {
    fn new(capacity_samples: usize, src_channels: usize) -> Self {
        Self {
            ring: Mutex::new(Ring {
                queue: VecDeque::new(),
                released: false,
            }),
            cv: Condvar::new(),
            capacity_samples: capacity_samples.max(src_channels),
            src_channels,
            head_frames: AtomicU64::new(0),
            playing: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Push interleaved samples, blocking while the ring is full and the
    /// device is draining. Returns the number of samples accepted.
    fn push_blocking(&self, samples: &[i16]) -> usize {
        let mut offset = 0;
        while offset < samples.len() {
            let mut ring = self.ring.lock().unwrap();
            while ring.queue.len() >= self.capacity_samples
                && !ring.released
                && !self.stopped.load(Ordering::Relaxed)
            {
                ring = self.cv.wait(ring).unwrap();
            }
            if ring.released || self.stopped.load(Ordering::Relaxed) {
                return offset;
            }
            while offset < samples.len() && ring.queue.len() < self.capacity_samples {
                ring.queue.push_back(samples[offset]);
                offset += 1;
            }
            drop(ring);
            self.cv.notify_all();
        }
        offset
    }

    fn clear(&self) {
        let mut ring = self.ring.lock().unwrap();
        ring.queue.clear();
        drop(ring);
        self.cv.notify_all();
    }

    fn mark_released(&self) {
        let mut ring = self.ring.lock().unwrap();
        ring.released = true;
        drop(ring);
        self.cv.notify_all();
    }
}

/// CPAL implementation of the output sink abstraction.
pub struct CpalSink {
    device_name: Option<String>,
    shared: Option<Arc<SinkShared>>,
    ctrl_tx: Option<Sender<StreamCommand>>,
    stream_thread: Option<JoinHandle<()>>,
}

impl CpalSink {
    /// `device_name`: case-insensitive substring match against output device
    /// descriptions; `None` selects the host default.
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            shared: None,
            ctrl_tx: None,
            stream_thread: None,
        }
    }

    fn send(&self, cmd: StreamCommand) {
        if let Some(tx) = self.ctrl_tx.as_ref() {
            let _ = tx.send(cmd);
        }
    }
}

impl AudioSink for CpalSink {
    fn min_buffer_size(&self, sample_rate: u32, channel_count: u16, _encoding: PcmEncoding) -> usize {
        // 20 ms floor keeps the figure sane when the device reports nothing.
        let floor_frames = (sample_rate / 50).max(1);
        let frames = cpal::default_host()
            .default_output_device()
            .and_then(|d| d.default_output_config().ok())
            .map(|cfg| match cfg.buffer_size() {
                cpal::SupportedBufferSize::Range { min, .. } => (*min).max(floor_frames),
                cpal::SupportedBufferSize::Unknown => sample_rate / 20,
            })
            .unwrap_or(sample_rate / 20);
        frames as usize * channel_count as usize * 2
    }

    fn create(&mut self, spec: &SinkSpec) -> Result<(), SinkError> {
        self.release();

        let capacity_samples = (spec.buffer_bytes / 2).max(spec.channel_count as usize);
        let shared = Arc::new(SinkShared::new(
            capacity_samples,
            spec.channel_count as usize,
        ));

        let (ctrl_tx, ctrl_rx) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let thread_shared = shared.clone();
        let device_name = self.device_name.clone();
        let thread_spec = spec.clone();
        let handle = std::thread::spawn(move || {
            stream_thread_main(device_name, thread_spec, thread_shared, ctrl_rx, ready_tx);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.shared = Some(shared);
                self.ctrl_tx = Some(ctrl_tx);
                self.stream_thread = Some(handle);
                tracing::info!(
                    sample_rate = spec.sample_rate,
                    channels = spec.channel_count,
                    buffer_bytes = spec.buffer_bytes,
                    "output device created"
                );
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(SinkError::Backend(e))
            }
            Err(_) => {
                let _ = handle.join();
                Err(SinkError::Unavailable(
                    "output stream thread died during setup".to_string(),
                ))
            }
        }
    }

    fn play(&mut self) {
        if let Some(shared) = self.shared.as_ref() {
            shared.stopped.store(false, Ordering::Relaxed);
            shared.paused.store(false, Ordering::Relaxed);
            shared.playing.store(true, Ordering::Relaxed);
        }
        self.send(StreamCommand::Play);
    }

    fn pause(&mut self) {
        if let Some(shared) = self.shared.as_ref() {
            shared.paused.store(true, Ordering::Relaxed);
        }
        self.send(StreamCommand::Pause);
    }

    fn stop(&mut self) {
        if let Some(shared) = self.shared.as_ref() {
            shared.playing.store(false, Ordering::Relaxed);
            shared.stopped.store(true, Ordering::Relaxed);
            // Wake writers blocked on a full ring.
            shared.cv.notify_all();
        }
        self.send(StreamCommand::Pause);
    }

    fn flush(&mut self) {
        if let Some(shared) = self.shared.as_ref() {
            shared.clear();
        }
    }

    fn release(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.mark_released();
        }
        self.send(StreamCommand::Release);
        self.ctrl_tx = None;
        if let Some(handle) = self.stream_thread.take() {
            let _ = handle.join();
        }
    }

    fn write(&mut self, data: &[u8]) -> usize {
        let Some(shared) = self.shared.as_ref() else {
            return 0;
        };
        let samples = bytes_to_samples(data);
        let pushed = shared.push_blocking(&samples);
        pushed / shared.src_channels
    }

    fn playback_head_position(&self) -> u64 {
        self.shared
            .as_ref()
            .map(|s| s.head_frames.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.release();
    }
}

/// Builds a [`CpalSink`] per pipeline instance.
pub struct CpalSinkFactory {
    device_name: Option<String>,
}

impl CpalSinkFactory {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

impl SinkFactory for CpalSinkFactory {
    fn new_sink(&self) -> Result<Box<dyn AudioSink>, SinkError> {
        Ok(Box::new(CpalSink::new(self.device_name.clone())))
    }
}

fn stream_thread_main(
    device_name: Option<String>,
    spec: SinkSpec,
    shared: Arc<SinkShared>,
    ctrl_rx: Receiver<StreamCommand>,
    ready_tx: Sender<Result<()>>,
) {
    let stream = match build_stream(device_name.as_deref(), &spec, &shared) {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    while let Ok(cmd) = ctrl_rx.recv() {
        match cmd {
            StreamCommand::Play => {
                if let Err(e) = stream.play() {
                    tracing::warn!(error = %e, "stream play failed");
                }
            }
            StreamCommand::Pause => {
                if let Err(e) = stream.pause() {
                    tracing::warn!(error = %e, "stream pause failed");
                }
            }
            StreamCommand::Release => break,
        }
    }
    drop(stream);
    tracing::debug!("output stream thread ending");
}

fn build_stream(
    device_name: Option<&str>,
    spec: &SinkSpec,
    shared: &Arc<SinkShared>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = pick_device(&host, device_name)?;

    let config = pick_output_config(&device, spec)?;
    let sample_format = config.sample_format();
    let mut stream_config: cpal::StreamConfig = config.into();
    // Keep the device-side queue modest; our own ring does the buffering.
    stream_config.buffer_size = cpal::BufferSize::Default;

    match sample_format {
        cpal::SampleFormat::F32 => build_stream_typed::<f32>(&device, &stream_config, shared),
        cpal::SampleFormat::I16 => build_stream_typed::<i16>(&device, &stream_config, shared),
        cpal::SampleFormat::I32 => build_stream_typed::<i32>(&device, &stream_config, shared),
        cpal::SampleFormat::U16 => build_stream_typed::<u16>(&device, &stream_config, shared),
        other => Err(anyhow!("unsupported sample format: {other:?}")),
    }
}

fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let mut devices: Vec<cpal::Device> =
            host.output_devices().context("no output devices")?.collect();
        if let Some(device) = devices.drain(..).find(|d| {
            d.description()
                .ok()
                .map(|desc| matches_device_name(&desc.to_string(), needle))
                .unwrap_or(false)
        }) {
            return Ok(device);
        }
        return Err(anyhow!("no output device matched: {needle}"));
    }
    host.default_output_device()
        .ok_or_else(|| anyhow!("no default output device"))
}

fn pick_output_config(device: &cpal::Device, spec: &SinkSpec) -> Result<cpal::SupportedStreamConfig> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = device
        .supported_output_configs()
        .context("no supported output configs")?
        .collect();
    if ranges.is_empty() {
        return Err(anyhow!("no supported output configs"));
    }

    // Prefer a matching channel count; otherwise take anything and map.
    let mut best: Option<(bool, cpal::SupportedStreamConfigRange)> = None;
    for range in ranges {
        let channels_match = range.channels() == spec.channel_count;
        let replace = match &best {
            None => true,
            Some((best_match, _)) => channels_match && !best_match,
        };
        if replace {
            best = Some((channels_match, range));
        }
    }
    let (_, range) = best.ok_or_else(|| anyhow!("no usable output config"))?;
    let rate = clamp_rate(
        range.min_sample_rate(),
        range.max_sample_rate(),
        spec.sample_rate,
    );
    Ok(range.with_sample_rate(rate))
}

fn clamp_rate(min: u32, max: u32, target: u32) -> u32 {
    if target < min {
        min
    } else if target > max {
        max
    } else {
        target
    }
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    shared: &Arc<SinkShared>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = config.channels as usize;
    let shared = shared.clone();
    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let silence = <T as cpal::Sample>::from_sample::<f32>(0.0);
            if !shared.playing.load(Ordering::Relaxed)
                || shared.paused.load(Ordering::Relaxed)
                || shared.stopped.load(Ordering::Relaxed)
            {
                data.fill(silence);
                return;
            }

            let src_channels = shared.src_channels;
            let frames_wanted = data.len() / channels_out.max(1);
            let mut consumed_frames = 0u64;
            {
                let mut ring = shared.ring.lock().unwrap();
                for frame in 0..frames_wanted {
                    if ring.queue.len() < src_channels {
                        // Underrun: pad the rest with silence.
                        for idx in (frame * channels_out)..data.len() {
                            data[idx] = silence;
                        }
                        break;
                    }
                    let mut src = [0f32; 8];
                    for ch in 0..src_channels.min(8) {
                        src[ch] = ring.queue.pop_front().unwrap_or(0) as f32 / 32_768.0;
                    }
                    for _ in src_channels.min(8)..src_channels {
                        ring.queue.pop_front();
                    }
                    for ch in 0..channels_out {
                        let sample = map_channel(&src, src_channels, channels_out, ch);
                        data[frame * channels_out + ch] =
                            <T as cpal::Sample>::from_sample::<f32>(sample);
                    }
                    consumed_frames += 1;
                }
            }
            if consumed_frames > 0 {
                shared.head_frames.fetch_add(consumed_frames, Ordering::Relaxed);
                shared.cv.notify_all();
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

/// Basic channel mapping: mono is duplicated, stereo is averaged down,
/// anything else clamps to the available channels.
fn map_channel(src: &[f32; 8], src_channels: usize, dst_channels: usize, dst_ch: usize) -> f32 {
    match (src_channels, dst_channels) {
        (1, _) => src[0],
        (2, 1) => 0.5 * (src[0] + src[1]),
        (2, _) => src[dst_ch.min(1)],
        _ => src[dst_ch.min(src_channels.saturating_sub(1).min(7))],
    }
}

fn bytes_to_samples(data: &[u8]) -> Vec<i16> {
    data.chunks(2)
        .map(|pair| i16::from_le_bytes([pair[0], *pair.get(1).unwrap_or(&0)]))
        .collect()
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}
