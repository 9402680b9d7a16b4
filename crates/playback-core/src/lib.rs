//! Playback synchronization core for segmented, adaptive-bitrate streams.
//!
//! Audio is the timing master: the [`pipeline::AudioPipeline`] decodes
//! compressed access-units, feeds PCM to an output sink, and derives the
//! playback clock from the sink's hardware position. The
//! [`controller::PlayerController`] pumps video frames against that clock and
//! presents, holds, or drops each one based on drift.
//!
//! Container demuxing, segment fetching, pixel rendering, and the concrete
//! output device are collaborators injected through the traits in [`media`].

pub mod config;
pub mod controller;
pub mod decoder_symphonia;
pub mod error;
pub mod gate;
pub mod media;
pub mod pipeline;
pub mod segment;
pub mod sink_cpal;
pub mod staging;
pub mod sync;
pub mod testing;
