//! AAC decoder adapter on Symphonia.
//!
//! Adapts Symphonia's packet decoder to the fill/decode-frame contract the
//! pipeline consumes: queued access-units go in, interleaved PCM16 frames
//! come out. One AAC access-unit decodes to exactly one PCM frame.

use std::collections::VecDeque;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_AAC, CodecParameters, Decoder, DecoderOptions};
use symphonia::core::formats::Packet;

use crate::error::DecodeError;
use crate::media::{AudioDecoder, DecoderFactory, StreamInfo};

/// Symphonia-backed [`AudioDecoder`] for AAC elementary streams.
pub struct SymphoniaAacDecoder {
    decoder: Option<Box<dyn Decoder>>,
    pending: VecDeque<Vec<u8>>,
    info: StreamInfo,
}

impl SymphoniaAacDecoder {
    pub fn new() -> Self {
        Self {
            decoder: None,
            pending: VecDeque::new(),
            info: StreamInfo::default(),
        }
    }
}

impl Default for SymphoniaAacDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDecoder for SymphoniaAacDecoder {
    fn configure(&mut self, codec_config: &[u8]) -> Result<(), DecodeError> {
        let mut params = CodecParameters::new();
        params
            .for_codec(CODEC_TYPE_AAC)
            .with_extra_data(codec_config.to_vec().into_boxed_slice());

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| DecodeError::Fatal(format!("codec setup rejected: {e}")))?;

        tracing::debug!(config_bytes = codec_config.len(), "aac decoder configured");
        self.decoder = Some(decoder);
        self.pending.clear();
        Ok(())
    }

    fn fill(&mut self, data: &[u8]) -> Result<usize, DecodeError> {
        self.pending.push_back(data.to_vec());
        Ok(data.len())
    }

    fn decode_frame(&mut self) -> Result<Vec<i16>, DecodeError> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Err(DecodeError::Fatal("decoder not configured".to_string()));
        };
        let Some(chunk) = self.pending.pop_front() else {
            return Err(DecodeError::NeedMoreInput);
        };

        let packet = Packet::new_from_boxed_slice(0, 0, 0, chunk.into_boxed_slice());
        let decoded = decoder
            .decode(&packet)
            .map_err(|e| DecodeError::Fatal(format!("aac decode failed: {e}")))?;

        let spec = *decoded.spec();
        let frames = decoded.frames();
        let mut samples = SampleBuffer::<i16>::new(frames as u64, spec);
        samples.copy_interleaved_ref(decoded);

        self.info = StreamInfo {
            frame_size: frames,
            channel_count: spec.channels.count(),
        };
        Ok(samples.samples().to_vec())
    }

    fn stream_info(&self) -> StreamInfo {
        self.info
    }
}

/// Hands the pipeline a fresh [`SymphoniaAacDecoder`] per start.
#[derive(Debug, Default)]
pub struct SymphoniaDecoderFactory;

impl DecoderFactory for SymphoniaDecoderFactory {
    fn new_decoder(&self) -> Box<dyn crate::media::AudioDecoder> {
        Box::new(SymphoniaAacDecoder::new())
    }
}
