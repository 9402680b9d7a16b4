//! Fixed-capacity PCM staging buffer.
//!
//! Batches many small decoder frames into few device writes. The buffer is
//! exclusively owned by the audio pipeline and reallocated whenever the
//! format changes or the pipeline is restarted.

/// Owned byte buffer with explicit capacity and flush-on-overflow append.
#[derive(Debug)]
pub struct PcmStagingBuffer {
    buf: Vec<u8>,
    len: usize,
}

impl PcmStagingBuffer {
    /// Create a buffer of exactly `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append one decoded frame, emitting the accumulated contents first when
    /// the frame would overflow.
    ///
    /// Frames larger than the whole buffer are emitted directly; the 8x
    /// margin over the device minimum makes that case unreachable in normal
    /// operation.
    pub fn append(&mut self, bytes: &[u8], mut emit: impl FnMut(&[u8])) {
        if bytes.len() >= self.buf.len() {
            self.flush(&mut emit);
            emit(bytes);
            return;
        }
        if self.len + bytes.len() > self.buf.len() {
            self.flush(&mut emit);
        }
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
    }

    /// Emit the accumulated contents, if any, and reset the write offset.
    pub fn flush(&mut self, mut emit: impl FnMut(&[u8])) {
        if self.len > 0 {
            emit(&self.buf[..self.len]);
            self.len = 0;
        }
    }

    /// Drop accumulated contents without emitting them.
    pub fn clear(&mut self) {
        self.len = 0;
    }
}
