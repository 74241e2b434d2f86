use thiserror::Error;

/// Initial buffer capacity
const INITIAL_CAPACITY: usize = 4 * 1024;

/// Reassembly failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The message grew past the configured maximum
    #[error("Message exceeds {max} bytes")]
    TooLarge { max: usize },
}

/// Accumulates message fragments until the final one arrives.
///
/// The buffer doubles when a fragment does not fit; content is never
/// truncated. A message larger than `max_size` is rejected and the partial
/// data discarded so the next message starts clean.
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
    max_size: usize,
}

impl FrameAssembler {
    /// Create an assembler that refuses messages larger than `max_size`
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(INITIAL_CAPACITY.min(max_size)),
            max_size,
        }
    }

    /// Append a fragment. Returns the complete message once `is_final` is set.
    pub fn push(&mut self, fragment: &[u8], is_final: bool) -> Result<Option<Vec<u8>>, FrameError> {
        let needed = self.buffer.len() + fragment.len();
        if needed > self.max_size {
            self.buffer.clear();
            return Err(FrameError::TooLarge { max: self.max_size });
        }

        if needed > self.buffer.capacity() {
            let grown = self.buffer.capacity().max(1).saturating_mul(2).max(needed).min(self.max_size);
            self.buffer.reserve_exact(grown - self.buffer.len());
        }
        self.buffer.extend_from_slice(fragment);

        if !is_final {
            return Ok(None);
        }

        let capacity = self.buffer.capacity();
        let message = std::mem::replace(&mut self.buffer, Vec::with_capacity(capacity));
        Ok(Some(message))
    }

    /// Bytes held for an incomplete message
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial message (used when a connection is replaced)
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_fragment_message() {
        let mut assembler = FrameAssembler::new(1024);
        let message = assembler.push(b"{\"op\":11}", true).unwrap();
        assert_eq!(message.as_deref(), Some(&b"{\"op\":11}"[..]));
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_fragments_grow_buffer_without_truncation() {
        let mut assembler = FrameAssembler::new(1024 * 1024);
        let chunk = vec![b'x'; 3000];

        for _ in 0..10 {
            assert_eq!(assembler.push(&chunk, false).unwrap(), None);
        }
        let message = assembler.push(b"end", true).unwrap().unwrap();
        assert_eq!(message.len(), 30_003);
        assert!(message.ends_with(b"xend"));
    }

    #[test]
    fn test_too_large_resets() {
        let mut assembler = FrameAssembler::new(8);
        assert_eq!(assembler.push(b"12345", false).unwrap(), None);
        assert_eq!(
            assembler.push(b"6789", true),
            Err(FrameError::TooLarge { max: 8 })
        );
        assert_eq!(assembler.pending(), 0);

        // Next message is unaffected
        assert_eq!(assembler.push(b"ok", true).unwrap().as_deref(), Some(&b"ok"[..]));
    }
}
