//! Newline splitting with a buffered trailing partial line.

/// Splits a byte stream into complete lines, buffering any unterminated tail.
#[derive(Debug, Default, Clone)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    /// Creates an empty splitter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every line it completes.
    ///
    /// Lines are returned without their `\n`. Invalid UTF-8 is replaced with
    /// U+FFFD.
    pub fn extract(&mut self, chunk: &[u8]) -> Vec<String> {
        let Some(last_newline) = chunk.iter().rposition(|&b| b == b'\n') else {
            self.pending.extend_from_slice(chunk);
            return Vec::new();
        };

        let mut complete = std::mem::take(&mut self.pending);
        complete.extend_from_slice(&chunk[..last_newline]);
        self.pending.extend_from_slice(&chunk[last_newline + 1..]);

        complete
            .split(|&b| b == b'\n')
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect()
    }

    /// Number of bytes held in the unterminated tail.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Removes and returns the unterminated tail, if any.
    pub fn take_pending(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let pending = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&pending).into_owned())
    }

    /// Discards the unterminated tail.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
