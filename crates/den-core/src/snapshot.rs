//! Rolling tail buffer for terminal snapshots.
//!
//! Keeps the most recent window of output: appends grow the buffer up to a
//! cap, then it is trimmed back to a retained tail. The lobby only ever
//! displays the tail, so this is cheaper than a true ring buffer.

#[derive(Debug, Clone)]
pub struct RollingBuffer {
    buf: Vec<u8>,
    cap: usize,
    retain: usize,
}

impl RollingBuffer {
    /// `cap` is the growth limit, `retain` the tail kept after trimming.
    pub fn new(cap: usize, retain: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap,
            retain: retain.min(cap),
        }
    }

    /// Append a chunk, trimming to the retained tail once the cap is passed.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > self.cap {
            let cut = self.buf.len() - self.retain;
            self.buf.drain(..cut);
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Lossy UTF-8 view for JSON transport.
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
