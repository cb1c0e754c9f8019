//! Send buffer

use super::Error;

/// Capacity of the send buffer, in bytes
pub const CAPACITY: usize = 128;

/// Fixed-capacity circular buffer of sent but unacknowledged bytes
///
/// The first byte of the ring is the byte at sequence number `SND.UNA`.
pub struct Ring {
    storage: [u8; CAPACITY],
    /// Index of the oldest byte
    read: usize,
    len: usize,
}

impl Ring {
    /// Creates an empty ring
    pub fn new() -> Self {
        Ring {
            storage: [0; CAPACITY],
            read: 0,
            len: 0,
        }
    }

    /// Number of buffered bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if there are no buffered bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Free space
    pub fn window(&self) -> usize {
        CAPACITY - self.len
    }

    /// Appends all of `data`, or nothing if it doesn't fit
    pub fn enqueue(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.len() > self.window() {
            return Err(Error::BufferFull);
        }

        let write = (self.read + self.len) % CAPACITY;
        let head = (CAPACITY - write).min(data.len());
        self.storage[write..write + head].copy_from_slice(&data[..head]);
        self.storage[..data.len() - head].copy_from_slice(&data[head..]);
        self.len += data.len();

        Ok(())
    }

    /// Drops the `n` oldest bytes
    pub fn release(&mut self, n: usize) {
        let n = n.min(self.len);

        self.read = (self.read + n) % CAPACITY;
        self.len -= n;
    }

    /// Copies bytes, starting `offset` bytes past the oldest one, into `buffer`
    ///
    /// Returns the number of bytes copied
    pub fn peek(&self, offset: usize, buffer: &mut [u8]) -> usize {
        if offset >= self.len {
            return 0;
        }

        let n = buffer.len().min(self.len - offset);
        let start = (self.read + offset) % CAPACITY;
        let head = (CAPACITY - start).min(n);
        buffer[..head].copy_from_slice(&self.storage[start..start + head]);
        buffer[head..n].copy_from_slice(&self.storage[..n - head]);

        n
    }

    /// Drops all the buffered bytes
    pub fn clear(&mut self) {
        self.read = 0;
        self.len = 0;
    }
}

impl Default for Ring {
    fn default() -> Self {
        Ring::new()
    }
}
