//! Bounded FIFO of processed samples between the scan thread and readers.

use std::fmt;

/// A write was refused because it would overflow unread data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overrun {
    pub attempted: usize,
    pub free: usize,
}

impl fmt::Display for Overrun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "buffer overrun: {} samples offered, {} free",
            self.attempted, self.free
        )
    }
}

impl std::error::Error for Overrun {}

/// Fixed-size circular buffer.
///
/// Writes never overwrite unread samples: a write that does not fit is
/// rejected whole, so everything already buffered stays readable.
#[derive(Debug)]
pub struct RingBuffer {
    data: Vec<f64>,
    write_index: usize,
    read_index: usize,
    depth: usize,
}

impl RingBuffer {
    /// Allocate `len` samples. Fails instead of aborting when memory is short.
    pub fn try_new(len: usize) -> Option<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(len).ok()?;
        data.resize(len, 0.0);
        Some(Self {
            data,
            write_index: 0,
            read_index: 0,
            depth: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_empty(&self) -> bool {
        self.depth == 0
    }

    /// Samples that can be written before the write index wraps.
    pub fn contiguous_write_space(&self) -> usize {
        self.data.len() - self.write_index
    }

    pub fn write(&mut self, samples: &[f64]) -> Result<(), Overrun> {
        let len = self.data.len();
        let free = len - self.depth;
        if samples.len() > free {
            return Err(Overrun {
                attempted: samples.len(),
                free,
            });
        }
        let first = samples.len().min(len - self.write_index);
        self.data[self.write_index..self.write_index + first].copy_from_slice(&samples[..first]);
        let rest = samples.len() - first;
        self.data[..rest].copy_from_slice(&samples[first..]);

        self.write_index = (self.write_index + samples.len()) % len.max(1);
        self.depth += samples.len();
        Ok(())
    }

    /// Move up to `dest.len()` samples out, oldest first.
    pub fn read(&mut self, dest: &mut [f64]) -> usize {
        let len = self.data.len();
        let count = dest.len().min(self.depth);
        if count == 0 {
            return 0;
        }
        let first = count.min(len - self.read_index);
        dest[..first].copy_from_slice(&self.data[self.read_index..self.read_index + first]);
        let rest = count - first;
        dest[first..count].copy_from_slice(&self.data[..rest]);

        self.read_index = (self.read_index + count) % len;
        self.depth -= count;
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(start: usize, n: usize) -> Vec<f64> {
        (start..start + n).map(|v| v as f64).collect()
    }

    #[test]
    fn reads_back_in_fifo_order() {
        let mut ring = RingBuffer::try_new(8).unwrap();
        ring.write(&seq(0, 5)).unwrap();
        let mut out = [0.0; 5];
        assert_eq!(ring.read(&mut out), 5);
        assert_eq!(out.to_vec(), seq(0, 5));
        assert!(ring.is_empty());
    }

    #[test]
    fn wraparound_preserves_order() {
        let mut ring = RingBuffer::try_new(8).unwrap();
        let mut out = vec![0.0; 8];
        let mut next = 0;
        let mut expected = 0;
        for chunk in [5, 6, 7, 3, 8] {
            ring.write(&seq(next, chunk)).unwrap();
            next += chunk;
            let n = ring.read(&mut out[..chunk]);
            assert_eq!(n, chunk);
            assert_eq!(out[..n].to_vec(), seq(expected, n));
            expected += n;
        }
    }

    #[test]
    fn overflowing_write_is_rejected_whole() {
        let mut ring = RingBuffer::try_new(4).unwrap();
        ring.write(&seq(0, 3)).unwrap();
        assert_eq!(
            ring.write(&seq(3, 2)),
            Err(Overrun {
                attempted: 2,
                free: 1
            })
        );
        assert_eq!(ring.depth(), 3);
        let mut out = [0.0; 4];
        assert_eq!(ring.read(&mut out), 3);
        assert_eq!(out[..3].to_vec(), seq(0, 3));
    }

    #[test]
    fn full_buffer_accepts_exactly_capacity() {
        let mut ring = RingBuffer::try_new(6).unwrap();
        ring.write(&seq(0, 6)).unwrap();
        assert_eq!(ring.depth(), ring.capacity());
        assert!(ring.write(&[1.0]).is_err());
    }

    #[test]
    fn contiguous_space_shrinks_until_wrap() {
        let mut ring = RingBuffer::try_new(10).unwrap();
        assert_eq!(ring.contiguous_write_space(), 10);
        ring.write(&seq(0, 7)).unwrap();
        assert_eq!(ring.contiguous_write_space(), 3);
        ring.write(&seq(7, 3)).unwrap();
        assert_eq!(ring.contiguous_write_space(), 10);
    }

    #[test]
    fn partial_read_leaves_the_rest() {
        let mut ring = RingBuffer::try_new(10).unwrap();
        ring.write(&seq(0, 6)).unwrap();
        let mut out = [0.0; 4];
        assert_eq!(ring.read(&mut out), 4);
        assert_eq!(ring.depth(), 2);
        assert_eq!(ring.read(&mut out), 2);
        assert_eq!(out[..2].to_vec(), seq(4, 2));
    }
}
