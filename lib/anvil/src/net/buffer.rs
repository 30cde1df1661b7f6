//! A byte FIFO fed from a non-blocking reader and drained by a parser.
//! Appended at the tail, consumed from the head; the head is compacted away
//! once it grows large so the backing allocation stays bounded.

use std::io;

const COMPACT_THRESHOLD: usize = 16 * 1024;
const READ_CHUNK: usize = 8 * 1024;

/// Outcome of one `ingress` drain.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Ingress {
    /// Bytes pulled off the reader.
    pub received: usize,
    /// The reader reported end of stream.
    pub closed: bool,
}

pub struct Buffer {
    data: Vec<u8>,
    head: usize,
}

impl Buffer {
    #[inline]
    pub fn new() -> Buffer {
        Buffer {
            data: Vec::new(),
            head: 0,
        }
    }

    /// Bytes available to read.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slice containing the buffered data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    /// Appends raw bytes at the tail.
    #[inline]
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Discards `count` bytes from the head.
    pub fn consume(&mut self, count: usize) {
        assert!(count <= self.len(), "consuming past buffered data");
        self.head += count;

        if self.head == self.data.len() {
            self.data.clear();
            self.head = 0;
        } else if self.head >= COMPACT_THRESHOLD {
            self.data.drain(..self.head);
            self.head = 0;
        }
    }

    /// Removes and returns everything buffered.
    pub fn take_all(&mut self) -> Vec<u8> {
        let bytes = self.read_slice().to_vec();
        self.data.clear();
        self.head = 0;
        bytes
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    /// Pulls everything currently readable off a non-blocking reader.
    /// Returns once the reader would block or reports end of stream.
    pub fn ingress<R: io::Read>(&mut self, reader: &mut R) -> io::Result<Ingress> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut received = 0;

        loop {
            match reader.read(&mut chunk) {
                Ok(0) => return Ok(Ingress { received, closed: true }),
                Ok(count) => {
                    self.append(&chunk[..count]);
                    received += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Ingress { received, closed: false })
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }
}
