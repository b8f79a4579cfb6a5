//! Growable byte buffer with separate read and write cursors
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! |   (reclaimable)   |    (content)     |                  |
//! +-------------------+------------------+------------------+
//! 0      <=      read_pos     <=     write_pos    <=    capacity
//! ```
//!
//! Appends land after `write_pos`; consumers advance `read_pos`. When the tail runs
//! out of room the buffer first tries to slide the unread bytes back to offset 0,
//! and only reallocates when the reclaimed prefix is not enough.

use std::fmt;
use std::io;
use std::os::fd::AsRawFd;

use crate::utils::{readv2, write_once};

/// Initial capacity of [`Buffer::new`]
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Size of the stack overflow area used by [`Buffer::read_fd`]
pub const EXTRA_READ_SIZE: usize = 65535;

/// Per-connection byte accumulator
///
/// `Buffer` is owned by one connection task at a time and performs no locking.
/// Wrap it externally if it has to be shared.
///
/// # Examples
///
/// ```
/// use ferrypool::Buffer;
///
/// let mut buf = Buffer::new();
/// buf.append(b"GET / HTTP/1.1\r\n");
/// let line_end = buf.find(b"\r\n").unwrap();
/// assert_eq!(&buf.peek()[..line_end], b"GET / HTTP/1.1");
/// buf.retrieve_until(line_end + 2);
/// assert_eq!(buf.readable_bytes(), 0);
/// ```
#[derive(Clone)]
pub struct Buffer {
    storage: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    /// Create a buffer with the default 1KB capacity
    #[inline]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    /// Create a buffer with `capacity` zeroed bytes of backing storage
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Bytes written but not yet consumed
    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Bytes that can be written without making space
    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.storage.len() - self.write_pos
    }

    /// Bytes already consumed at the front of the storage
    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    /// Total size of the backing storage
    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// The unread region
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.read_pos..self.write_pos]
    }

    /// Position of the first occurrence of `needle` within [`peek`](Self::peek)
    pub fn find(&self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() {
            return Some(0);
        }
        self.peek().windows(needle.len()).position(|window| window == needle)
    }

    /// Consume `len` readable bytes
    ///
    /// # Panics
    ///
    /// Panics if `len > readable_bytes()`.
    #[inline]
    pub fn retrieve(&mut self, len: usize) {
        assert!(
            len <= self.readable_bytes(),
            "retrieve({len}) exceeds readable bytes {}",
            self.readable_bytes()
        );
        self.read_pos += len;
    }

    /// Consume everything before offset `end` of [`peek`](Self::peek)
    ///
    /// # Panics
    ///
    /// Panics if `end` lies past the readable region.
    #[inline]
    pub fn retrieve_until(&mut self, end: usize) {
        self.retrieve(end);
    }

    /// Reset both cursors and zero the storage
    pub fn retrieve_all(&mut self) {
        self.storage.fill(0);
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Take every readable byte as a `String` and reset the buffer
    ///
    /// Invalid UTF-8 sequences are replaced with `U+FFFD`.
    pub fn retrieve_all_to_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    /// Take every readable byte as a `Vec<u8>` and reset the buffer
    pub fn retrieve_all_to_vec(&mut self) -> Vec<u8> {
        let v = self.peek().to_vec();
        self.retrieve_all();
        v
    }

    /// The writable tail, for filling in place before [`has_written`](Self::has_written)
    #[inline]
    pub fn begin_write(&mut self) -> &mut [u8] {
        &mut self.storage[self.write_pos..]
    }

    /// Mark `len` bytes of the writable tail as written
    ///
    /// # Panics
    ///
    /// Panics if `len > writable_bytes()`.
    #[inline]
    pub fn has_written(&mut self, len: usize) {
        assert!(
            len <= self.writable_bytes(),
            "has_written({len}) exceeds writable bytes {}",
            self.writable_bytes()
        );
        self.write_pos += len;
    }

    /// Guarantee at least `len` writable bytes, compacting or growing as needed
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    /// Copy `data` after the readable region
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let start = self.write_pos;
        self.storage[start..start + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    /// Copy the UTF-8 bytes of `s` after the readable region
    #[inline]
    pub fn append_str(&mut self, s: &str) {
        self.append(s.as_bytes());
    }

    /// Copy the unread region of `other`
    #[inline]
    pub fn append_buffer(&mut self, other: &Buffer) {
        self.append(other.peek());
    }

    /// Read from `fd` with one scatter read into the writable tail plus a 64KB stack area
    ///
    /// A single call can therefore return more than the current writable space; the
    /// overflow is appended afterwards, growing the buffer. `Ok(0)` means the peer
    /// closed the stream.
    ///
    /// # Errors
    ///
    /// Returns the OS error (see [`io::Error::raw_os_error`]) on failure. No retry
    /// is attempted, so `WouldBlock` and `Interrupted` surface to the caller.
    pub fn read_fd<F: AsRawFd + ?Sized>(&mut self, fd: &F) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_READ_SIZE];
        let writable = self.writable_bytes();
        let start = self.write_pos;

        let n = readv2(fd.as_raw_fd(), &mut self.storage[start..], &mut extra)?;
        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.storage.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// Write every readable byte to `fd` with one `write(2)`
    ///
    /// The read cursor advances by the bytes the kernel accepted; a short write
    /// leaves the rest readable for the next call.
    ///
    /// # Errors
    ///
    /// Returns the OS error on failure; cursors are untouched in that case.
    pub fn write_fd<F: AsRawFd + ?Sized>(&mut self, fd: &F) -> io::Result<usize> {
        let n = write_once(fd.as_raw_fd(), self.peek())?;
        self.read_pos += n;
        Ok(n)
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len {
            // +1 keeps room for a trailing NUL when handing bytes to C APIs
            self.storage.resize(self.write_pos + len + 1, 0);
        } else {
            let readable = self.readable_bytes();
            self.storage.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
            debug_assert_eq!(readable, self.readable_bytes());
        }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl io::Write for Buffer {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRef<[u8]> for Buffer {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.peek()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("readable", &self.readable_bytes())
            .field("writable", &self.writable_bytes())
            .field("prependable", &self.prependable_bytes())
            .field("capacity", &self.capacity())
            .finish()
    }
}
