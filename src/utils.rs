use std::io;
use std::os::fd::RawFd;

/// Scatter-read from `fd` into `primary` then `overflow` with a single `readv(2)`
///
/// Returns the total number of bytes placed across both regions. The kernel fills
/// `primary` completely before touching `overflow`, so callers can split the count
/// at `primary.len()`.
///
/// # Errors
///
/// Returns the OS error captured from `errno` when the call fails. No retry is
/// attempted, including on `EINTR` and `EAGAIN`.
#[inline]
pub(crate) fn readv2(fd: RawFd, primary: &mut [u8], overflow: &mut [u8]) -> io::Result<usize> {
    let iov = [
        libc::iovec {
            iov_base: primary.as_mut_ptr().cast(),
            iov_len: primary.len(),
        },
        libc::iovec {
            iov_base: overflow.as_mut_ptr().cast(),
            iov_len: overflow.len(),
        },
    ];

    // SAFETY: both iovecs point into live, exclusively borrowed slices whose lengths
    // match iov_len, and they stay borrowed until readv returns.
    let n = unsafe { libc::readv(fd, iov.as_ptr(), iov.len() as libc::c_int) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Write `data` to `fd` with a single `write(2)`
///
/// Partial writes are reported as-is; looping is the caller's job.
#[inline]
pub(crate) fn write_once(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    // SAFETY: data is a valid readable slice for data.len() bytes.
    let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Thread count used when the system cannot report its parallelism
pub(crate) const FALLBACK_NUM_THREADS: usize = 8;

/// Number of CPUs available to this process
#[inline]
pub(crate) fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZero::get)
        .unwrap_or(FALLBACK_NUM_THREADS)
}
