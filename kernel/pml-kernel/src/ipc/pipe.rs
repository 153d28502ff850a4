//! Anonymous pipes.
//!
//! One reader, one writer, one heap buffer with start/end cursors. When
//! either side goes away the pipe is widowed: reads drain to EOF, writes
//! queue `SIGPIPE` at the writer and fail with `EPIPE`.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use pml_core::sync::SpinLock;
use pml_core::{Errno, Result};
use pml_fs::vnode::{Vnode, VnodeOps};

use crate::proc::signal::{self, SigInfo, SIGPIPE};
use crate::proc::{sched_yield, try_with_current};

/// Pipe buffer size (eight pages).
pub const PIPE_SIZE: usize = 8 * 4096;

/// Inode number reported by the read end.
const READ_INO: u64 = 0;
/// Inode number reported by the write end.
const WRITE_INO: u64 = 1;

struct PipeBuf {
    data: Vec<u8>,
    /// Index of the next byte to read.
    start: usize,
    /// Index of the next byte to write.
    end: usize,
    /// Whether one side has gone away.
    widowed: bool,
}

struct PipeShared {
    buf: SpinLock<PipeBuf>,
}

/// One end of a pipe; both ends share the buffer.
struct PipeEnd {
    shared: Arc<PipeShared>,
    readable: bool,
}

impl VnodeOps for PipeEnd {
    fn read(&self, _vp: &Vnode, out: &mut [u8], _offset: u64) -> Result<usize> {
        if !self.readable {
            return Err(Errno::EBADF);
        }
        loop {
            {
                let mut buf = self.shared.buf.lock();
                if buf.start != buf.end {
                    let avail = buf.end - buf.start;
                    let take = out.len().min(avail);
                    let start = buf.start;
                    out[..take].copy_from_slice(&buf.data[start..start + take]);
                    if take == avail {
                        buf.start = 0;
                        buf.end = 0;
                    } else {
                        buf.start += take;
                    }
                    return Ok(take);
                }
                if buf.widowed {
                    return Ok(0);
                }
            }
            sched_yield();
        }
    }

    fn write(&self, _vp: &Vnode, data: &[u8], _offset: u64) -> Result<usize> {
        if self.readable {
            return Err(Errno::EBADF);
        }
        if data.len() > PIPE_SIZE {
            return Err(Errno::ENOSPC);
        }
        loop {
            {
                let mut buf = self.shared.buf.lock();
                if buf.widowed {
                    // Nobody will ever read this; tell the writer.
                    let _ = try_with_current(|p| {
                        let info = SigInfo {
                            signo: SIGPIPE,
                            errno: Errno::EPIPE.code(),
                            pid: p.pid,
                            uid: p.uid,
                            code: 0,
                        };
                        signal::send_signal(p, SIGPIPE, info);
                    });
                    return Err(Errno::EPIPE);
                }
                if PIPE_SIZE - buf.end < data.len() && buf.start > 0 {
                    // Compact the buffer to make the tail contiguous.
                    let (start, end) = (buf.start, buf.end);
                    buf.data.copy_within(start..end, 0);
                    buf.end = end - start;
                    buf.start = 0;
                }
                if PIPE_SIZE - buf.end >= data.len() {
                    let end = buf.end;
                    buf.data[end..end + data.len()].copy_from_slice(data);
                    buf.end += data.len();
                    return Ok(data.len());
                }
            }
            sched_yield();
        }
    }

    fn dealloc(&self, _vp: &Vnode) {
        let mut buf = self.shared.buf.lock();
        buf.widowed = true;
    }
}

/// Creates a pipe, returning `(read end, write end)` vnodes.
pub fn make_pipe() -> (Arc<Vnode>, Arc<Vnode>) {
    let shared = Arc::new(PipeShared {
        buf: SpinLock::new(PipeBuf {
            data: vec![0u8; PIPE_SIZE],
            start: 0,
            end: 0,
            widowed: false,
        }),
    });
    let read_end = Vnode::new(
        READ_INO,
        Box::new(PipeEnd {
            shared: shared.clone(),
            readable: true,
        }),
        None,
    );
    read_end.attr.lock().mode = pml_fs::mode::S_IFIFO | 0o400;
    let write_end = Vnode::new(
        WRITE_INO,
        Box::new(PipeEnd {
            shared,
            readable: false,
        }),
        None,
    );
    write_end.attr.lock().mode = pml_fs::mode::S_IFIFO | 0o200;
    (read_end, write_end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::testhooks::fresh_system;

    #[test]
    fn write_then_read() {
        let _sys = fresh_system();
        let (r, w) = make_pipe();
        assert_eq!(w.ops.write(&w, b"ping", 0).unwrap(), 4);
        let mut buf = [0u8; 8];
        assert_eq!(r.ops.read(&r, &mut buf, 0).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
    }

    #[test]
    fn wrong_direction_is_ebadf() {
        let _sys = fresh_system();
        let (r, w) = make_pipe();
        let mut buf = [0u8; 4];
        assert_eq!(w.ops.read(&w, &mut buf, 0).unwrap_err(), Errno::EBADF);
        assert_eq!(r.ops.write(&r, b"x", 0).unwrap_err(), Errno::EBADF);
    }

    #[test]
    fn widowed_read_is_eof_write_is_epipe() {
        let _sys = fresh_system();
        let (r, w) = make_pipe();
        w.ops.write(&w, b"last", 0).unwrap();
        drop(w);
        // Buffered data still drains, then EOF.
        let mut buf = [0u8; 8];
        assert_eq!(r.ops.read(&r, &mut buf, 0).unwrap(), 4);
        assert_eq!(r.ops.read(&r, &mut buf, 0).unwrap(), 0);

        let (r2, w2) = make_pipe();
        drop(r2);
        assert_eq!(w2.ops.write(&w2, b"x", 0).unwrap_err(), Errno::EPIPE);
        // The writer got a SIGPIPE queued.
        crate::proc::with_current(|p| {
            assert_ne!(p.threads.queue[0].sigpending & (1 << SIGPIPE), 0);
        });
    }

    #[test]
    fn oversized_write_is_enospc() {
        let _sys = fresh_system();
        let (_r, w) = make_pipe();
        let big = vec![0u8; PIPE_SIZE + 1];
        assert_eq!(w.ops.write(&w, &big, 0).unwrap_err(), Errno::ENOSPC);
    }
}
