//! Bounded per-sink write queue, draining via a single vectored write per
//! event-loop pass. Grounded on `lw.c`, with the partial-write accounting
//! corrected: a write that lands in the middle of one entry keeps that
//! entry's unsent tail at the head of the queue instead of dropping it
//! (see SPEC_FULL.md S9 for the defect this replaces).

use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;

use nix::sys::uio::IoSlice;

use crate::buf::{DynBuf, SlabArena};

pub const HIGH_WATERMARK: usize = 32;

#[derive(Debug, snafu::Snafu)]
pub enum WriteQueueError {
    #[snafu(display("write queue high watermark reached, dropping line"))]
    Overflow,
}

pub struct WriteQueue {
    lines: VecDeque<DynBuf>,
    high_watermark: usize,
}

impl WriteQueue {
    pub fn new() -> Self {
        WriteQueue {
            lines: VecDeque::new(),
            high_watermark: HIGH_WATERMARK,
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn add_line(&mut self, line: DynBuf) -> Result<(), WriteQueueError> {
        if self.lines.len() >= self.high_watermark {
            return Err(WriteQueueError::Overflow);
        }
        self.lines.push_back(line);
        Ok(())
    }

    /// Submit one vectored write covering every queued entry, then account
    /// for however many bytes the kernel accepted: fully covered entries
    /// are freed and popped, a partially covered entry keeps its unsent
    /// tail at the head of the queue.
    pub fn flush(&mut self, arena: &mut SlabArena, fd: RawFd) -> io::Result<usize> {
        if self.lines.is_empty() {
            return Ok(0);
        }

        let slices: Vec<IoSlice> = self
            .lines
            .iter()
            .map(|l| IoSlice::new(l.as_bytes(arena)))
            .collect();

        let written = match nix::sys::uio::writev(fd, &slices) {
            Ok(n) => n,
            Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EWOULDBLOCK) => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut remaining = written;
        while remaining > 0 {
            let front_len = match self.lines.front() {
                Some(l) => l.len(),
                None => break,
            };
            if remaining >= front_len {
                let done = self.lines.pop_front().unwrap();
                done.free(arena);
                remaining -= front_len;
            } else {
                let front = self.lines.front_mut().unwrap();
                front.remove_range(arena, 0, remaining - 1);
                remaining = 0;
            }
        }

        Ok(written)
    }

    /// Best-effort flush used during shutdown/hand-off drain; logs and
    /// swallows transient errors rather than propagating them.
    pub fn drain_best_effort(&mut self, arena: &mut SlabArena, fd: RawFd) {
        loop {
            if self.is_empty() {
                return;
            }
            match self.flush(arena, fd) {
                Ok(0) => return,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "best-effort drain failed, abandoning queue");
                    return;
                }
            }
        }
    }
}

impl Default for WriteQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> SlabArena {
        SlabArena::with_default_pools(true)
    }

    #[test]
    fn overflow_rejects_past_watermark() {
        let mut a = arena();
        let mut q = WriteQueue::new();
        for _ in 0..HIGH_WATERMARK {
            q.add_line(DynBuf::from_bytes(&mut a, b"x\n")).unwrap();
        }
        assert!(q.add_line(DynBuf::from_bytes(&mut a, b"x\n")).is_err());
    }

    #[test]
    fn flush_writes_queued_lines_to_a_pipe() {
        let mut a = arena();
        let mut q = WriteQueue::new();
        q.add_line(DynBuf::from_bytes(&mut a, b"hello\n")).unwrap();
        q.add_line(DynBuf::from_bytes(&mut a, b"world\n")).unwrap();

        let (r, w) = nix::unistd::pipe().unwrap();
        let n = q.flush(&mut a, w).unwrap();
        assert_eq!(n, 12);
        assert!(q.is_empty());

        let mut buf = [0u8; 32];
        let read = nix::unistd::read(r, &mut buf).unwrap();
        assert_eq!(&buf[..read], b"hello\nworld\n");
    }
}
