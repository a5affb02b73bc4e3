//! Append-side buffer yielding complete newline-terminated records.
//!
//! Grounded on `lr.c`. One divergence from that source is deliberate: its
//! next-line scan re-searched whenever the first newline it found sat
//! exactly at the cursor, folding that newline into the *next* line instead
//! of terminating an (possibly empty) one there. This implementation has no
//! such special case -- see SPEC_FULL.md S9.

use crate::buf::{DynBuf, SlabArena};

const DEFAULT_BUF_SIZE: usize = 1024;

pub struct LineReader {
    buf: DynBuf,
    cur_idx: usize,
}

impl LineReader {
    pub fn new(arena: &mut SlabArena) -> Self {
        LineReader {
            buf: DynBuf::reserve(arena, DEFAULT_BUF_SIZE),
            cur_idx: 0,
        }
    }

    pub fn reset(&mut self, arena: &mut SlabArena) {
        self.buf.reset(arena);
        self.cur_idx = 0;
    }

    /// Replace the buffer wholesale, e.g. when restoring residual bytes
    /// handed off from a predecessor process.
    pub fn reset_with_buffer(&mut self, arena: &mut SlabArena, bytes: &[u8], cur_idx: usize) {
        self.buf = DynBuf::from_bytes(arena, bytes);
        self.cur_idx = cur_idx;
    }

    /// Writable tail guaranteed to hold at least `min_hint` contiguous bytes.
    pub fn get_buffer<'a>(&mut self, arena: &'a mut SlabArena, min_hint: usize) -> &'a mut [u8] {
        self.buf.get_buffer(arena, min_hint)
    }

    pub fn buffer_fill(&mut self, arena: &mut SlabArena, numbytes: usize) {
        self.buf.fill(arena, numbytes);
    }

    /// Emit the next complete, newline-terminated record, or `None` if no
    /// newline has arrived yet (the partial tail remains buffered).
    pub fn next_line(&mut self, arena: &mut SlabArena) -> Option<DynBuf> {
        let bytes = self.buf.as_bytes(arena);
        let hit = bytes[self.cur_idx..].iter().position(|&b| b == b'\n');

        match hit {
            None => {
                self.cur_idx = self.buf.len();
                None
            }
            Some(rel) => {
                let nl_idx = self.cur_idx + rel;
                let line_bytes: Vec<u8> = self.buf.as_bytes(arena)[..=nl_idx].to_vec();
                let line = DynBuf::from_bytes(arena, &line_bytes);
                self.buf.remove_range(arena, 0, nl_idx);
                self.cur_idx = 0;
                Some(line)
            }
        }
    }

    /// The raw backing buffer plus current cursor, used by the hand-off
    /// protocol to serialize residual (unterminated) input.
    pub fn raw_buffer(&self) -> (&DynBuf, usize) {
        (&self.buf, self.cur_idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> SlabArena {
        SlabArena::with_default_pools(true)
    }

    fn feed(reader: &mut LineReader, arena: &mut SlabArena, data: &[u8]) {
        let dst = reader.get_buffer(arena, data.len());
        dst[..data.len()].copy_from_slice(data);
        reader.buffer_fill(arena, data.len());
    }

    #[test]
    fn single_complete_line() {
        let mut a = arena();
        let mut r = LineReader::new(&mut a);
        feed(&mut r, &mut a, b"hello\n");
        let line = r.next_line(&mut a).unwrap();
        assert_eq!(line.as_bytes(&a), b"hello\n");
        assert!(r.next_line(&mut a).is_none());
    }

    #[test]
    fn partial_tail_retained_across_calls() {
        let mut a = arena();
        let mut r = LineReader::new(&mut a);
        feed(&mut r, &mut a, b"hel");
        assert!(r.next_line(&mut a).is_none());
        feed(&mut r, &mut a, b"lo\nworld");
        let line = r.next_line(&mut a).unwrap();
        assert_eq!(line.as_bytes(&a), b"hello\n");
        assert!(r.next_line(&mut a).is_none());
    }

    #[test]
    fn one_byte_chunks_reconstruct_a_long_line() {
        let mut a = arena();
        let mut r = LineReader::new(&mut a);
        for &b in b"one-byte-at-a-time\n" {
            feed(&mut r, &mut a, &[b]);
        }
        let line = r.next_line(&mut a).unwrap();
        assert_eq!(line.as_bytes(&a), b"one-byte-at-a-time\n");
    }

    #[test]
    fn leading_newline_terminates_an_empty_line() {
        // Confirms the corrected (non-quirky) behavior: a newline that is
        // the very first unscanned byte still terminates a record there.
        let mut a = arena();
        let mut r = LineReader::new(&mut a);
        feed(&mut r, &mut a, b"\nabc\n");
        let first = r.next_line(&mut a).unwrap();
        assert_eq!(first.as_bytes(&a), b"\n");
        let second = r.next_line(&mut a).unwrap();
        assert_eq!(second.as_bytes(&a), b"abc\n");
    }

    #[test]
    fn multiple_lines_in_one_chunk() {
        let mut a = arena();
        let mut r = LineReader::new(&mut a);
        feed(&mut r, &mut a, b"first\nsecond\nthird");
        assert_eq!(r.next_line(&mut a).unwrap().as_bytes(&a), b"first\n");
        assert_eq!(r.next_line(&mut a).unwrap().as_bytes(&a), b"second\n");
        assert!(r.next_line(&mut a).is_none());
    }
}
