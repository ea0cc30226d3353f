//! Bidirectional line reading over a seekable byte stream.
//!
//! Reading backward seeks in fixed-size chunks from the cursor toward the start of the
//! stream, so paging from the end of a large index never loads the whole file.

use std::io::{self, Read, Seek, SeekFrom};

pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// A cursor positioned between lines of a newline-terminated stream.
///
/// `position` is always a line boundary: `0`, the end of the stream, or the offset just
/// after a `\n`. A final line without a terminator is still returned as a line.
#[derive(Debug)]
pub struct LineCursor<R> {
    inner: R,
    position: u64,
    len: u64,
    chunk_size: usize,
}

impl<R: Read + Seek> LineCursor<R> {
    pub fn at_start(inner: R) -> io::Result<Self> {
        Self::with_chunk_size(inner, DEFAULT_CHUNK_SIZE, false)
    }

    pub fn at_end(inner: R) -> io::Result<Self> {
        Self::with_chunk_size(inner, DEFAULT_CHUNK_SIZE, true)
    }

    pub fn with_chunk_size(mut inner: R, chunk_size: usize, at_end: bool) -> io::Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        Ok(Self {
            inner,
            position: if at_end { len } else { 0 },
            len,
            chunk_size: chunk_size.max(1),
        })
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Moves the cursor to a line boundary previously returned by [`LineCursor::position`].
    pub fn set_position(&mut self, position: u64) {
        self.position = position.min(self.len);
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Reads the line after the cursor and moves past it.
    pub fn read_next(&mut self) -> io::Result<Option<String>> {
        if self.position >= self.len {
            return Ok(None);
        }

        let start = self.position;
        let mut line = Vec::new();
        let mut offset = start;
        while offset < self.len {
            let chunk = self.read_range(offset, self.chunk_end_after(offset))?;
            if let Some(newline) = chunk.iter().position(|byte| *byte == b'\n') {
                line.extend_from_slice(&chunk[..newline]);
                self.position = offset + newline as u64 + 1;
                return Ok(Some(finish_line(line)));
            }
            offset += chunk.len() as u64;
            line.extend_from_slice(&chunk);
        }

        self.position = self.len;
        Ok(Some(finish_line(line)))
    }

    /// Reads the line before the cursor and moves to its start.
    pub fn read_previous(&mut self) -> io::Result<Option<String>> {
        if self.position == 0 {
            return Ok(None);
        }

        // The newline directly before the cursor terminates the line we are about to
        // return; the search for that line's start begins one byte earlier.
        let mut end = self.position;
        if self.read_range(end - 1, end)? == b"\n" {
            end -= 1;
        }

        let mut tail: Vec<u8> = Vec::new();
        let mut chunk_end = end;
        while chunk_end > 0 {
            let chunk_start = chunk_end.saturating_sub(self.chunk_size as u64);
            let mut chunk = self.read_range(chunk_start, chunk_end)?;
            if let Some(newline) = chunk.iter().rposition(|byte| *byte == b'\n') {
                let mut line = chunk.split_off(newline + 1);
                line.extend_from_slice(&tail);
                self.position = chunk_start + newline as u64 + 1;
                return Ok(Some(finish_line(line)));
            }
            chunk.extend_from_slice(&tail);
            tail = chunk;
            chunk_end = chunk_start;
        }

        self.position = 0;
        Ok(Some(finish_line(tail)))
    }

    /// Bytes from the cursor to the end of the stream.
    pub fn read_remaining(&mut self) -> io::Result<Vec<u8>> {
        self.read_range(self.position, self.len)
    }

    fn chunk_end_after(&self, offset: u64) -> u64 {
        offset.saturating_add(self.chunk_size as u64).min(self.len)
    }

    fn read_range(&mut self, start: u64, end: u64) -> io::Result<Vec<u8>> {
        let mut buffer = vec![0u8; end.saturating_sub(start) as usize];
        self.inner.seek(SeekFrom::Start(start))?;
        self.inner.read_exact(&mut buffer)?;
        Ok(buffer)
    }
}

fn finish_line(mut line: Vec<u8>) -> String {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8_lossy(&line).into_owned()
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::LineCursor;

    fn cursor(content: &str, chunk_size: usize, at_end: bool) -> LineCursor<Cursor<Vec<u8>>> {
        LineCursor::with_chunk_size(Cursor::new(content.as_bytes().to_vec()), chunk_size, at_end)
            .unwrap()
    }

    fn backward(content: &str, chunk_size: usize) -> Vec<String> {
        let mut cursor = cursor(content, chunk_size, true);
        let mut lines = Vec::new();
        while let Some(line) = cursor.read_previous().unwrap() {
            lines.push(line);
        }
        lines
    }

    fn forward(content: &str, chunk_size: usize) -> Vec<String> {
        let mut cursor = cursor(content, chunk_size, false);
        let mut lines = Vec::new();
        while let Some(line) = cursor.read_next().unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn backward_reads_every_line_for_all_chunk_sizes() {
        let content = "first\nsecond line\n\nfourth,with,commas\nx\n";
        for chunk_size in [1, 2, 3, 5, 7, 16, 1024] {
            assert_eq!(
                backward(content, chunk_size),
                vec!["x", "fourth,with,commas", "", "second line", "first"],
                "chunk size {chunk_size}"
            );
        }
    }

    #[test]
    fn forward_reads_every_line_for_all_chunk_sizes() {
        let content = "first\nsecond line\n\nfourth,with,commas\nx\n";
        for chunk_size in [1, 2, 3, 5, 7, 16, 1024] {
            assert_eq!(
                forward(content, chunk_size),
                vec!["first", "second line", "", "fourth,with,commas", "x"],
                "chunk size {chunk_size}"
            );
        }
    }

    #[test]
    fn unterminated_last_line_is_returned_in_both_directions() {
        assert_eq!(backward("a\nbc", 1), vec!["bc", "a"]);
        assert_eq!(forward("a\nbc", 1), vec!["a", "bc"]);
    }

    #[test]
    fn line_exactly_filling_a_chunk_is_not_split() {
        assert_eq!(backward("abcd\nefgh\n", 4), vec!["efgh", "abcd"]);
        assert_eq!(backward("abc\ndefg\n", 4), vec!["defg", "abc"]);
    }

    #[test]
    fn empty_stream_has_no_lines() {
        assert!(backward("", 4).is_empty());
        assert!(forward("", 4).is_empty());
    }

    #[test]
    fn directions_can_be_mixed_around_a_cursor() {
        let mut cursor = cursor("one\ntwo\nthree\n", 2, false);
        assert_eq!(cursor.read_next().unwrap().as_deref(), Some("one"));
        assert_eq!(cursor.read_next().unwrap().as_deref(), Some("two"));
        assert_eq!(cursor.position(), 8);
        assert_eq!(cursor.read_previous().unwrap().as_deref(), Some("two"));
        assert_eq!(cursor.read_previous().unwrap().as_deref(), Some("one"));
        assert_eq!(cursor.read_previous().unwrap(), None);
        assert_eq!(cursor.read_next().unwrap().as_deref(), Some("one"));
    }

    #[test]
    fn remaining_bytes_start_at_the_cursor() {
        let mut cursor = cursor("one\ntwo\nthree\n", 3, false);
        cursor.read_next().unwrap();
        assert_eq!(cursor.read_remaining().unwrap(), b"two\nthree\n");
    }

    #[test]
    fn carriage_returns_are_trimmed() {
        assert_eq!(backward("a\r\nb\r\n", 2), vec!["b", "a"]);
        assert_eq!(forward("a\r\nb\r\n", 2), vec!["a", "b"]);
    }
}
