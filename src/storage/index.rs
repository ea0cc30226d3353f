//! The append-only index file: one CSV line per stored request, in store order.
//!
//! Line shape: `id,time,method,name,controller,status,duration,type`, where `name` and
//! `status` hold whichever fields the request type maps to those roles.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
};

use anyhow::Context as _;

use super::line_cursor::{DEFAULT_CHUNK_SIZE, LineCursor};
use crate::{
    request::{RequestSummary, RequestType},
    search::{Search, parse_number},
};

pub const INDEX_FILENAME: &str = "index";
const INDEX_COLUMNS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

pub fn encode_line(summary: &RequestSummary) -> String {
    let optional = |value: &Option<String>| value.clone().unwrap_or_default();
    let fields = [
        summary.id.clone(),
        summary.time.to_string(),
        optional(&summary.method),
        optional(&summary.name),
        optional(&summary.controller),
        optional(&summary.status),
        summary
            .duration
            .filter(|duration| duration.is_finite())
            .map(|duration| duration.to_string())
            .unwrap_or_default(),
        summary.kind.as_str().to_owned(),
    ];

    fields
        .iter()
        .map(|field| encode_field(field))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn decode_line(line: &str) -> anyhow::Result<RequestSummary> {
    let fields = split_fields(line)?;
    if fields.len() < INDEX_COLUMNS {
        anyhow::bail!(
            "index line has {} fields (expected {INDEX_COLUMNS})",
            fields.len()
        );
    }

    let mut fields = fields.into_iter();
    let mut next = || fields.next().unwrap_or_default();
    let optional = |value: String| Some(value).filter(|value| !value.is_empty());

    let id = next();
    if id.is_empty() {
        anyhow::bail!("index line has an empty id");
    }
    let time = next();
    let time = parse_number(&time).with_context(|| format!("parse index time `{time}`"))?;
    let method = optional(next());
    let name = optional(next());
    let controller = optional(next());
    let status = optional(next());
    let duration = parse_number(&next());
    let kind = next().parse::<RequestType>()?;

    Ok(RequestSummary {
        id,
        time,
        method,
        name,
        controller,
        status,
        duration,
        kind,
    })
}

/// Quotes fields that contain separators, quotes or whitespace; newlines become spaces so
/// every entry stays on one line.
fn encode_field(value: &str) -> String {
    let value = value.replace(['\r', '\n'], " ");
    if value
        .chars()
        .any(|ch| matches!(ch, ',' | '"' | ' ' | '\t'))
    {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value
    }
}

fn split_fields(line: &str) -> anyhow::Result<Vec<String>> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    let mut in_quotes = false;

    while let Some(ch) = chars.next() {
        match (in_quotes, ch) {
            (true, '"') if chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            (true, '"') => in_quotes = false,
            (true, ch) => current.push(ch),
            (false, '"') if current.is_empty() => in_quotes = true,
            (false, ',') => fields.push(std::mem::take(&mut current)),
            (false, ch) => current.push(ch),
        }
    }

    if in_quotes {
        anyhow::bail!("index line has an unterminated quoted field");
    }
    fields.push(current);
    Ok(fields)
}

/// Appends one entry under an exclusive lock.
///
/// A trailing fragment left by an interrupted append is terminated first, so the new entry
/// always starts on its own line.
pub fn append_entry(path: &Path, summary: &RequestSummary) -> anyhow::Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open index {}", path.display()))?;
    file.lock()
        .with_context(|| format!("lock index {}", path.display()))?;

    let written = write_entry(&mut file, summary)
        .with_context(|| format!("append to index {}", path.display()));
    let _ = file.unlock();
    written
}

fn write_entry(file: &mut File, summary: &RequestSummary) -> io::Result<()> {
    let mut line = String::new();
    if ends_mid_line(file)? {
        tracing::warn!("index ends with an unterminated line; terminating it before appending");
        line.push('\n');
    }
    line.push_str(&encode_line(summary));
    line.push('\n');
    file.write_all(line.as_bytes())
}

fn ends_mid_line(file: &mut File) -> io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// An open, locked index positioned at a line boundary.
///
/// The lock is held for the cursor's lifetime and released when it is dropped, on every
/// exit path.
#[derive(Debug)]
pub struct IndexCursor {
    lines: LineCursor<File>,
}

impl IndexCursor {
    /// Opens the index at its start or end; `None` when no index exists yet.
    pub fn open(path: &Path, mode: LockMode, at_end: bool) -> anyhow::Result<Option<Self>> {
        Self::open_with_chunk_size(path, mode, at_end, DEFAULT_CHUNK_SIZE)
    }

    pub fn open_with_chunk_size(
        path: &Path,
        mode: LockMode,
        at_end: bool,
        chunk_size: usize,
    ) -> anyhow::Result<Option<Self>> {
        let file = match OpenOptions::new()
            .read(true)
            .write(mode == LockMode::Exclusive)
            .open(path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("open index {}", path.display()));
            }
        };

        match mode {
            LockMode::Shared => file.lock_shared(),
            LockMode::Exclusive => file.lock(),
        }
        .with_context(|| format!("lock index {}", path.display()))?;

        let lines = LineCursor::with_chunk_size(file, chunk_size, at_end)
            .with_context(|| format!("position index {}", path.display()))?;
        Ok(Some(Self { lines }))
    }

    pub fn next_entry(&mut self) -> io::Result<Option<RequestSummary>> {
        self.read_entry(Direction::Forward)
    }

    pub fn previous_entry(&mut self) -> io::Result<Option<RequestSummary>> {
        self.read_entry(Direction::Backward)
    }

    /// Moves past the entry with `id` in `direction`; false when it is not in the index.
    ///
    /// Forward leaves the cursor just after the entry, backward just before it, so the
    /// following reads in the same direction never include the entry itself.
    pub fn seek_to(&mut self, id: &str, direction: Direction) -> io::Result<bool> {
        while let Some(entry) = self.read_entry(direction)? {
            if entry.id == id {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Collects matching entries in `direction`, always returned oldest-first.
    pub fn collect(
        &mut self,
        direction: Direction,
        search: &Search,
        count: Option<usize>,
    ) -> io::Result<Vec<RequestSummary>> {
        let mut found = Vec::new();
        if count == Some(0) {
            return Ok(found);
        }

        loop {
            let before = self.lines.position();
            let Some(entry) = self.read_entry(direction)? else {
                break;
            };

            if search.matches(&entry) {
                found.push(entry);
                if count.is_some_and(|count| found.len() >= count) {
                    break;
                }
            } else if search.stop_on_first_mismatch {
                self.lines.set_position(before);
                break;
            }
        }

        if direction == Direction::Backward {
            found.reverse();
        }
        Ok(found)
    }

    /// Rewrites the index so it starts at the cursor, dropping everything before it.
    pub fn truncate_before_cursor(&mut self) -> io::Result<u64> {
        let removed = self.lines.position();
        if removed == 0 {
            return Ok(0);
        }

        let remaining = self.lines.read_remaining()?;
        let file = self.lines.get_mut();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&remaining)?;
        file.flush()?;
        Ok(removed)
    }

    fn read_entry(&mut self, direction: Direction) -> io::Result<Option<RequestSummary>> {
        loop {
            let line = match direction {
                Direction::Forward => self.lines.read_next()?,
                Direction::Backward => self.lines.read_previous()?,
            };
            let Some(line) = line else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }

            match decode_line(&line) {
                Ok(entry) => return Ok(Some(entry)),
                Err(err) => {
                    tracing::warn!(error = %err, line = %line, "skipping malformed index line");
                }
            }
        }
    }
}

impl Drop for IndexCursor {
    fn drop(&mut self) {
        let _ = self.lines.get_mut().unlock();
    }
}
