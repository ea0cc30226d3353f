//! Flat-file backend: one `<id>.json` (or `<id>.json.gz`) per request plus the `index`.

use std::{
    fs,
    io::{self, Read as _, Write as _},
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use flate2::{Compression, read::GzDecoder, write::GzEncoder};

use super::{
    CleanupPolicy, Storage, StorageError,
    index::{self, Direction, INDEX_FILENAME, IndexCursor, LockMode},
};
use crate::{
    request::{Request, RequestSummary},
    search::Search,
};

const GITIGNORE: &str = "*\n!.gitignore\n";

#[derive(Debug, Clone)]
pub struct FileStorageConfig {
    pub path: PathBuf,
    pub compress: bool,
    pub cleanup: CleanupPolicy,
}

#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
    compress: bool,
    cleanup: CleanupPolicy,
}

impl FileStorage {
    pub fn new(config: FileStorageConfig) -> Self {
        Self {
            path: config.path,
            compress: config.compress,
            cleanup: config.cleanup,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index_path(&self) -> PathBuf {
        self.path.join(INDEX_FILENAME)
    }

    fn data_path(&self, id: &str, compressed: bool) -> PathBuf {
        let extension = if compressed { "json.gz" } else { "json" };
        self.path.join(format!("{id}.{extension}"))
    }

    /// Candidate data files for `id`, the configured format first.
    fn data_paths(&self, id: &str) -> [PathBuf; 2] {
        [
            self.data_path(id, self.compress),
            self.data_path(id, !self.compress),
        ]
    }

    fn ensure_directory(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.path).map_err(|err| {
            StorageError::Write(format!("create directory {}: {err}", self.path.display()))
        })?;

        let metadata = fs::metadata(&self.path).map_err(|err| {
            StorageError::Write(format!("inspect directory {}: {err}", self.path.display()))
        })?;
        if metadata.permissions().readonly() {
            return Err(StorageError::Write(format!(
                "directory {} is read-only",
                self.path.display()
            )));
        }

        let gitignore = self.path.join(".gitignore");
        if !gitignore.exists() {
            fs::write(&gitignore, GITIGNORE).map_err(|err| {
                StorageError::Write(format!("write {}: {err}", gitignore.display()))
            })?;
        }
        Ok(())
    }

    fn write_record(&self, request: &Request) -> Result<(), StorageError> {
        if !is_valid_id(&request.id) {
            return Err(StorageError::Write(format!(
                "request id `{}` cannot be used as a file name",
                request.id
            )));
        }

        let json = serde_json::to_vec(&request.to_value())
            .map_err(|err| StorageError::Internal(format!("serialize request: {err}")))?;
        let bytes = if self.compress {
            gzip(&json).map_err(|err| StorageError::Io(format!("compress request: {err}")))?
        } else {
            json
        };

        let path = self.data_path(&request.id, self.compress);
        fs::write(&path, bytes)
            .map_err(|err| StorageError::Write(format!("write {}: {err}", path.display())))
    }

    fn load(&self, id: &str) -> anyhow::Result<Option<Request>> {
        for path in self.data_paths(id) {
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("read {}", path.display()));
                }
            };
            let json = if path.extension().is_some_and(|ext| ext == "gz") {
                gunzip(&bytes).with_context(|| format!("decompress {}", path.display()))?
            } else {
                bytes
            };
            let request = serde_json::from_slice::<Request>(&json)
                .with_context(|| format!("decode {}", path.display()))?;
            return Ok(Some(request));
        }
        Ok(None)
    }

    /// Runs `scan` over the locked index and returns the entries it collected.
    ///
    /// The shared lock is released before any data file is read.
    fn scan_index<F>(&self, at_end: bool, scan: F) -> Vec<RequestSummary>
    where
        F: FnOnce(&mut IndexCursor) -> io::Result<Vec<RequestSummary>>,
    {
        let path = self.index_path();
        let mut cursor = match IndexCursor::open(&path, LockMode::Shared, at_end) {
            Ok(Some(cursor)) => cursor,
            Ok(None) => return Vec::new(),
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "index unavailable");
                return Vec::new();
            }
        };

        match scan(&mut cursor) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "index scan failed");
                Vec::new()
            }
        }
    }

    fn load_entries(&self, entries: Vec<RequestSummary>) -> Vec<Request> {
        entries
            .into_iter()
            .filter_map(|entry| {
                let request = self.find(&entry.id);
                if request.is_none() {
                    tracing::debug!(id = %entry.id, "indexed request has no data file");
                }
                request
            })
            .collect()
    }

    fn previous_entries(
        &self,
        id: &str,
        count: Option<usize>,
        search: &Search,
    ) -> Vec<RequestSummary> {
        self.scan_index(true, |cursor| {
            if !cursor.seek_to(id, Direction::Backward)? {
                return Ok(Vec::new());
            }
            cursor.collect(Direction::Backward, search, count)
        })
    }

    fn remove_data_files(&self, id: &str) {
        for path in self.data_paths(id) {
            let _ = fs::remove_file(path);
        }
    }
}

impl Storage for FileStorage {
    fn all(&self, search: &Search) -> Vec<Request> {
        let entries = self.scan_index(false, |cursor| {
            cursor.collect(Direction::Forward, search, None)
        });
        self.load_entries(entries)
    }

    fn find(&self, id: &str) -> Option<Request> {
        if !is_valid_id(id) {
            return None;
        }
        match self.load(id) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(id, error = %format!("{err:#}"), "failed to load request");
                None
            }
        }
    }

    /// Walks back past indexed entries whose data file cannot be loaded.
    fn latest(&self, search: &Search) -> Option<Request> {
        let mut candidate = self
            .scan_index(true, |cursor| {
                cursor.collect(Direction::Backward, search, Some(1))
            })
            .pop()?;
        loop {
            if let Some(request) = self.find(&candidate.id) {
                return Some(request);
            }
            tracing::debug!(id = %candidate.id, "indexed request has no data file");
            candidate = self
                .previous_entries(&candidate.id, Some(1), search)
                .pop()?;
        }
    }

    fn previous(&self, id: &str, count: Option<usize>, search: &Search) -> Vec<Request> {
        self.load_entries(self.previous_entries(id, count, search))
    }

    fn next(&self, id: &str, count: Option<usize>, search: &Search) -> Vec<Request> {
        let entries = self.scan_index(false, |cursor| {
            if !cursor.seek_to(id, Direction::Forward)? {
                return Ok(Vec::new());
            }
            cursor.collect(Direction::Forward, search, count)
        });
        self.load_entries(entries)
    }

    fn store(&self, request: &Request) -> Result<(), StorageError> {
        self.ensure_directory()?;
        self.write_record(request)?;
        if let Err(err) = index::append_entry(&self.index_path(), &request.summary()) {
            // An unindexed data file would never be listed or cleaned up.
            self.remove_data_files(&request.id);
            return Err(StorageError::Write(format!("{err:#}")));
        }

        if let Err(err) = self.cleanup(false) {
            tracing::warn!(error = %err, "cleanup after store failed");
        }
        Ok(())
    }

    fn update(&self, request: &Request) -> Result<(), StorageError> {
        self.ensure_directory()?;
        self.write_record(request)
    }

    fn cleanup(&self, force: bool) -> Result<usize, StorageError> {
        let Some(cutoff) = self.cleanup.due(force) else {
            return Ok(0);
        };

        let path = self.index_path();
        let Some(mut cursor) = IndexCursor::open(&path, LockMode::Exclusive, false)
            .map_err(|err| StorageError::Io(format!("{err:#}")))?
        else {
            return Ok(0);
        };

        let expired = cursor
            .collect(Direction::Forward, &Search::received_before(cutoff), None)
            .map_err(|err| StorageError::Io(format!("scan index {}: {err}", path.display())))?;
        if expired.is_empty() {
            return Ok(0);
        }

        cursor
            .truncate_before_cursor()
            .map_err(|err| StorageError::Io(format!("truncate index {}: {err}", path.display())))?;
        drop(cursor);

        for entry in &expired {
            if is_valid_id(&entry.id) {
                self.remove_data_files(&entry.id);
            }
        }

        tracing::info!(removed = expired.len(), cutoff, "cleaned up expired requests");
        Ok(expired.len())
    }
}

/// Ids become file names; anything that could escape the storage directory is rejected.
fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && !id.contains("..")
        && !id.contains(['/', '\\', '\0'])
}

fn gzip(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

fn gunzip(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoded = Vec::new();
    GzDecoder::new(bytes).read_to_end(&mut decoded)?;
    Ok(decoded)
}
