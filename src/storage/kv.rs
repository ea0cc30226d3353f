//! Key-value backend: a sorted set orders ids by time and one hash holds each request.
//!
//! Layout under `prefix` (`{prefix}` in cluster mode, so every key lands in one slot):
//! `<prefix>:requests` is the sorted set (score = time, member = id) and `<prefix>:<id>`
//! is the request hash. Writes go through one atomic [`KeyValueStore::multi`]; searches
//! run the read-only [`KeyValueStore::scan`] script server-side.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use serde_json::{Map, Value};

use super::{CleanupPolicy, Storage, StorageError};
use crate::{
    fields::{self, decode_text, encode_text},
    request::{Request, RequestType},
    search::Search,
};

const INDEX_KEY_SUFFIX: &str = "requests";

#[derive(Debug, Clone, PartialEq)]
pub enum KvCommand {
    ZAdd {
        key: String,
        score: f64,
        member: String,
    },
    ZRem {
        key: String,
        member: String,
    },
    HSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    Del {
        key: String,
    },
    Expire {
        key: String,
        seconds: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrder {
    Ascending,
    Descending,
}

/// Arguments of the server-side search script.
///
/// Walks the sorted set in `order`, starting strictly after `anchor` when given (nothing
/// is returned if the anchor is not a member), and returns ids whose type-specific name
/// field contains `name_term`, ASCII case-insensitively, up to `limit`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanScript {
    pub index_key: String,
    pub hash_prefix: String,
    pub anchor: Option<String>,
    pub order: ScanOrder,
    pub name_term: Option<String>,
    pub limit: Option<usize>,
}

/// The subset of a key-value server the backend needs.
pub trait KeyValueStore: Send + Sync {
    /// Applies every command atomically.
    fn multi(&self, commands: Vec<KvCommand>) -> anyhow::Result<()>;

    fn hgetall(&self, key: &str) -> anyhow::Result<Option<BTreeMap<String, String>>>;

    /// Members with a score strictly below `max_score`, lowest first.
    fn zrange_below(&self, key: &str, max_score: f64) -> anyhow::Result<Vec<String>>;

    /// Runs the search script without mutating anything.
    fn scan(&self, script: &ScanScript) -> anyhow::Result<Vec<String>>;
}

#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    sorted_sets: HashMap<String, Vec<(f64, String)>>,
    hashes: HashMap<String, HashEntry>,
}

#[derive(Debug, Default)]
struct HashEntry {
    fields: BTreeMap<String, String>,
    expires_at: Option<Instant>,
}

impl MemoryKeyValueStore {
    /// Live keys, sorted; expired hashes are excluded.
    pub fn keys(&self) -> anyhow::Result<Vec<String>> {
        let mut state = self.lock()?;
        state.purge_expired();
        let mut keys: Vec<String> = state
            .sorted_sets
            .keys()
            .chain(state.hashes.keys())
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("key-value state lock poisoned"))
    }
}

impl MemoryState {
    fn apply(&mut self, command: KvCommand) {
        match command {
            KvCommand::ZAdd { key, score, member } => {
                let set = self.sorted_sets.entry(key).or_default();
                set.retain(|(_, existing)| *existing != member);
                let entry = (score, member);
                let position = set.partition_point(|existing| compare_entries(existing, &entry).is_lt());
                set.insert(position, entry);
            }
            KvCommand::ZRem { key, member } => {
                if let Some(set) = self.sorted_sets.get_mut(&key) {
                    set.retain(|(_, existing)| *existing != member);
                    if set.is_empty() {
                        self.sorted_sets.remove(&key);
                    }
                }
            }
            KvCommand::HSet { key, fields } => {
                let entry = self.hashes.entry(key).or_default();
                entry.fields.extend(fields);
            }
            KvCommand::Del { key } => {
                self.sorted_sets.remove(&key);
                self.hashes.remove(&key);
            }
            KvCommand::Expire { key, seconds } => {
                if let Some(entry) = self.hashes.get_mut(&key) {
                    entry.expires_at = Some(Instant::now() + Duration::from_secs(seconds));
                }
            }
        }
    }

    fn live_hash(&mut self, key: &str) -> Option<&BTreeMap<String, String>> {
        let expired = self.hashes.get(key)?.is_expired(Instant::now());
        if expired {
            self.hashes.remove(key);
            return None;
        }
        self.hashes.get(key).map(|entry| &entry.fields)
    }

    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.hashes.retain(|_, entry| !entry.is_expired(now));
    }

    fn scan(&mut self, script: &ScanScript) -> Vec<String> {
        let Some(set) = self.sorted_sets.get(&script.index_key) else {
            return Vec::new();
        };
        let mut members: Vec<String> = set.iter().map(|(_, member)| member.clone()).collect();
        if script.order == ScanOrder::Descending {
            members.reverse();
        }

        let start = match &script.anchor {
            Some(anchor) => match members.iter().position(|member| member == anchor) {
                Some(position) => position + 1,
                None => return Vec::new(),
            },
            None => 0,
        };
        let term = script.name_term.as_deref().map(str::to_ascii_lowercase);

        let mut found = Vec::new();
        for member in members.into_iter().skip(start) {
            if script.limit.is_some_and(|limit| found.len() >= limit) {
                break;
            }
            let key = format!("{}{member}", script.hash_prefix);
            let Some(hash) = self.live_hash(&key) else {
                continue;
            };
            if let Some(term) = &term
                && !name_contains(hash, term)
            {
                continue;
            }
            found.push(member);
        }
        found
    }
}

impl HashEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

fn compare_entries(left: &(f64, String), right: &(f64, String)) -> Ordering {
    left.0.total_cmp(&right.0).then_with(|| left.1.cmp(&right.1))
}

/// Name matching as the scan script does it: the hash's type picks the name field.
fn name_contains(hash: &BTreeMap<String, String>, term: &str) -> bool {
    let kind = hash
        .get("type")
        .and_then(|kind| kind.parse::<RequestType>().ok())
        .unwrap_or_default();
    hash.get(kind.fields().name)
        .is_some_and(|name| name.to_ascii_lowercase().contains(term))
}

impl KeyValueStore for MemoryKeyValueStore {
    fn multi(&self, commands: Vec<KvCommand>) -> anyhow::Result<()> {
        let mut state = self.lock()?;
        for command in commands {
            state.apply(command);
        }
        Ok(())
    }

    fn hgetall(&self, key: &str) -> anyhow::Result<Option<BTreeMap<String, String>>> {
        let mut state = self.lock()?;
        Ok(state.live_hash(key).cloned())
    }

    fn zrange_below(&self, key: &str, max_score: f64) -> anyhow::Result<Vec<String>> {
        let state = self.lock()?;
        Ok(state
            .sorted_sets
            .get(key)
            .map(|set| {
                set.iter()
                    .take_while(|(score, _)| *score < max_score)
                    .map(|(_, member)| member.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn scan(&self, script: &ScanScript) -> anyhow::Result<Vec<String>> {
        let mut state = self.lock()?;
        Ok(state.scan(script))
    }
}

#[derive(Debug, Clone)]
pub struct KeyValueStorageConfig {
    pub prefix: String,
    /// Wraps the prefix in a hash tag so all keys share one cluster slot.
    pub cluster: bool,
    pub cleanup: CleanupPolicy,
}

pub struct KeyValueStorage {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
    cleanup: CleanupPolicy,
}

impl KeyValueStorage {
    pub fn new(store: Arc<dyn KeyValueStore>, config: KeyValueStorageConfig) -> Self {
        let prefix = if config.cluster {
            format!("{{{}}}", config.prefix)
        } else {
            config.prefix
        };
        Self {
            store,
            prefix,
            cleanup: config.cleanup,
        }
    }

    pub fn index_key(&self) -> String {
        format!("{}:{INDEX_KEY_SUFFIX}", self.prefix)
    }

    pub fn hash_key(&self, id: &str) -> String {
        format!("{}{id}", self.hash_prefix())
    }

    fn hash_prefix(&self) -> String {
        format!("{}:", self.prefix)
    }

    fn write_commands(&self, request: &Request, index: bool) -> Vec<KvCommand> {
        let key = self.hash_key(&request.id);
        let mut commands = vec![
            KvCommand::Del { key: key.clone() },
            KvCommand::HSet {
                key: key.clone(),
                fields: encode_hash(request),
            },
        ];
        if index {
            commands.push(KvCommand::ZAdd {
                key: self.index_key(),
                score: request.time,
                member: request.id.clone(),
            });
        }
        if let Some(seconds) = self.cleanup.expiration.as_secs() {
            commands.push(KvCommand::Expire { key, seconds });
        }
        commands
    }

    /// Scans in `order`, narrowing server-side by the name term, then applies the full
    /// criteria here. Results come back in scan order.
    fn query(
        &self,
        anchor: Option<&str>,
        order: ScanOrder,
        count: Option<usize>,
        search: &Search,
    ) -> Vec<Request> {
        if count == Some(0) {
            return Vec::new();
        }

        let decided_by_scan = search.is_empty() || search.is_name_only();
        let script = ScanScript {
            index_key: self.index_key(),
            hash_prefix: self.hash_prefix(),
            anchor: anchor.map(ToOwned::to_owned),
            order,
            name_term: search.name_term().map(ToOwned::to_owned),
            limit: if decided_by_scan { count } else { None },
        };

        let ids = match self.store.scan(&script) {
            Ok(ids) => ids,
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "key-value scan failed");
                return Vec::new();
            }
        };

        ids.iter()
            .filter_map(|id| self.find(id))
            .filter(|request| decided_by_scan || search.matches_request(request))
            .take(count.unwrap_or(usize::MAX))
            .collect()
    }
}

impl Storage for KeyValueStorage {
    fn all(&self, search: &Search) -> Vec<Request> {
        self.query(None, ScanOrder::Ascending, None, search)
    }

    fn find(&self, id: &str) -> Option<Request> {
        let hash = match self.store.hgetall(&self.hash_key(id)) {
            Ok(hash) => hash?,
            Err(err) => {
                tracing::warn!(id, error = %format!("{err:#}"), "key-value read failed");
                return None;
            }
        };
        match Request::from_map(decode_hash(hash)) {
            Ok(request) => Some(request),
            Err(err) => {
                tracing::warn!(id, error = %format!("{err:#}"), "failed to decode request hash");
                None
            }
        }
    }

    fn latest(&self, search: &Search) -> Option<Request> {
        self.query(None, ScanOrder::Descending, Some(1), search)
            .pop()
    }

    fn previous(&self, id: &str, count: Option<usize>, search: &Search) -> Vec<Request> {
        let mut requests = self.query(Some(id), ScanOrder::Descending, count, search);
        requests.reverse();
        requests
    }

    fn next(&self, id: &str, count: Option<usize>, search: &Search) -> Vec<Request> {
        self.query(Some(id), ScanOrder::Ascending, count, search)
    }

    fn store(&self, request: &Request) -> Result<(), StorageError> {
        self.store
            .multi(self.write_commands(request, true))
            .map_err(|err| StorageError::Io(format!("store request {}: {err:#}", request.id)))?;

        if let Err(err) = self.cleanup(false) {
            tracing::warn!(error = %err, "cleanup after store failed");
        }
        Ok(())
    }

    fn update(&self, request: &Request) -> Result<(), StorageError> {
        self.store
            .multi(self.write_commands(request, false))
            .map_err(|err| StorageError::Io(format!("update request {}: {err:#}", request.id)))
    }

    fn cleanup(&self, force: bool) -> Result<usize, StorageError> {
        let Some(cutoff) = self.cleanup.due(force) else {
            return Ok(0);
        };

        let index_key = self.index_key();
        let expired = self
            .store
            .zrange_below(&index_key, cutoff)
            .map_err(|err| StorageError::Io(format!("list expired requests: {err:#}")))?;
        if expired.is_empty() {
            return Ok(0);
        }

        let commands = expired
            .iter()
            .flat_map(|id| {
                [
                    KvCommand::ZRem {
                        key: index_key.clone(),
                        member: id.clone(),
                    },
                    KvCommand::Del {
                        key: self.hash_key(id),
                    },
                ]
            })
            .collect();
        self.store
            .multi(commands)
            .map_err(|err| StorageError::Io(format!("remove expired requests: {err:#}")))?;

        tracing::info!(removed = expired.len(), cutoff, "cleaned up expired requests");
        Ok(expired.len())
    }
}

fn encode_hash(request: &Request) -> Vec<(String, String)> {
    request
        .to_map()
        .into_iter()
        .filter_map(|(name, value)| {
            let kind = fields::lookup(&name).map(|field| field.kind);
            encode_text(kind, &value).map(|text| (name, text))
        })
        .collect()
}

fn decode_hash(hash: BTreeMap<String, String>) -> Map<String, Value> {
    hash.into_iter()
        .map(|(name, text)| {
            let kind = fields::lookup(&name).map(|field| field.kind);
            let value = decode_text(kind, &text).unwrap_or(Value::String(text));
            (name, value)
        })
        .collect()
}
