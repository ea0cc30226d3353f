//! [`KeyValueStore`] over a Redis server.
//!
//! Writes are one `MULTI`/`EXEC` transaction; searches run [`SCAN_SCRIPT`] through `EVALSHA`
//! so the sorted set is walked server-side in a single round trip.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use anyhow::{Context as _, anyhow};
use redis::{Client, Connection, Script};

use super::kv::{KeyValueStore, KvCommand, ScanOrder, ScanScript};
use crate::request::RequestType;

/// Arguments: `KEYS[1]` sorted set, `ARGV` = hash prefix, anchor flag, anchor, order,
/// lowercased name term (empty for none), limit (`-1` for none), then `type name-field`
/// pairs.
pub const SCAN_SCRIPT: &str = r#"
local index_key = KEYS[1]
local hash_prefix = ARGV[1]
local has_anchor = ARGV[2] == '1'
local anchor = ARGV[3]
local descending = ARGV[4] == 'desc'
local term = ARGV[5]
local limit = tonumber(ARGV[6])

local name_fields = {}
for i = 7, #ARGV, 2 do
  name_fields[ARGV[i]] = ARGV[i + 1]
end

local members
if descending then
  members = redis.call('ZREVRANGE', index_key, 0, -1)
else
  members = redis.call('ZRANGE', index_key, 0, -1)
end

local start = 1
if has_anchor then
  start = nil
  for i, member in ipairs(members) do
    if member == anchor then
      start = i + 1
      break
    end
  end
  if start == nil then
    return {}
  end
end

local found = {}
for i = start, #members do
  if limit >= 0 and #found >= limit then
    break
  end
  local member = members[i]
  local key = hash_prefix .. member
  if redis.call('EXISTS', key) == 1 then
    local keep = true
    if term ~= '' then
      local kind = redis.call('HGET', key, 'type') or 'request'
      local field = name_fields[kind] or name_fields['request']
      local name = redis.call('HGET', key, field)
      keep = name and string.find(string.lower(name), term, 1, true) ~= nil
    end
    if keep then
      found[#found + 1] = member
    end
  end
end
return found
"#;

pub struct RedisKeyValueStore {
    client: Client,
    script: Script,
    /// Opened on first use and dropped after a connection-level failure.
    connection: Mutex<Option<Connection>>,
}

impl RedisKeyValueStore {
    /// Parses `url` without connecting; the first command opens the connection.
    pub fn open(url: &str) -> anyhow::Result<Self> {
        let client = Client::open(url).with_context(|| format!("parse redis url `{url}`"))?;
        Ok(Self {
            client,
            script: Script::new(SCAN_SCRIPT),
            connection: Mutex::new(None),
        })
    }

    fn with_connection<T>(
        &self,
        operation: &str,
        run: impl FnOnce(&mut Connection) -> redis::RedisResult<T>,
    ) -> anyhow::Result<T> {
        let mut guard = self.lock()?;
        if guard.is_none() {
            let connection = self.client.get_connection().context("connect to redis")?;
            *guard = Some(connection);
        }
        let connection = guard.as_mut().context("redis connection unavailable")?;

        match run(connection) {
            Ok(value) => Ok(value),
            Err(err) => {
                if err.is_connection_dropped() || err.is_io_error() {
                    *guard = None;
                }
                Err(err).with_context(|| format!("redis {operation}"))
            }
        }
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, Option<Connection>>> {
        self.connection
            .lock()
            .map_err(|_| anyhow!("redis connection lock poisoned"))
    }
}

impl KeyValueStore for RedisKeyValueStore {
    fn multi(&self, commands: Vec<KvCommand>) -> anyhow::Result<()> {
        let pipeline = transaction(commands);
        self.with_connection("MULTI", |connection| pipeline.query::<()>(connection))
    }

    fn hgetall(&self, key: &str) -> anyhow::Result<Option<BTreeMap<String, String>>> {
        let hash: BTreeMap<String, String> = self.with_connection("HGETALL", |connection| {
            redis::cmd("HGETALL").arg(key).query(connection)
        })?;
        Ok(Some(hash).filter(|hash| !hash.is_empty()))
    }

    fn zrange_below(&self, key: &str, max_score: f64) -> anyhow::Result<Vec<String>> {
        self.with_connection("ZRANGEBYSCORE", |connection| {
            redis::cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg("-inf")
                .arg(format!("({max_score}"))
                .query(connection)
        })
    }

    fn scan(&self, script: &ScanScript) -> anyhow::Result<Vec<String>> {
        let args = scan_arguments(script);
        self.with_connection("scan script", |connection| {
            let mut invocation = self.script.key(&script.index_key);
            for arg in &args {
                invocation.arg(arg);
            }
            invocation.invoke(connection)
        })
    }
}

fn transaction(commands: Vec<KvCommand>) -> redis::Pipeline {
    let mut pipeline = redis::pipe();
    pipeline.atomic();
    for command in commands {
        match command {
            KvCommand::ZAdd { key, score, member } => {
                pipeline.cmd("ZADD").arg(key).arg(score).arg(member).ignore();
            }
            KvCommand::ZRem { key, member } => {
                pipeline.cmd("ZREM").arg(key).arg(member).ignore();
            }
            KvCommand::HSet { key, fields } => {
                if fields.is_empty() {
                    continue;
                }
                let hset = pipeline.cmd("HSET").arg(key);
                for (field, value) in fields {
                    hset.arg(field).arg(value);
                }
                hset.ignore();
            }
            KvCommand::Del { key } => {
                pipeline.cmd("DEL").arg(key).ignore();
            }
            KvCommand::Expire { key, seconds } => {
                pipeline.cmd("EXPIRE").arg(key).arg(seconds).ignore();
            }
        }
    }
    pipeline
}

/// `ARGV` for [`SCAN_SCRIPT`].
pub fn scan_arguments(script: &ScanScript) -> Vec<String> {
    let mut args = vec![
        script.hash_prefix.clone(),
        if script.anchor.is_some() { "1" } else { "0" }.to_owned(),
        script.anchor.clone().unwrap_or_default(),
        match script.order {
            ScanOrder::Ascending => "asc",
            ScanOrder::Descending => "desc",
        }
        .to_owned(),
        script
            .name_term
            .as_deref()
            .map(str::to_ascii_lowercase)
            .unwrap_or_default(),
        script
            .limit
            .map_or_else(|| "-1".to_owned(), |limit| limit.to_string()),
    ];
    for kind in RequestType::ALL {
        args.push(kind.as_str().to_owned());
        args.push(kind.fields().name.to_owned());
    }
    args
}

#[cfg(test)]
mod tests {
    use super::{RedisKeyValueStore, SCAN_SCRIPT, scan_arguments, transaction};
    use crate::storage::kv::{KvCommand, ScanOrder, ScanScript};

    fn script(anchor: Option<&str>, name_term: Option<&str>, limit: Option<usize>) -> ScanScript {
        ScanScript {
            index_key: "app:requests".to_owned(),
            hash_prefix: "app:".to_owned(),
            anchor: anchor.map(ToOwned::to_owned),
            order: ScanOrder::Descending,
            name_term: name_term.map(ToOwned::to_owned),
            limit,
        }
    }

    #[test]
    fn scan_arguments_follow_the_script_layout() {
        let args = scan_arguments(&script(Some("42"), Some("SendMail"), Some(3)));
        assert_eq!(&args[..6], ["app:", "1", "42", "desc", "sendmail", "3"]);
        assert_eq!(
            &args[6..],
            [
                "request",
                "uri",
                "command",
                "commandName",
                "queue-job",
                "jobName",
                "test",
                "testName"
            ]
        );
    }

    #[test]
    fn missing_anchor_term_and_limit_use_sentinels() {
        let args = scan_arguments(&script(None, None, None));
        assert_eq!(&args[1..3], ["0", ""]);
        assert_eq!(args[4], "");
        assert_eq!(args[5], "-1");
    }

    #[test]
    fn script_walks_both_orders_and_matches_names_literally() {
        for fragment in ["ZRANGE", "ZREVRANGE", "string.find(string.lower(name), term, 1, true)"] {
            assert!(SCAN_SCRIPT.contains(fragment), "missing {fragment}");
        }
    }

    #[test]
    fn writes_are_one_transaction_and_skip_empty_hashes() {
        let pipeline = transaction(vec![
            KvCommand::Del {
                key: "app:1".to_owned(),
            },
            KvCommand::HSet {
                key: "app:1".to_owned(),
                fields: Vec::new(),
            },
            KvCommand::ZAdd {
                key: "app:requests".to_owned(),
                score: 1.5,
                member: "1".to_owned(),
            },
        ]);
        let packed = String::from_utf8_lossy(&pipeline.get_packed_pipeline()).into_owned();
        assert!(packed.starts_with("*1\r\n$5\r\nMULTI\r\n"), "{packed}");
        assert!(packed.contains("ZADD"));
        assert!(!packed.contains("HSET"));
        assert!(packed.ends_with("$4\r\nEXEC\r\n"), "{packed}");
    }

    #[test]
    fn open_validates_the_url_without_connecting() {
        assert!(RedisKeyValueStore::open("redis://127.0.0.1:1/").is_ok());
        assert!(RedisKeyValueStore::open("not a url").is_err());
    }
}
