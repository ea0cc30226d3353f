use std::{fs, io, path::PathBuf};

use anyhow::{Context as _, bail};
use clap::{Args, Parser, Subcommand};
use reqvault::{
    config::Config,
    logging,
    request::{Request, generate_id, now_unix_secs},
    search::Search,
    storage::StorageHandle,
};
use serde_json::{Map, Value};

#[derive(Debug, Parser)]
#[command(name = "reqvault", about = "Store, page through and search request profiles")]
struct Cli {
    /// Optional path to config TOML. If omitted, default discovery is used.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override log level (trace, debug, info, warn, error, off).
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Store a request read from a JSON file (`-` for stdin).
    Import {
        file: String,
        /// Rewrite an already stored request instead of storing a new one.
        #[arg(long)]
        update: bool,
    },
    /// Print one request as JSON.
    Show { id: String },
    /// Print the most recent matching request.
    Latest {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Print matching requests, oldest first.
    List {
        /// Only print the newest N matches.
        #[arg(long)]
        limit: Option<usize>,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Print matching requests stored before ID.
    Previous {
        id: String,
        #[arg(long)]
        count: Option<usize>,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Print matching requests stored after ID.
    Next {
        id: String,
        #[arg(long)]
        count: Option<usize>,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Remove expired requests.
    Cleanup {
        /// Run even when the cleanup chance roll would skip it.
        #[arg(long)]
        force: bool,
    },
}

/// Search criteria; every flag may be repeated and patterns of one flag are ORed.
#[derive(Debug, Clone, Default, PartialEq, Args)]
struct FilterArgs {
    #[arg(long)]
    uri: Vec<String>,
    #[arg(long)]
    controller: Vec<String>,
    #[arg(long)]
    method: Vec<String>,
    /// `<N`, `>N`, `A-B` or an exact value.
    #[arg(long)]
    status: Vec<String>,
    /// Response duration pattern in milliseconds.
    #[arg(long)]
    time: Vec<String>,
    /// `<DATE` or `>DATE`.
    #[arg(long)]
    received: Vec<String>,
    #[arg(long)]
    name: Vec<String>,
    #[arg(long = "type")]
    types: Vec<String>,
    /// Query string such as `status[]=<400&method[]=get`.
    #[arg(long)]
    query: Option<String>,
}

impl FilterArgs {
    fn to_search(&self) -> Search {
        let mut search = self
            .query
            .as_deref()
            .map(Search::from_query)
            .unwrap_or_default();
        let flags = Search::from_params([
            ("uri", self.uri.clone()),
            ("controller", self.controller.clone()),
            ("method", self.method.clone()),
            ("status", self.status.clone()),
            ("time", self.time.clone()),
            ("received", self.received.clone()),
            ("name", self.name.clone()),
            ("type", self.types.clone()),
        ]);

        search.uri.extend(flags.uri);
        search.controller.extend(flags.controller);
        search.method.extend(flags.method);
        search.status.extend(flags.status);
        search.time.extend(flags.time);
        search.received.extend(flags.received);
        search.name.extend(flags.name);
        search.types.extend(flags.types);
        search
    }
}

#[derive(Debug, Clone, PartialEq)]
enum CommandOutcome {
    Stored { id: String, updated: bool },
    Shown(Box<Request>),
    Listed(Vec<Request>),
    CleanedUp { removed: usize },
}

async fn run_command(
    storage: &StorageHandle,
    command: Command,
) -> anyhow::Result<CommandOutcome> {
    match command {
        Command::Import { file, update } => {
            let request = read_request(&file)?;
            let id = request.id.clone();
            if update {
                storage
                    .update(request)
                    .await
                    .with_context(|| format!("update request `{id}`"))?;
            } else {
                storage
                    .store(request)
                    .await
                    .with_context(|| format!("store request `{id}`"))?;
            }
            Ok(CommandOutcome::Stored { id, updated: update })
        }
        Command::Show { id } => match storage.find(&id).await {
            Some(request) => Ok(CommandOutcome::Shown(Box::new(request))),
            None => bail!("request `{id}` was not found"),
        },
        Command::Latest { filter } => Ok(CommandOutcome::Listed(
            storage.latest(filter.to_search()).await.into_iter().collect(),
        )),
        Command::List { limit, filter } => {
            let mut requests = storage.all(filter.to_search()).await;
            if let Some(limit) = limit {
                let newest = requests.len().saturating_sub(limit);
                requests = requests.split_off(newest);
            }
            Ok(CommandOutcome::Listed(requests))
        }
        Command::Previous { id, count, filter } => Ok(CommandOutcome::Listed(
            storage.previous(&id, count, filter.to_search()).await,
        )),
        Command::Next { id, count, filter } => Ok(CommandOutcome::Listed(
            storage.next(&id, count, filter.to_search()).await,
        )),
        Command::Cleanup { force } => {
            let removed = storage.cleanup(force).await.context("clean up requests")?;
            Ok(CommandOutcome::CleanedUp { removed })
        }
    }
}

/// Parses a request document, assigning a fresh id and time when they are missing.
fn read_request(file: &str) -> anyhow::Result<Request> {
    let raw = if file == "-" {
        io::read_to_string(io::stdin()).context("read request from stdin")?
    } else {
        fs::read_to_string(file).with_context(|| format!("read request file {file}"))?
    };
    parse_request(&raw).with_context(|| format!("parse request from {file}"))
}

fn parse_request(raw: &str) -> anyhow::Result<Request> {
    let mut map: Map<String, Value> =
        serde_json::from_str(raw).context("request must be a JSON object")?;

    let has_id = map
        .get("id")
        .and_then(Value::as_str)
        .is_some_and(|id| !id.is_empty());
    if !has_id {
        map.insert("id".to_owned(), Value::String(generate_id()));
    }
    if map.get("time").is_none_or(Value::is_null) {
        map.insert("time".to_owned(), Value::from(now_unix_secs()));
    }

    Request::from_map(map)
}

fn format_summary(request: &Request) -> String {
    let summary = request.summary();
    let dash = || "-".to_owned();
    format!(
        "{}  {}  {}  {}  {}  {}",
        summary.id,
        summary.kind,
        summary.method.unwrap_or_else(dash),
        summary.name.unwrap_or_else(dash),
        summary.status.unwrap_or_else(dash),
        summary
            .duration
            .map(|duration| format!("{duration:.2}ms"))
            .unwrap_or_else(dash)
    )
}

fn print_outcome(outcome: CommandOutcome) -> anyhow::Result<()> {
    match outcome {
        CommandOutcome::Stored { id, updated } => {
            let verb = if updated { "updated" } else { "stored" };
            println!("{verb} request `{id}`");
        }
        CommandOutcome::Shown(request) => {
            let json = serde_json::to_string_pretty(&request.to_value())
                .context("render request JSON")?;
            println!("{json}");
        }
        CommandOutcome::Listed(requests) => {
            for request in &requests {
                println!("{}", format_summary(request));
            }
        }
        CommandOutcome::CleanedUp { removed } => {
            println!("removed {removed} expired requests");
        }
    }
    Ok(())
}

/// Every command runs in a fresh process, so only backends that persist are usable here.
fn open_storage(config: &Config) -> anyhow::Result<StorageHandle> {
    if !config.storage.backend.is_persistent() {
        bail!("the memory backend keeps nothing between runs; use file, sql or redis");
    }
    StorageHandle::from_config(&config.storage)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    logging::init(&config, cli.log_level.as_deref())?;

    let storage = open_storage(&config)?;
    let outcome = run_command(&storage, cli.command).await?;
    print_outcome(outcome)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use clap::Parser;
    use reqvault::{
        config::Config,
        request::{Request, RequestType},
        storage::StorageHandle,
    };

    use super::{
        Cli, Command, CommandOutcome, FilterArgs, format_summary, open_storage, parse_request,
        run_command,
    };

    fn file_storage(path: &Path) -> StorageHandle {
        let config = Config::from_toml_str(&format!(
            r#"
[storage]
backend = "file"
path = "{}"
cleanup_chance = 0.0
"#,
            path.display()
        ))
        .expect("config should parse");
        StorageHandle::from_config(&config.storage).expect("storage should open")
    }

    fn listed_ids(outcome: CommandOutcome) -> Vec<String> {
        match outcome {
            CommandOutcome::Listed(requests) => {
                requests.into_iter().map(|request| request.id).collect()
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    fn http(id: &str, time: f64, status: i64) -> Request {
        let mut request = Request::with_id(id, RequestType::Request, time);
        request.method = Some("GET".to_owned());
        request.uri = Some(format!("/orders/{id}"));
        request.response_status = Some(status);
        request.response_duration = Some(12.5);
        request
    }

    #[test]
    fn global_flags_parse_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "reqvault",
            "previous",
            "abc",
            "--count",
            "5",
            "--status",
            "<400",
            "--type",
            "request",
            "--config",
            "custom.toml",
        ])
        .expect("cli should parse");

        assert_eq!(cli.config.as_deref(), Some(Path::new("custom.toml")));
        let Command::Previous { id, count, filter } = cli.command else {
            panic!("expected previous command");
        };
        assert_eq!(id, "abc");
        assert_eq!(count, Some(5));
        assert_eq!(filter.status, vec!["<400"]);
        assert_eq!(filter.types, vec!["request"]);
    }

    #[test]
    fn filter_flags_and_query_string_merge() {
        let filter = FilterArgs {
            method: vec!["post".to_owned()],
            status: vec!["".to_owned()],
            query: Some("status[]=%3E499&name=orders".to_owned()),
            ..FilterArgs::default()
        };
        let search = filter.to_search();

        assert_eq!(search.method, vec!["post"]);
        assert_eq!(search.status, vec![">499"]);
        assert_eq!(search.name, vec!["orders"]);
        assert!(search.uri.is_empty());
    }

    #[test]
    fn cli_refuses_the_process_local_backend() {
        let config = Config::from_toml_str("[storage]\nbackend = \"memory\"\n").unwrap();
        let err = open_storage(&config).err().expect("memory backend should be refused");
        assert!(err.to_string().contains("memory backend"), "error: {err}");

        let config = Config::from_toml_str("[storage]\nbackend = \"redis\"\n").unwrap();
        assert!(open_storage(&config).is_ok());
    }

    #[test]
    fn import_assigns_missing_id_and_time() {
        let request = parse_request(r#"{ "type": "command", "commandName": "migrate" }"#).unwrap();
        assert!(!request.id.is_empty());
        assert!(request.time > 0.0);
        assert_eq!(request.kind, RequestType::Command);

        let kept = parse_request(r#"{ "id": "12345", "time": 10.5 }"#).unwrap();
        assert_eq!(kept.id, "12345");
        assert_eq!(kept.time, 10.5);

        assert!(parse_request("[1, 2]").is_err());
    }

    #[test]
    fn summary_lines_fill_missing_columns() {
        assert_eq!(
            format_summary(&http("a1", 1.0, 404)),
            "a1  request  GET  /orders/a1  404  12.50ms"
        );
        assert_eq!(
            format_summary(&Request::with_id("c1", RequestType::Command, 1.0)),
            "c1  command  -  -  -  -"
        );
    }

    #[tokio::test]
    async fn list_limit_keeps_the_newest_matches() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = file_storage(temp_dir.path());
        for (index, id) in ["a", "b", "c", "d"].into_iter().enumerate() {
            storage.store(http(id, index as f64, 200)).await.unwrap();
        }

        let outcome = run_command(
            &storage,
            Command::List {
                limit: Some(2),
                filter: FilterArgs::default(),
            },
        )
        .await
        .unwrap();
        assert_eq!(listed_ids(outcome), vec!["c", "d"]);
    }

    #[tokio::test]
    async fn show_reports_missing_requests() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = file_storage(temp_dir.path());

        let err = run_command(&storage, Command::Show { id: "nope".to_owned() })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"), "error: {err}");
    }

    #[tokio::test]
    async fn next_applies_filters() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = file_storage(temp_dir.path());
        storage.store(http("a", 1.0, 200)).await.unwrap();
        storage.store(http("b", 2.0, 500)).await.unwrap();
        storage.store(http("c", 3.0, 200)).await.unwrap();

        let outcome = run_command(
            &storage,
            Command::Next {
                id: "a".to_owned(),
                count: None,
                filter: FilterArgs {
                    status: vec!["200".to_owned()],
                    ..FilterArgs::default()
                },
            },
        )
        .await
        .unwrap();
        assert_eq!(listed_ids(outcome), vec!["c"]);
    }
}
