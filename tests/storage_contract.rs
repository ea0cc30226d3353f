//! Behaviour every storage backend must share.

use std::{path::Path, sync::Arc};

use reqvault::{
    config::{Backend, StorageConfig},
    request::{Request, RequestType, now_unix_secs},
    search::Search,
    storage::{self, Expiration, Storage, StorageHandle},
};
use serde_json::json;
use tempfile::tempdir;

const BACKENDS: [Backend; 3] = [Backend::File, Backend::Sql, Backend::Memory];

fn open(backend: Backend, dir: &Path, expiration: Expiration) -> Arc<dyn Storage> {
    let path = match backend {
        Backend::Sql => dir.join("requests.db"),
        Backend::File | Backend::Redis | Backend::Memory => dir.join("requests"),
    };
    storage::open(&StorageConfig {
        backend,
        path,
        expiration,
        cleanup_chance: 0.0,
        ..StorageConfig::default()
    })
    .unwrap_or_else(|err| panic!("{backend:?} storage should open: {err:#}"))
}

fn http(id: &str, time: f64, method: &str, uri: &str, status: i64, duration: f64) -> Request {
    let mut request = Request::with_id(id, RequestType::Request, time);
    request.method = Some(method.to_owned());
    request.uri = Some(uri.to_owned());
    request.controller = Some("App\\Http\\OrderController@index".to_owned());
    request.response_status = Some(status);
    request.response_duration = Some(duration);
    request
}

fn ids(requests: &[Request]) -> Vec<&str> {
    requests.iter().map(|request| request.id.as_str()).collect()
}

/// Ten HTTP requests `r01`..`r10`, one second apart.
fn store_sequence(storage: &dyn Storage) {
    for index in 1..=10 {
        let id = format!("r{index:02}");
        let request = http(&id, 1_000.0 + f64::from(index), "GET", "/items", 200, 10.0);
        storage.store(&request).unwrap();
    }
}

#[test]
fn stored_requests_round_trip() {
    for backend in BACKENDS {
        let dir = tempdir().unwrap();
        let storage = open(backend, dir.path(), Expiration::Off);

        let mut first = http("12345", 1_700_000_000.25, "POST", "/orders", 201, 35.5);
        first
            .data
            .insert("headers".to_owned(), json!({ "content-type": ["application/json"] }));
        first.data.insert(
            "databaseQueries".to_owned(),
            json!([{ "query": "select 1", "duration": 0.4 }]),
        );
        first.data.insert("databaseQueriesCount".to_owned(), json!(1));
        let second = http("67890", 1_700_000_001.5, "GET", "/orders/1", 200, 4.0);

        storage.store(&first).unwrap();
        storage.store(&second).unwrap();

        assert_eq!(
            storage.find("12345").map(|found| found.to_value()),
            Some(first.to_value()),
            "{backend:?}"
        );
        assert_eq!(
            storage.find("67890").map(|found| found.to_value()),
            Some(second.to_value()),
            "{backend:?}"
        );
        assert!(storage.find("00000").is_none(), "{backend:?}");
        assert_eq!(
            storage.latest(&Search::default()).map(|found| found.id),
            Some("67890".to_owned()),
            "{backend:?}"
        );
    }
}

#[test]
fn update_rewrites_without_reordering() {
    for backend in BACKENDS {
        let dir = tempdir().unwrap();
        let storage = open(backend, dir.path(), Expiration::Off);
        storage.store(&http("a", 1.0, "GET", "/a", 200, 1.0)).unwrap();
        storage.store(&http("b", 2.0, "GET", "/b", 200, 1.0)).unwrap();
        storage.store(&http("c", 3.0, "GET", "/c", 200, 1.0)).unwrap();

        let mut updated = http("b", 2.0, "GET", "/b", 500, 9.0);
        updated.data.insert("log".to_owned(), json!([{ "message": "late" }]));
        storage.update(&updated).unwrap();

        assert_eq!(ids(&storage.all(&Search::default())), vec!["a", "b", "c"], "{backend:?}");
        let found = storage.find("b").unwrap();
        assert_eq!(found.response_status, Some(500), "{backend:?}");
        assert_eq!(found.data.get("log"), Some(&json!([{ "message": "late" }])));
    }
}

#[test]
fn pagination_is_chronological_and_bounded_to_the_closest() {
    for backend in BACKENDS {
        let dir = tempdir().unwrap();
        let storage = open(backend, dir.path(), Expiration::Off);
        store_sequence(storage.as_ref());
        let all = Search::default();

        assert_eq!(ids(&storage.previous("r05", Some(2), &all)), vec!["r03", "r04"], "{backend:?}");
        assert_eq!(ids(&storage.next("r05", Some(2), &all)), vec!["r06", "r07"], "{backend:?}");
        assert_eq!(
            ids(&storage.previous("r05", None, &all)),
            vec!["r01", "r02", "r03", "r04"],
            "{backend:?}"
        );
        assert_eq!(ids(&storage.next("r09", None, &all)), vec!["r10"], "{backend:?}");
        assert!(storage.previous("r01", None, &all).is_empty(), "{backend:?}");
        assert!(storage.next("r10", Some(3), &all).is_empty(), "{backend:?}");
        assert!(storage.previous("r05", Some(0), &all).is_empty(), "{backend:?}");
        assert!(storage.next("unknown", None, &all).is_empty(), "{backend:?}");
        assert_eq!(storage.all(&all).len(), 10, "{backend:?}");
        assert_eq!(storage.latest(&all).map(|found| found.id).as_deref(), Some("r10"));
    }
}

#[test]
fn search_filters_agree_across_backends() {
    for backend in BACKENDS {
        let dir = tempdir().unwrap();
        let storage = open(backend, dir.path(), Expiration::Off);

        storage.store(&http("01", 100.0, "GET", "/api/users", 200, 12.0)).unwrap();
        storage.store(&http("02", 200.0, "POST", "/api/users", 422, 80.0)).unwrap();
        storage.store(&http("03", 300.0, "GET", "/api/orders", 500, 250.0)).unwrap();

        let mut command = Request::with_id("04", RequestType::Command, 400.0);
        command.command_name = Some("users:prune".to_owned());
        command.command_exit_code = Some(1);
        storage.store(&command).unwrap();

        let mut job = Request::with_id("05", RequestType::QueueJob, 500.0);
        job.job_name = Some("App\\Jobs\\SyncUsers".to_owned());
        job.job_status = Some("failed".to_owned());
        storage.store(&job).unwrap();

        let mut test = Request::with_id("06", RequestType::Test, 600.0);
        test.test_name = Some("OrdersTest::test_checkout".to_owned());
        test.test_status = Some("passed".to_owned());
        storage.store(&test).unwrap();

        let cases: Vec<(&str, Search, Vec<&str>)> = vec![
            ("empty", Search::default(), vec!["01", "02", "03", "04", "05", "06"]),
            (
                "method",
                Search::from_query("method[]=post"),
                vec!["02", "04", "05", "06"],
            ),
            (
                "uri substring, case-insensitive",
                Search::from_query("uri=USERS"),
                vec!["01", "02", "04", "05", "06"],
            ),
            (
                "status range",
                Search::from_query("status[]=400-600&type[]=request"),
                vec!["02", "03"],
            ),
            (
                "status below",
                Search::from_query("status[]=%3C300&type=request&type=command"),
                vec!["01", "04"],
            ),
            ("exact status", Search::from_query("status=FAILED"), vec!["05"]),
            (
                "name across types",
                Search::from_query("name=users"),
                vec!["01", "02", "04", "05"],
            ),
            ("duration", Search::from_query("time=%3E50"), vec!["02", "03"]),
            (
                "received window",
                Search::from_query("received[]=%3E250&received[]=%3C100"),
                vec!["03", "04", "05", "06"],
            ),
            ("type", Search::from_query("type=test"), vec!["06"]),
            (
                "controller",
                Search::from_query("controller=ordercontroller&type=request"),
                vec!["01", "02", "03"],
            ),
        ];

        for (label, search, expected) in cases {
            assert_eq!(ids(&storage.all(&search)), expected, "{backend:?}: {label}");
        }

        let name_only = Search::from_query("name=users");
        assert_eq!(
            storage.latest(&name_only).map(|found| found.id).as_deref(),
            Some("05"),
            "{backend:?}"
        );
        assert_eq!(
            ids(&storage.previous("05", Some(1), &Search::from_query("status=%3E400"))),
            vec!["03"],
            "{backend:?}"
        );
    }
}

#[test]
fn cleanup_removes_only_expired_requests() {
    for backend in BACKENDS {
        let dir = tempdir().unwrap();
        let storage = open(backend, dir.path(), Expiration::Minutes(60));
        let now = now_unix_secs();
        storage.store(&http("expired-1", now - 7_200.0, "GET", "/", 200, 1.0)).unwrap();
        storage.store(&http("expired-2", now - 3_700.0, "GET", "/", 200, 1.0)).unwrap();
        storage.store(&http("fresh", now - 60.0, "GET", "/", 200, 1.0)).unwrap();

        assert_eq!(storage.cleanup(false).unwrap(), 0, "{backend:?}: chance is zero");
        assert_eq!(storage.cleanup(true).unwrap(), 2, "{backend:?}");

        assert!(storage.find("expired-1").is_none(), "{backend:?}");
        assert!(storage.find("expired-2").is_none(), "{backend:?}");
        assert_eq!(ids(&storage.all(&Search::default())), vec!["fresh"], "{backend:?}");
        assert_eq!(storage.cleanup(true).unwrap(), 0, "{backend:?}");
    }
}

#[test]
fn disabled_expiration_never_deletes() {
    for backend in BACKENDS {
        let dir = tempdir().unwrap();
        let storage = open(backend, dir.path(), Expiration::Off);
        storage.store(&http("ancient", 1.0, "GET", "/", 200, 1.0)).unwrap();

        assert_eq!(storage.cleanup(true).unwrap(), 0, "{backend:?}");
        assert!(storage.find("ancient").is_some(), "{backend:?}");
    }
}

#[tokio::test]
async fn handle_runs_backend_calls_off_the_runtime() {
    for backend in BACKENDS {
        let dir = tempdir().unwrap();
        let handle = StorageHandle::new(open(backend, dir.path(), Expiration::Off));

        handle.store(http("h1", 1.0, "GET", "/", 200, 1.0)).await.unwrap();
        handle.store(http("h2", 2.0, "GET", "/", 200, 1.0)).await.unwrap();

        assert_eq!(handle.find("h1").await.map(|found| found.id).as_deref(), Some("h1"));
        assert_eq!(
            ids(&handle.next("h1", None, Search::default()).await),
            vec!["h2"],
            "{backend:?}"
        );
        assert_eq!(handle.cleanup(true).await.unwrap(), 0, "{backend:?}");
    }
}
