use std::collections::HashMap;

use super::*;

fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| vars.get(key).cloned()
}

#[test]
fn defaults_apply_without_file_or_env() {
    let settings = resolve_settings(None, env_from(&[])).expect("settings");
    assert_eq!(settings.bind_addr, "127.0.0.1:8080");
    assert_eq!(settings.outbound_queue_capacity, 256);
    assert_eq!(settings.command_queue_capacity, 1024);
    assert_eq!(settings.ping_interval(), Duration::from_secs(54));
    assert_eq!(settings.write_timeout(), Duration::from_secs(10));
    assert_eq!(settings.sync_page_limit, 500);
    assert_eq!(settings.push_max_recipients, 100);
    assert_eq!(settings.push_summary_max_chars, 100);
    assert!(settings.push_webhook_url.is_none());
    assert!(settings.presence_peers.is_empty());
}

#[test]
fn environment_overrides_file() {
    let file = r#"
        bind_addr = "0.0.0.0:9000"
        node_id = 3
        ping_interval_secs = 30
        presence_peers = ["http://10.0.0.2:8080/"]
    "#;
    let settings = resolve_settings(
        Some(file),
        env_from(&[
            ("SERVER_BIND", "0.0.0.0:9100"),
            ("APP__BIND_ADDR", "0.0.0.0:9200"),
            ("APP__NODE_ID", "7"),
            ("APP__PRESENCE_PEERS", "http://a:1/, http://b:2/"),
            ("APP__PUSH_WEBHOOK_URL", "https://push.example/hook"),
        ]),
    )
    .expect("settings");

    assert_eq!(settings.bind_addr, "0.0.0.0:9200");
    assert_eq!(settings.node_id, 7);
    assert_eq!(settings.ping_interval_secs, 30);
    let peers: Vec<&str> = settings.presence_peers.iter().map(Url::as_str).collect();
    assert_eq!(peers, vec!["http://a:1/", "http://b:2/"]);
    assert_eq!(
        settings.push_webhook_url.as_ref().map(Url::as_str),
        Some("https://push.example/hook")
    );
}

#[test]
fn rejects_invalid_values() {
    assert!(resolve_settings(None, env_from(&[("APP__NODE_ID", "4096")])).is_err());
    assert!(resolve_settings(None, env_from(&[("APP__OUTBOUND_QUEUE_CAPACITY", "0")])).is_err());
    assert!(resolve_settings(None, env_from(&[("APP__SYNC_PAGE_LIMIT", "lots")])).is_err());
    assert!(resolve_settings(None, env_from(&[("APP__WRITE_TIMEOUT_SECS", "0")])).is_err());
    assert!(resolve_settings(None, env_from(&[("APP__PRESENCE_PEERS", "not a url")])).is_err());
    assert!(resolve_settings(Some("bogus_key = 1"), env_from(&[])).is_err());
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    assert_eq!(
        normalize_database_url("  "),
        Settings::default().database_url
    );
}

#[test]
fn creates_parent_dir_for_sqlite_url() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("data").join("test.db");

    prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare db url");
    assert!(temp_root.path().join("data").exists());
}

#[tokio::test]
async fn prepared_database_url_creates_openable_sqlite_file() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("server.db");

    let prepared = prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare");
    let storage = storage::Storage::new(&prepared).await.expect("open sqlite");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should be created: {}",
        db_path.display()
    );
}
