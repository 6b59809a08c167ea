use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{bail, Context};
use serde::Deserialize;
use url::Url;

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub database_url: String,
    pub node_id: i64,
    pub outbound_queue_capacity: usize,
    pub command_queue_capacity: usize,
    pub ping_interval_secs: u64,
    pub write_timeout_secs: u64,
    pub sync_page_limit: u32,
    pub push_max_recipients: usize,
    pub push_summary_max_chars: usize,
    pub push_webhook_url: Option<Url>,
    pub presence_peers: Vec<Url>,
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".into(),
            database_url: "sqlite://./data/chat.db".into(),
            node_id: 0,
            outbound_queue_capacity: 256,
            command_queue_capacity: 1024,
            ping_interval_secs: 54,
            write_timeout_secs: 10,
            sync_page_limit: 500,
            push_max_recipients: 100,
            push_summary_max_chars: 100,
            push_webhook_url: None,
            presence_peers: Vec::new(),
            log_filter: "info".into(),
        }
    }
}

impl Settings {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(0..=1023).contains(&self.node_id) {
            bail!("node_id must be within 0..=1023, got {}", self.node_id);
        }
        if self.outbound_queue_capacity == 0 || self.command_queue_capacity == 0 {
            bail!("queue capacities must be positive");
        }
        if self.ping_interval_secs == 0 || self.write_timeout_secs == 0 {
            bail!("ping_interval_secs and write_timeout_secs must be positive");
        }
        if self.sync_page_limit == 0 {
            bail!("sync_page_limit must be positive");
        }
        Ok(())
    }
}

/// Keys accepted in `server.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    bind_addr: Option<String>,
    database_url: Option<String>,
    node_id: Option<i64>,
    outbound_queue_capacity: Option<usize>,
    command_queue_capacity: Option<usize>,
    ping_interval_secs: Option<u64>,
    write_timeout_secs: Option<u64>,
    sync_page_limit: Option<u32>,
    push_max_recipients: Option<usize>,
    push_summary_max_chars: Option<usize>,
    push_webhook_url: Option<String>,
    presence_peers: Option<Vec<String>>,
    log_filter: Option<String>,
}

/// Defaults, then `server.toml` in the working directory, then environment.
pub fn load_settings() -> anyhow::Result<Settings> {
    let file = match fs::read_to_string("server.toml") {
        Ok(raw) => Some(raw),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => return Err(err).context("failed to read server.toml"),
    };
    resolve_settings(file.as_deref(), |key| std::env::var(key).ok())
}

fn resolve_settings(
    file: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    if let Some(raw) = file {
        let file_cfg: FileSettings = toml::from_str(raw).context("invalid server.toml")?;
        apply_file(&mut settings, file_cfg)?;
    }

    if let Some(v) = env("SERVER_BIND") {
        settings.bind_addr = v;
    }
    if let Some(v) = env("APP__BIND_ADDR") {
        settings.bind_addr = v;
    }
    if let Some(v) = env("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__NODE_ID") {
        settings.node_id = parse_env("APP__NODE_ID", &v)?;
    }
    if let Some(v) = env("APP__OUTBOUND_QUEUE_CAPACITY") {
        settings.outbound_queue_capacity = parse_env("APP__OUTBOUND_QUEUE_CAPACITY", &v)?;
    }
    if let Some(v) = env("APP__COMMAND_QUEUE_CAPACITY") {
        settings.command_queue_capacity = parse_env("APP__COMMAND_QUEUE_CAPACITY", &v)?;
    }
    if let Some(v) = env("APP__PING_INTERVAL_SECS") {
        settings.ping_interval_secs = parse_env("APP__PING_INTERVAL_SECS", &v)?;
    }
    if let Some(v) = env("APP__WRITE_TIMEOUT_SECS") {
        settings.write_timeout_secs = parse_env("APP__WRITE_TIMEOUT_SECS", &v)?;
    }
    if let Some(v) = env("APP__SYNC_PAGE_LIMIT") {
        settings.sync_page_limit = parse_env("APP__SYNC_PAGE_LIMIT", &v)?;
    }
    if let Some(v) = env("APP__PUSH_MAX_RECIPIENTS") {
        settings.push_max_recipients = parse_env("APP__PUSH_MAX_RECIPIENTS", &v)?;
    }
    if let Some(v) = env("APP__PUSH_SUMMARY_MAX_CHARS") {
        settings.push_summary_max_chars = parse_env("APP__PUSH_SUMMARY_MAX_CHARS", &v)?;
    }
    if let Some(v) = env("APP__PUSH_WEBHOOK_URL") {
        settings.push_webhook_url = parse_optional_url(&v)?;
    }
    if let Some(v) = env("APP__PRESENCE_PEERS") {
        settings.presence_peers = parse_peers(v.split(','))?;
    }
    if let Some(v) = env("APP__LOG_FILTER") {
        settings.log_filter = v;
    }

    settings.validate()?;
    Ok(settings)
}

fn apply_file(settings: &mut Settings, file: FileSettings) -> anyhow::Result<()> {
    if let Some(v) = file.bind_addr {
        settings.bind_addr = v;
    }
    if let Some(v) = file.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file.node_id {
        settings.node_id = v;
    }
    if let Some(v) = file.outbound_queue_capacity {
        settings.outbound_queue_capacity = v;
    }
    if let Some(v) = file.command_queue_capacity {
        settings.command_queue_capacity = v;
    }
    if let Some(v) = file.ping_interval_secs {
        settings.ping_interval_secs = v;
    }
    if let Some(v) = file.write_timeout_secs {
        settings.write_timeout_secs = v;
    }
    if let Some(v) = file.sync_page_limit {
        settings.sync_page_limit = v;
    }
    if let Some(v) = file.push_max_recipients {
        settings.push_max_recipients = v;
    }
    if let Some(v) = file.push_summary_max_chars {
        settings.push_summary_max_chars = v;
    }
    if let Some(v) = file.push_webhook_url {
        settings.push_webhook_url = parse_optional_url(&v)?;
    }
    if let Some(peers) = file.presence_peers {
        settings.presence_peers = parse_peers(peers.iter().map(String::as_str))?;
    }
    if let Some(v) = file.log_filter {
        settings.log_filter = v;
    }
    Ok(())
}

fn parse_env<T>(key: &str, raw: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("invalid value for {key}: '{raw}'"))
}

fn parse_optional_url(raw: &str) -> anyhow::Result<Option<Url>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    Url::parse(raw)
        .map(Some)
        .with_context(|| format!("invalid url '{raw}'"))
}

fn parse_peers<'a>(raw: impl Iterator<Item = &'a str>) -> anyhow::Result<Vec<Url>> {
    raw.map(str::trim)
        .filter(|peer| !peer.is_empty())
        .map(|peer| Url::parse(peer).with_context(|| format!("invalid presence peer '{peer}'")))
        .collect()
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite:{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
