//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::{CacheConfig, DEFAULT_CACHE_VERSION, DEFAULT_FALLBACK, DEFAULT_MANIFEST};

mod cli;

pub use cli::{AgentArgs, AgentOverrides, CliArgs, Command, ServeArgs, SyncArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "stashpoint";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 10;
const DEFAULT_SCOPE: &str = "http://127.0.0.1:3000/";
const DEFAULT_CACHE_DIR: &str = ".stashpoint";
const DEFAULT_NOTIFICATION_TITLE: &str = "Random Saccade";
const DEFAULT_NOTIFICATION_BODY: &str = "Time to train!";
const DEFAULT_NOTIFICATION_ICON: &str = "./icon-512.png";
const DEFAULT_VIBRATE_PATTERN: [u32; 3] = [200, 100, 200];

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub notifications: NotificationSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub cache: CacheConfig,
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageSettings {
    Disk { directory: PathBuf },
    Memory,
}

#[derive(Debug, Clone)]
pub struct NotificationSettings {
    pub title: String,
    pub default_body: String,
    pub icon: Url,
    pub badge: Url,
    pub vibrate: Vec<u32>,
    /// Opened when a notification is clicked.
    pub open_url: Url,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("STASHPOINT")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("cache.manifest")
            .with_list_parse_key("notifications.vibrate")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(args),
        Some(command) => raw.apply_agent_overrides(command.overrides()),
        None => raw.apply_serve_overrides(&ServeArgs::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    agent: RawAgentSettings,
    cache: RawCacheSettings,
    notifications: RawNotificationSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, args: &ServeArgs) {
        if let Some(host) = args.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = args.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = args.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }

        self.apply_agent_overrides(&args.agent);
    }

    fn apply_agent_overrides(&mut self, overrides: &AgentOverrides) {
        if let Some(scope) = overrides.scope.as_ref() {
            self.agent.scope = Some(scope.clone());
        }
        if let Some(version) = overrides.cache_version.as_ref() {
            self.cache.version = Some(version.clone());
        }
        if let Some(directory) = overrides.cache_directory.as_ref() {
            self.cache.directory = Some(directory.clone());
        }
        if let Some(ephemeral) = overrides.ephemeral {
            self.cache.ephemeral = Some(ephemeral);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            agent,
            cache,
            notifications,
        } = raw;

        let scope = build_scope(agent)?;
        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let notifications = build_notification_settings(notifications, &scope)?;
        let cache = build_cache_settings(cache, scope)?;

        Ok(Self {
            server,
            logging,
            cache,
            notifications,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.host", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_scope(agent: RawAgentSettings) -> Result<Url, LoadError> {
    let raw = agent.scope.unwrap_or_else(|| DEFAULT_SCOPE.to_string());
    let trimmed = raw.trim();
    let mut scope = Url::parse(trimmed)
        .map_err(|err| LoadError::invalid("agent.scope", format!("failed to parse: {err}")))?;

    if !matches!(scope.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "agent.scope",
            "must be an absolute http(s) URL",
        ));
    }
    if !scope.path().ends_with('/') {
        let path = format!("{}/", scope.path());
        scope.set_path(&path);
    }
    scope.set_query(None);
    scope.set_fragment(None);

    Ok(scope)
}

fn build_cache_settings(cache: RawCacheSettings, scope: Url) -> Result<CacheSettings, LoadError> {
    let version = cache
        .version
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_CACHE_VERSION.to_string());
    if version.is_empty() {
        return Err(LoadError::invalid("cache.version", "must not be empty"));
    }

    let manifest = cache
        .manifest
        .unwrap_or_else(|| DEFAULT_MANIFEST.iter().map(|s| s.to_string()).collect());
    let fallback = cache
        .fallback
        .unwrap_or_else(|| DEFAULT_FALLBACK.to_string());

    if let Err(err) = scope.join(&fallback) {
        return Err(LoadError::invalid(
            "cache.fallback",
            format!("does not resolve against the scope: {err}"),
        ));
    }

    let config = CacheConfig::resolve(version, scope, &manifest, &fallback).map_err(|err| {
        LoadError::invalid(
            "cache.manifest",
            format!("entry does not resolve against the scope: {err}"),
        )
    })?;

    let storage = if cache.ephemeral.unwrap_or(false) {
        StorageSettings::Memory
    } else {
        let directory = cache
            .directory
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR));
        if directory.as_os_str().is_empty() {
            return Err(LoadError::invalid(
                "cache.directory",
                "path must not be empty",
            ));
        }
        StorageSettings::Disk { directory }
    };

    Ok(CacheSettings {
        cache: config,
        storage,
    })
}

fn build_notification_settings(
    notifications: RawNotificationSettings,
    scope: &Url,
) -> Result<NotificationSettings, LoadError> {
    let resolve = |key: &'static str, value: Option<String>| {
        let value = value.unwrap_or_else(|| DEFAULT_NOTIFICATION_ICON.to_string());
        scope
            .join(&value)
            .map_err(|err| LoadError::invalid(key, format!("failed to resolve: {err}")))
    };

    let icon = resolve("notifications.icon", notifications.icon)?;
    let badge = resolve("notifications.badge", notifications.badge)?;

    Ok(NotificationSettings {
        title: notifications
            .title
            .unwrap_or_else(|| DEFAULT_NOTIFICATION_TITLE.to_string()),
        default_body: notifications
            .default_body
            .unwrap_or_else(|| DEFAULT_NOTIFICATION_BODY.to_string()),
        icon,
        badge,
        vibrate: notifications
            .vibrate
            .unwrap_or_else(|| DEFAULT_VIBRATE_PATTERN.to_vec()),
        open_url: scope.clone(),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawAgentSettings {
    scope: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    version: Option<String>,
    manifest: Option<Vec<String>>,
    fallback: Option<String>,
    directory: Option<PathBuf>,
    ephemeral: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawNotificationSettings {
    title: Option<String>,
    default_body: Option<String>,
    icon: Option<String>,
    badge: Option<String>,
    vibrate: Option<Vec<u32>>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}
