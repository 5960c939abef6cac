//! Configuration module for reuseport-echo.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.
//!
//! The binary runs in one of three roles (`supervisor`, `worker`, `client`),
//! chosen by subcommand. Each role resolves to its own config struct.

use crate::supervisor::RestartPolicy;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "reuseport-echo")]
#[command(author = "reuseport-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A supervised pool of TCP echo workers", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Role to run as (defaults to supervisor)
    #[command(subcommand)]
    pub role: Option<RoleArgs>,
}

#[derive(Subcommand, Debug)]
pub enum RoleArgs {
    /// Start the worker pool and keep it at full strength
    Supervisor(SupervisorArgs),
    /// Accept and echo connections on the shared port
    Worker(ServerArgs),
    /// Connect, send one message and log the replies
    Client(ClientArgs),
}

/// Listener settings shared by the supervisor and its workers
#[derive(Args, Debug, Default, Clone)]
pub struct ServerArgs {
    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Text written before every echoed chunk (e.g. "Echo from server: ")
    #[arg(long, allow_hyphen_values = true)]
    pub reply_prefix: Option<String>,

    /// Maximum concurrent connections per worker
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Read buffer size in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<u32>,
}

#[derive(Args, Debug, Default, Clone)]
pub struct SupervisorArgs {
    #[command(flatten)]
    pub server: ServerArgs,

    /// Number of worker processes (defaults to number of CPU cores)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Restart policy for exited workers
    #[arg(long, value_enum)]
    pub restart: Option<RestartKind>,

    /// First backoff delay in milliseconds
    #[arg(long)]
    pub backoff_initial_ms: Option<u64>,

    /// Backoff ceiling in milliseconds
    #[arg(long)]
    pub backoff_max_ms: Option<u64>,

    /// Uptime in milliseconds after which a worker exit no longer counts as a crash loop
    #[arg(long)]
    pub stable_after_ms: Option<u64>,
}

#[derive(Args, Debug, Default, Clone)]
pub struct ClientArgs {
    /// Server host to connect to
    #[arg(long)]
    pub host: Option<String>,

    /// Server port to connect to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Message sent once after connecting
    #[arg(short, long)]
    pub message: Option<String>,

    /// Close the connection after this many milliseconds (0 = wait for the server)
    #[arg(long)]
    pub linger_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartKind {
    /// Respawn immediately, forever
    Immediate,
    /// Exponential delay for workers that keep crashing
    Backoff,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of worker processes
    pub workers: Option<usize>,
    #[serde(default)]
    pub reply_prefix: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: None,
            reply_prefix: String::new(),
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
            backlog: default_backlog(),
        }
    }
}

/// Restart policy configuration
#[derive(Debug, Deserialize)]
pub struct SupervisorSection {
    #[serde(default = "default_restart")]
    pub restart: RestartKind,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_stable_after_ms")]
    pub stable_after_ms: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            restart: default_restart(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            stable_after_ms: default_stable_after_ms(),
        }
    }
}

/// Test client configuration
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_client_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_message")]
    pub message: String,
    #[serde(default)]
    pub linger_ms: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            host: default_client_host(),
            port: default_port(),
            message: default_message(),
            linger_ms: 0,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_client_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_max_connections() -> usize {
    10_000
}

fn default_buffer_size() -> usize {
    16 * 1024 // 16 KB
}

fn default_backlog() -> u32 {
    1024
}

fn default_restart() -> RestartKind {
    RestartKind::Immediate
}

fn default_backoff_initial_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_stable_after_ms() -> u64 {
    5_000
}

fn default_message() -> String {
    "Hello, server!".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Settings for one worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub host: String,
    pub port: u16,
    pub reply_prefix: String,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub backlog: u32,
}

impl WorkerConfig {
    /// Resolve the listen address. Host names are resolved and the first
    /// result is used.
    pub fn addr(&self) -> Result<SocketAddr, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidAddress {
            host: self.host.clone(),
            port: self.port,
            reason,
        };
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| invalid(e.to_string()))?
            .next()
            .ok_or_else(|| invalid("no address found".to_string()))
    }

    /// Command-line arguments that reproduce this config in a `worker` subprocess.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--host".to_string(),
            self.host.clone(),
            "--port".to_string(),
            self.port.to_string(),
            "--max-connections".to_string(),
            self.max_connections.to_string(),
            "--buffer-size".to_string(),
            self.buffer_size.to_string(),
            "--backlog".to_string(),
            self.backlog.to_string(),
        ];
        if !self.reply_prefix.is_empty() {
            args.push(format!("--reply-prefix={}", self.reply_prefix));
        }
        args
    }

    fn resolve(cli: ServerArgs, toml: &ServerSection) -> Result<Self, ConfigError> {
        let config = WorkerConfig {
            host: cli.host.unwrap_or_else(|| toml.host.clone()),
            port: cli.port.unwrap_or(toml.port),
            reply_prefix: cli
                .reply_prefix
                .unwrap_or_else(|| toml.reply_prefix.clone()),
            max_connections: cli.max_connections.unwrap_or(toml.max_connections),
            buffer_size: cli.buffer_size.unwrap_or(toml.buffer_size),
            backlog: cli.backlog.unwrap_or(toml.backlog),
        };
        if config.buffer_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "buffer_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        if config.max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_connections",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(config)
    }
}

/// Settings for the pool manager.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub worker: WorkerConfig,
    pub workers: usize,
    pub restart: RestartPolicy,
}

/// Settings for the test client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub message: String,
    pub linger: Option<Duration>,
}

/// The role this process runs as, with its resolved settings.
#[derive(Debug, Clone)]
pub enum Role {
    Supervisor(SupervisorConfig),
    Worker(WorkerConfig),
    Client(ClientConfig),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at (if any).
    /// CLI arguments take precedence over TOML file values.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents =
                std::fs::read_to_string(config_path).map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        let log_level = if cli.log_level != "info" {
            cli.log_level
        } else {
            toml_config.logging.level.clone()
        };

        let role = match cli
            .role
            .unwrap_or_else(|| RoleArgs::Supervisor(SupervisorArgs::default()))
        {
            RoleArgs::Supervisor(args) => {
                Role::Supervisor(resolve_supervisor(args, &toml_config)?)
            }
            RoleArgs::Worker(args) => {
                Role::Worker(WorkerConfig::resolve(args, &toml_config.server)?)
            }
            RoleArgs::Client(args) => Role::Client(resolve_client(args, &toml_config.client)),
        };

        Ok(Config { role, log_level })
    }
}

fn resolve_supervisor(
    args: SupervisorArgs,
    toml: &TomlConfig,
) -> Result<SupervisorConfig, ConfigError> {
    let section = &toml.supervisor;
    let workers = args
        .workers
        .or(toml.server.workers)
        .unwrap_or_else(num_cpus);
    if workers == 0 {
        return Err(ConfigError::InvalidValue {
            field: "workers",
            reason: "at least one worker is required".to_string(),
        });
    }

    let restart = match args.restart.unwrap_or(section.restart) {
        RestartKind::Immediate => RestartPolicy::Immediate,
        RestartKind::Backoff => {
            let initial = args.backoff_initial_ms.unwrap_or(section.backoff_initial_ms);
            let max = args.backoff_max_ms.unwrap_or(section.backoff_max_ms);
            if initial > max {
                return Err(ConfigError::InvalidValue {
                    field: "backoff_initial_ms",
                    reason: format!("{initial} exceeds backoff_max_ms {max}"),
                });
            }
            RestartPolicy::Backoff {
                initial: Duration::from_millis(initial),
                max: Duration::from_millis(max),
                stable_after: Duration::from_millis(
                    args.stable_after_ms.unwrap_or(section.stable_after_ms),
                ),
            }
        }
    };

    Ok(SupervisorConfig {
        worker: WorkerConfig::resolve(args.server, &toml.server)?,
        workers,
        restart,
    })
}

fn resolve_client(args: ClientArgs, toml: &ClientSection) -> ClientConfig {
    let linger_ms = args.linger_ms.unwrap_or(toml.linger_ms);
    ClientConfig {
        host: args.host.unwrap_or_else(|| toml.host.clone()),
        port: args.port.unwrap_or(toml.port),
        message: args.message.unwrap_or_else(|| toml.message.clone()),
        linger: (linger_ms > 0).then(|| Duration::from_millis(linger_ms)),
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{}': {source}", path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid listen address '{host}:{port}': {reason}")]
    InvalidAddress {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> Config {
        let cli = CliArgs::try_parse_from(args).unwrap();
        Config::from_cli(cli).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.reply_prefix, "");
        assert_eq!(config.supervisor.restart, RestartKind::Immediate);
        assert_eq!(config.client.host, "localhost");
        assert_eq!(config.client.message, "Hello, server!");
    }

    #[test]
    fn test_no_subcommand_runs_supervisor() {
        let config = parse(&["reuseport-echo"]);
        match config.role {
            Role::Supervisor(sup) => {
                assert_eq!(sup.worker.port, 8000);
                assert_eq!(sup.workers, num_cpus());
                assert_eq!(sup.restart, RestartPolicy::Immediate);
            }
            other => panic!("unexpected role: {:?}", other),
        }
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 9000
            workers = 4
            reply_prefix = "Echo from server: "

            [supervisor]
            restart = "backoff"
            backoff_initial_ms = 50
            backoff_max_ms = 1000

            [client]
            message = "ping"
            linger_ms = 250

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.server.reply_prefix, "Echo from server: ");
        assert_eq!(config.supervisor.restart, RestartKind::Backoff);
        assert_eq!(config.supervisor.backoff_initial_ms, 50);
        assert_eq!(config.supervisor.stable_after_ms, 5_000);
        assert_eq!(config.client.message, "ping");
        assert_eq!(config.client.port, 8000);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile_path("cli_overrides");
        writeln!(
            file.1,
            "[server]\nport = 9100\nworkers = 3\n[logging]\nlevel = \"warn\""
        )
        .unwrap();

        let path = file.0.to_str().unwrap().to_string();
        let config = parse(&[
            "reuseport-echo",
            "--config",
            &path,
            "supervisor",
            "--port",
            "9200",
            "--restart",
            "backoff",
        ]);
        assert_eq!(config.log_level, "warn");
        match config.role {
            Role::Supervisor(sup) => {
                assert_eq!(sup.worker.port, 9200);
                assert_eq!(sup.workers, 3);
                assert!(matches!(sup.restart, RestartPolicy::Backoff { .. }));
            }
            other => panic!("unexpected role: {:?}", other),
        }
        std::fs::remove_file(&file.0).unwrap();
    }

    #[test]
    fn test_worker_args_round_trip() {
        let worker = WorkerConfig {
            host: "127.0.0.1".to_string(),
            port: 8123,
            reply_prefix: "Echo from server: ".to_string(),
            max_connections: 64,
            buffer_size: 4096,
            backlog: 128,
        };

        let mut argv = vec!["reuseport-echo".to_string(), "worker".to_string()];
        argv.extend(worker.to_args());
        let cli = CliArgs::try_parse_from(argv).unwrap();
        match Config::from_cli(cli).unwrap().role {
            Role::Worker(parsed) => assert_eq!(parsed, worker),
            other => panic!("unexpected role: {:?}", other),
        }
    }

    #[test]
    fn test_client_defaults_and_linger() {
        match parse(&["reuseport-echo", "client"]).role {
            Role::Client(client) => {
                assert_eq!(client.host, "localhost");
                assert_eq!(client.port, 8000);
                assert_eq!(client.message, "Hello, server!");
                assert_eq!(client.linger, None);
            }
            other => panic!("unexpected role: {:?}", other),
        }

        match parse(&["reuseport-echo", "client", "--linger-ms", "1500"]).role {
            Role::Client(client) => {
                assert_eq!(client.linger, Some(Duration::from_millis(1500)))
            }
            other => panic!("unexpected role: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_zero_workers() {
        let cli = CliArgs::try_parse_from(["reuseport-echo", "supervisor", "--workers", "0"])
            .unwrap();
        let err = Config::from_cli(cli).unwrap_err();
        assert!(err.to_string().contains("workers"));
    }

    #[test]
    fn test_missing_config_file() {
        let cli = CliArgs::try_parse_from([
            "reuseport-echo",
            "--config",
            "/nonexistent/reuseport-echo.toml",
        ])
        .unwrap();
        assert!(matches!(
            Config::from_cli(cli),
            Err(ConfigError::FileRead { .. })
        ));
    }

    #[test]
    fn test_worker_addr() {
        let worker = WorkerConfig {
            host: "127.0.0.1".to_string(),
            port: 8000,
            reply_prefix: String::new(),
            max_connections: 1,
            buffer_size: 1,
            backlog: 1,
        };
        assert_eq!(worker.addr().unwrap(), "127.0.0.1:8000".parse().unwrap());
    }

    fn tempfile_path(name: &str) -> (PathBuf, std::fs::File) {
        let path = std::env::temp_dir().join(format!(
            "reuseport-echo-{}-{}.toml",
            name,
            std::process::id()
        ));
        let file = std::fs::File::create(&path).unwrap();
        (path, file)
    }
}
