use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub janitor: JanitorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Base URL used in code-view links shown to the operator.
    /// Defaults to `http://{bind}`.
    #[serde(default)]
    pub public_url: Option<String>,
}

impl ServerConfig {
    pub fn base_url(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}", self.bind),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            public_url: None,
        }
    }
}

fn default_bind() -> SocketAddr {
    "127.0.0.1:8377".parse().expect("default bind address")
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./data/skillgate")
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatTransport {
    /// Line-oriented stdin/stdout transport for development.
    Console,
    /// Outbound messages are logged only; no inbound events.
    None,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_transport")]
    pub transport: ChatTransport,
    /// The single operator principal a production transport must restrict
    /// inbound events to. The console transport is inherently local.
    #[serde(default)]
    pub operator: Option<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            operator: None,
        }
    }
}

fn default_transport() -> ChatTransport {
    ChatTransport::Console
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SandboxMode {
    /// Interpreter launched directly — for deployments already inside an
    /// outer isolation boundary.
    Direct,
    /// Interpreter launched under an OS-level isolation wrapper that
    /// understands the allow-list flags.
    Container,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    #[serde(default = "default_sandbox_mode")]
    pub mode: SandboxMode,
    /// Argv prefix that runs a skill file in `direct` mode.
    #[serde(default = "default_interpreter")]
    pub interpreter: Vec<String>,
    /// Argv prefix of the isolation wrapper in `container` mode; the
    /// allow-list and limit flags are appended, then the code path.
    #[serde(default = "default_container_cmd")]
    pub container_cmd: Vec<String>,
    /// Per-invocation working directories (code file + scratch) live here.
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            mode: default_sandbox_mode(),
            interpreter: default_interpreter(),
            container_cmd: default_container_cmd(),
            run_dir: default_run_dir(),
            memory_limit_mb: default_memory_limit_mb(),
            cpu_limit: default_cpu_limit(),
        }
    }
}

fn default_sandbox_mode() -> SandboxMode {
    SandboxMode::Direct
}

fn default_interpreter() -> Vec<String> {
    vec!["python3".to_string()]
}

fn default_container_cmd() -> Vec<String> {
    vec!["skillbox".to_string()]
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("./data/runs")
}

fn default_memory_limit_mb() -> u64 {
    256
}

fn default_cpu_limit() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotifyConfig {
    /// Loopback endpoint that receives `POST {message}` on terminal states.
    #[serde(default = "default_notify_endpoint")]
    pub endpoint: Option<String>,
    /// Append-only fallback file when the POST fails.
    #[serde(default = "default_notify_fallback")]
    pub fallback_file: PathBuf,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            endpoint: default_notify_endpoint(),
            fallback_file: default_notify_fallback(),
        }
    }
}

fn default_notify_endpoint() -> Option<String> {
    Some("http://127.0.0.1:8378/notify".to_string())
}

fn default_notify_fallback() -> PathBuf {
    PathBuf::from("./data/notifications.log")
}

#[derive(Debug, Deserialize, Clone)]
pub struct JanitorConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// When set, terminal requests older than this many hours are reaped.
    /// Unset means keep forever.
    #[serde(default)]
    pub retention_hours: Option<u64>,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            retention_hours: None,
        }
    }
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${NOTIFY_ENDPOINT}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }
}
