use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::process::SpawnOptions;

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub spawn: SpawnDefaults,

    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Directory that relative paths in this configuration get resolved
    /// against. Filled in with the configuration file's directory on
    /// startup, never read from the file itself.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Config {
    /// Resolves `path` against [`Config::base_dir`]. Absolute paths pass
    /// through unchanged.
    pub fn canonical_path<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_owned()
        } else {
            self.base_dir.join(path)
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Clone)]
pub struct ServerConfig {
    /// Address to listen on. Default: all interfaces.
    #[serde(default = "default_bind")]
    pub bind: IpAddr,

    /// TCP port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// How long shutdown waits for deployments to exit after the orderly
    /// SIGINT before resorting to SIGKILL.
    #[serde(with = "humantime_serde")]
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: Duration,
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    20202
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            bind: default_bind(),
            port: default_port(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Clone)]
pub struct LogConfig {
    #[serde(flatten)]
    pub format: LogFormat,

    #[serde(default)]
    pub output: LogOutput,

    #[serde(default)]
    pub level: LogLevel,
}

impl Default for LogConfig {
    fn default() -> LogConfig {
        LogConfig {
            format: LogFormat::Logfmt {
                print_prefix: false,
            },
            output: Default::default(),
            level: Default::default(),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "format")]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Clone)]
pub enum LogFormat {
    /// One JSON object per log line.
    Json,

    /// Logfmt-style `key=value` lines.
    Logfmt {
        #[serde(default)]
        print_prefix: bool,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Clone)]
pub enum LogOutput {
    Stderr,
    Stdout,
}

impl Default for LogOutput {
    fn default() -> LogOutput {
        LogOutput::Stderr
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl Default for LogLevel {
    fn default() -> LogLevel {
        LogLevel::Info
    }
}

impl From<LogLevel> for slog::Level {
    fn from(level: LogLevel) -> slog::Level {
        match level {
            LogLevel::Debug => slog::Level::Debug,
            LogLevel::Info => slog::Level::Info,
            LogLevel::Warning => slog::Level::Warning,
            LogLevel::Error => slog::Level::Error,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Clone)]
pub struct SpawnDefaults {
    /// Log file template for process output, applied when a start request
    /// brings no template of its own. `%m` expands to the process name,
    /// `%p` to its pid. An empty string turns output capture off.
    #[serde(default = "default_output")]
    pub output: Option<String>,

    /// Directory processes get started in, unless the start request names
    /// its own.
    pub working_directory: Option<PathBuf>,
}

fn default_output() -> Option<String> {
    Some("%m-%p.txt".to_string())
}

impl Default for SpawnDefaults {
    fn default() -> SpawnDefaults {
        SpawnDefaults {
            output: default_output(),
            working_directory: None,
        }
    }
}

impl SpawnDefaults {
    /// The server-side fallback options that start requests get overlaid
    /// onto.
    pub fn options(&self) -> SpawnOptions {
        SpawnOptions {
            output: self.output.clone().filter(|o| !o.is_empty()),
            working_directory: self.working_directory.clone(),
            ..Default::default()
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Clone, Default)]
pub struct CatalogConfig {
    /// Projects whose descriptions this server hands out.
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,

    /// Deployments this server can start.
    #[serde(default)]
    pub deployments: Vec<DeploymentConfig>,

    /// Typekits this server hands out.
    #[serde(default)]
    pub typekits: Vec<TypekitConfig>,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Clone)]
pub struct ProjectConfig {
    pub name: String,

    /// Inline description text. Wins over `description_file`.
    pub description: Option<String>,

    /// File to read the description from, relative to the configuration
    /// file. When neither this nor `description` is given, the server
    /// synthesizes a description from the project's deployments.
    pub description_file: Option<PathBuf>,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Clone)]
pub struct DeploymentConfig {
    pub name: String,

    /// Project the deployment belongs to.
    pub project: String,

    /// Executable to launch, relative to the configuration file.
    pub binary: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,

    /// Task names the deployment registers once it runs.
    #[serde(default)]
    pub tasks: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Clone)]
pub struct TypekitConfig {
    pub name: String,
    pub registry_file: PathBuf,
    pub typelist_file: PathBuf,
}
