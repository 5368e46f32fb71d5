use anyhow::{Context, Result, anyhow, bail, ensure};
use std::{
    fs,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use crate::cleanup::DEFAULT_FALLBACK_DELAY;
use crate::orchestrator::DEFAULT_CONCURRENCY;
use crate::packager::DEFAULT_COMPRESSION_LEVEL;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/newtube-batch-env";
pub const DEFAULT_NEWTUBE_PORT: u16 = 8080;
pub const DEFAULT_NEWTUBE_HOST: &str = "127.0.0.1";
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_RESOLVER_TIMEOUT: Duration = Duration::from_secs(900);

const KNOWN_KEYS: &[&str] = &[
    "NEWTUBE_HOST",
    "NEWTUBE_PORT",
    "WORKSPACE_ROOT",
    "YTDLP_BIN",
    "FFMPEG_BIN",
    "COOKIES_FILE",
    "FETCH_CONCURRENCY",
    "RESOLVER_TIMEOUT_SECS",
    "CLEANUP_DELAY_SECS",
    "COMPRESSION_LEVEL",
];

/// Raw settings from one source. Unset keys stay `None` so layers can be
/// merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvConfig {
    pub newtube_host: Option<String>,
    pub newtube_port: Option<u16>,
    pub workspace_root: Option<PathBuf>,
    pub ytdlp_bin: Option<PathBuf>,
    pub ffmpeg_bin: Option<PathBuf>,
    pub cookies_file: Option<PathBuf>,
    pub fetch_concurrency: Option<usize>,
    pub resolver_timeout_secs: Option<u64>,
    pub cleanup_delay_secs: Option<u64>,
    pub compression_level: Option<u32>,
}

/// Fully resolved settings for the batch server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub workspace_root: PathBuf,
    pub ytdlp_bin: PathBuf,
    /// `FFMPEG_BIN`; `ffmpeg` from `PATH` when unset. Required for audio
    /// batches and for merging video formats. Without it the server still
    /// starts, but audio items fail.
    pub ffmpeg_bin: Option<PathBuf>,
    pub cookies_file: Option<PathBuf>,
    pub fetch_concurrency: usize,
    pub resolver_timeout: Duration,
    pub cleanup_delay: Duration,
    pub compression_level: u32,
}

impl ServiceConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .with_context(|| format!("Parsing NEWTUBE_HOST {:?}", self.host))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_NEWTUBE_HOST.to_string(),
            port: DEFAULT_NEWTUBE_PORT,
            workspace_root: std::env::temp_dir(),
            ytdlp_bin: PathBuf::from(DEFAULT_YTDLP_BIN),
            ffmpeg_bin: None,
            cookies_file: None,
            fetch_concurrency: DEFAULT_CONCURRENCY,
            resolver_timeout: DEFAULT_RESOLVER_TIMEOUT,
            cleanup_delay: DEFAULT_FALLBACK_DELAY,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl EnvConfig {
    /// Parses `KEY=VALUE` pairs. Unknown keys are ignored; empty values leave
    /// the key unset. `origin` names the source in error messages.
    pub fn from_pairs<I, K, V>(pairs: I, origin: &str) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut cfg = EnvConfig::default();
        for (key, value_raw) in pairs {
            let key = key.as_ref().trim();
            let value = value_raw.as_ref().trim().trim_matches('"');
            if value.is_empty() {
                continue;
            }
            match key {
                "NEWTUBE_HOST" => cfg.newtube_host = Some(value.to_string()),
                "NEWTUBE_PORT" => cfg.newtube_port = Some(parse_value(key, value, origin)?),
                "WORKSPACE_ROOT" => cfg.workspace_root = Some(PathBuf::from(value)),
                "YTDLP_BIN" => cfg.ytdlp_bin = Some(PathBuf::from(value)),
                "FFMPEG_BIN" => cfg.ffmpeg_bin = Some(PathBuf::from(value)),
                "COOKIES_FILE" => cfg.cookies_file = Some(PathBuf::from(value)),
                "FETCH_CONCURRENCY" => {
                    cfg.fetch_concurrency = Some(parse_value(key, value, origin)?)
                }
                "RESOLVER_TIMEOUT_SECS" => {
                    cfg.resolver_timeout_secs = Some(parse_value(key, value, origin)?)
                }
                "CLEANUP_DELAY_SECS" => {
                    cfg.cleanup_delay_secs = Some(parse_value(key, value, origin)?)
                }
                "COMPRESSION_LEVEL" => {
                    cfg.compression_level = Some(parse_value(key, value, origin)?)
                }
                _ => {}
            }
        }
        Ok(cfg)
    }

    /// Reads the recognised keys from the process environment.
    pub fn from_process_env() -> Result<Self> {
        let pairs = KNOWN_KEYS
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|value| (*key, value)));
        Self::from_pairs(pairs, "environment")
    }

    /// Values set in `other` win.
    pub fn merge(self, other: EnvConfig) -> EnvConfig {
        EnvConfig {
            newtube_host: other.newtube_host.or(self.newtube_host),
            newtube_port: other.newtube_port.or(self.newtube_port),
            workspace_root: other.workspace_root.or(self.workspace_root),
            ytdlp_bin: other.ytdlp_bin.or(self.ytdlp_bin),
            ffmpeg_bin: other.ffmpeg_bin.or(self.ffmpeg_bin),
            cookies_file: other.cookies_file.or(self.cookies_file),
            fetch_concurrency: other.fetch_concurrency.or(self.fetch_concurrency),
            resolver_timeout_secs: other.resolver_timeout_secs.or(self.resolver_timeout_secs),
            cleanup_delay_secs: other.cleanup_delay_secs.or(self.cleanup_delay_secs),
            compression_level: other.compression_level.or(self.compression_level),
        }
    }

    /// Applies defaults and validates ranges.
    pub fn into_service_config(self) -> Result<ServiceConfig> {
        let defaults = ServiceConfig::default();
        let fetch_concurrency = self.fetch_concurrency.unwrap_or(defaults.fetch_concurrency);
        ensure!(fetch_concurrency >= 1, "FETCH_CONCURRENCY must be at least 1");
        let resolver_timeout = self
            .resolver_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.resolver_timeout);
        ensure!(
            !resolver_timeout.is_zero(),
            "RESOLVER_TIMEOUT_SECS must be at least 1"
        );
        let compression_level = self.compression_level.unwrap_or(defaults.compression_level);
        if compression_level > 9 {
            bail!("COMPRESSION_LEVEL must be between 0 and 9, got {compression_level}");
        }

        Ok(ServiceConfig {
            host: self.newtube_host.unwrap_or(defaults.host),
            port: self.newtube_port.unwrap_or(defaults.port),
            workspace_root: self.workspace_root.unwrap_or(defaults.workspace_root),
            ytdlp_bin: self.ytdlp_bin.unwrap_or(defaults.ytdlp_bin),
            ffmpeg_bin: self.ffmpeg_bin,
            cookies_file: self.cookies_file,
            fetch_concurrency,
            resolver_timeout,
            cleanup_delay: self
                .cleanup_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.cleanup_delay),
            compression_level,
        })
    }
}

fn parse_value<T>(key: &str, value: &str, origin: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("Parsing {key} from {origin}"))
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let pairs = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='));
    EnvConfig::from_pairs(pairs, &path.display().to_string()).map(Some)
}

/// File layer then process environment. An explicitly requested file must
/// exist; the default one is optional.
pub fn load_env_layers(explicit: Option<&Path>) -> Result<EnvConfig> {
    let file = match explicit {
        Some(path) => read_env_config(path)?
            .ok_or_else(|| anyhow!("Missing config file at {}", path.display()))?,
        None => read_env_config(Path::new(DEFAULT_CONFIG_PATH))?.unwrap_or_default(),
    };
    Ok(file.merge(EnvConfig::from_process_env()?))
}
