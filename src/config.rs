use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::Permission;

/// File consulted when `PLAYIT_CONFIG` is not set.
pub const DEFAULT_CONFIG_FILE: &str = "playit.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid baked-in default: {0}")]
    BakedDefault(&'static str),

    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ApplicationSettings {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LibrarySettings {
    /// Root directory of the library; `~/` is expanded.
    pub root: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct IpcSettings {
    pub socket_path: String,
    pub channel_capacity: usize,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct AudioSettings {
    /// `alsa` or `null`
    pub backend: String,
    pub playback_device: String,
    pub sample_rate: u32,
    pub channels: u32,
    /// Period size in frames, 0 lets the device decide.
    pub period_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MetadataSettings {
    pub enabled: bool,
    pub musicbrainz_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct EngineSettings {
    /// Maximum number of previously played recordings kept for `Previous`.
    pub history_limit: usize,
    /// Comma separated permissions granted to every new IPC connection.
    pub default_permissions: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    pub application: ApplicationSettings,
    pub library: LibrarySettings,
    pub ipc: IpcSettings,
    pub audio: AudioSettings,
    pub metadata: MetadataSettings,
    pub engine: EngineSettings,
}

impl Config {
    /// Build the configuration from the values `build.rs` baked in from
    /// `config.toml`.
    pub fn new() -> Result<Self, ConfigError> {
        Ok(Self {
            application: ApplicationSettings {
                name: env!("APP_NAME").to_string(),
                version: env!("APP_VERSION").to_string(),
            },
            library: LibrarySettings {
                root: env!("LIBRARY_ROOT").to_string(),
            },
            ipc: IpcSettings {
                socket_path: env!("IPC_SOCKET_PATH").to_string(),
                channel_capacity: env!("IPC_CHANNEL_CAPACITY")
                    .parse()
                    .map_err(|_| ConfigError::BakedDefault("IPC_CHANNEL_CAPACITY"))?,
                request_timeout_ms: env!("IPC_REQUEST_TIMEOUT_MS")
                    .parse()
                    .map_err(|_| ConfigError::BakedDefault("IPC_REQUEST_TIMEOUT_MS"))?,
            },
            audio: AudioSettings {
                backend: env!("AUDIO_BACKEND").to_string(),
                playback_device: env!("AUDIO_PLAYBACK_DEVICE").to_string(),
                sample_rate: env!("AUDIO_SAMPLE_RATE")
                    .parse()
                    .map_err(|_| ConfigError::BakedDefault("AUDIO_SAMPLE_RATE"))?,
                channels: env!("AUDIO_CHANNELS")
                    .parse()
                    .map_err(|_| ConfigError::BakedDefault("AUDIO_CHANNELS"))?,
                period_size: env!("AUDIO_PERIOD_SIZE")
                    .parse()
                    .map_err(|_| ConfigError::BakedDefault("AUDIO_PERIOD_SIZE"))?,
            },
            metadata: MetadataSettings {
                enabled: env!("METADATA_ENABLED")
                    .parse()
                    .map_err(|_| ConfigError::BakedDefault("METADATA_ENABLED"))?,
                musicbrainz_url: env!("METADATA_MUSICBRAINZ_URL").to_string(),
                user_agent: env!("METADATA_USER_AGENT").to_string(),
                timeout_ms: env!("METADATA_TIMEOUT_MS")
                    .parse()
                    .map_err(|_| ConfigError::BakedDefault("METADATA_TIMEOUT_MS"))?,
            },
            engine: EngineSettings {
                history_limit: env!("ENGINE_HISTORY_LIMIT")
                    .parse()
                    .map_err(|_| ConfigError::BakedDefault("ENGINE_HISTORY_LIMIT"))?,
                default_permissions: env!("ENGINE_DEFAULT_PERMISSIONS").to_string(),
            },
        })
    }

    /// Layer the runtime sources over the baked defaults: the TOML file named
    /// by `PLAYIT_CONFIG` (or `./playit.toml` when present), then
    /// `PLAYIT_<SECTION>__<KEY>` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let file = std::env::var("PLAYIT_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.into());
        Self::load_from(Path::new(&file))
    }

    pub fn load_from(file: &Path) -> Result<Self, ConfigError> {
        let defaults = Self::new()?;

        let settings = ::config::Config::builder()
            .add_source(::config::Config::try_from(&defaults)?)
            .add_source(::config::File::from(file).required(false))
            .add_source(
                ::config::Environment::with_prefix("PLAYIT")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.audio.sample_rate == 0 {
            return Err(ConfigError::Invalid("audio.sample_rate must be positive".into()));
        }
        if self.audio.channels == 0 {
            return Err(ConfigError::Invalid("audio.channels must be positive".into()));
        }
        if self.audio.period_size == 0 {
            return Err(ConfigError::Invalid("audio.period_size must be positive".into()));
        }
        if !matches!(self.audio.backend.as_str(), "alsa" | "null") {
            return Err(ConfigError::Invalid(format!(
                "unknown audio.backend '{}' (expected alsa or null)",
                self.audio.backend
            )));
        }
        if self.ipc.channel_capacity == 0 {
            return Err(ConfigError::Invalid("ipc.channel_capacity must be positive".into()));
        }
        if self.ipc.socket_path.trim().is_empty() {
            return Err(ConfigError::Invalid("ipc.socket_path is empty".into()));
        }
        self.engine.default_permissions()?;
        Ok(())
    }

    pub fn library_root(&self) -> PathBuf {
        expand_home(&self.library.root)
    }

    pub fn socket_path(&self) -> PathBuf {
        expand_home(&self.ipc.socket_path)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.ipc.request_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new().expect("Failed to create default Config from build-time environment variables")
    }
}

impl MetadataSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl EngineSettings {
    pub fn default_permissions(&self) -> Result<Vec<Permission>, ConfigError> {
        let mut permissions = Vec::new();
        for name in self
            .default_permissions
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
        {
            let permission: Permission = name.parse().map_err(ConfigError::Invalid)?;
            if !permissions.contains(&permission) {
                permissions.push(permission);
            }
        }
        Ok(permissions)
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
