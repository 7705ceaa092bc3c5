use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

pub static CONFIG: OnceCell<Config> = OnceCell::new();

pub const CONFIG_FILE: &str = "livesc.toml";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub livesc: String,
    pub rusqlite: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const LIVESC_LEVEL: &str = "info";
    const RUSQLITE_LEVEL: &str = "error";

    fn default() -> Self {
        LoggingConfig {
            livesc: Self::LIVESC_LEVEL.to_string(),
            rusqlite: Self::RUSQLITE_LEVEL.to_string(),
        }
    }

    fn valid_level(name: &str, value: &str, default: &str) -> String {
        let level = value.trim().to_ascii_lowercase();
        if Self::LOG_LEVELS.contains(&level.as_str()) {
            level
        } else {
            eprintln!(
                "Config error: {} log level of '{}' is invalid - using default of '{}'",
                name, value, default
            );
            default.to_owned()
        }
    }

    fn ensure_valid(&mut self) {
        self.livesc = Self::valid_level("livesc", &self.livesc, Self::LIVESC_LEVEL);
        self.rusqlite = Self::valid_level("rusqlite", &self.rusqlite, Self::RUSQLITE_LEVEL);
    }

    /// flexi_logger spec string, e.g. `livesc=info,rusqlite=error`
    pub fn log_spec(&self) -> String {
        format!("livesc={},rusqlite={}", self.livesc, self.rusqlite)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClusterConfig {
    /// This node's name. Empty means the host name.
    pub node: String,
    pub envname: String,
}

impl ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            node: String::new(),
            envname: "livesc".to_owned(),
        }
    }

    fn ensure_valid(&mut self) {
        if self.envname.trim().is_empty() {
            eprintln!("Config error: empty envname - using default of 'livesc'");
            self.envname = "livesc".to_owned();
        }
        if self.node.trim().is_empty() {
            self.node = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned());
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SchemaChangeConfig {
    pub data_stripes: usize,
    /// How long a schema change waits for a record upgrade to stop
    pub cancel_wait_secs: u64,
    pub cancel_poll_secs: u64,
    /// Callers blocked by a resume start warning after this long
    pub resume_warn_ms: u64,
    pub resume_poll_ms: u64,
    /// Directory searched for the `<envname>.scabort` marker. Empty means the data dir.
    pub marker_dir: String,
}

impl SchemaChangeConfig {
    const MAX_STRIPES: usize = 16;

    fn default() -> Self {
        SchemaChangeConfig {
            data_stripes: 8,
            cancel_wait_secs: 10,
            cancel_poll_secs: 1,
            resume_warn_ms: 300,
            resume_poll_ms: 10,
            marker_dir: String::new(),
        }
    }

    fn ensure_valid(&mut self, data_dir: &Path) {
        if self.data_stripes == 0 || self.data_stripes > Self::MAX_STRIPES {
            eprintln!(
                "Config error: data_stripes of {} is invalid (1-{}) - using default of 8",
                self.data_stripes,
                Self::MAX_STRIPES
            );
            self.data_stripes = 8;
        }
        if self.cancel_poll_secs == 0 {
            eprintln!("Config error: cancel_poll_secs must be positive - using 1");
            self.cancel_poll_secs = 1;
        }
        if self.resume_poll_ms == 0 {
            eprintln!("Config error: resume_poll_ms must be positive - using 10");
            self.resume_poll_ms = 10;
        }
        if self.marker_dir.trim().is_empty() {
            self.marker_dir = data_dir.to_string_lossy().into_owned();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StorageConfig {
    /// SQLite metadata file. Empty means `livesc.db` in the data dir.
    pub meta_db: String,
}

impl StorageConfig {
    fn default() -> Self {
        StorageConfig {
            meta_db: String::new(),
        }
    }

    fn ensure_valid(&mut self, data_dir: &Path) {
        if self.meta_db.trim().is_empty() {
            self.meta_db = data_dir.join("livesc.db").to_string_lossy().into_owned();
        }
    }

    pub fn meta_db_path(&self) -> PathBuf {
        PathBuf::from(&self.meta_db)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AdminConfig {
    pub host: String,
    pub port: u16,
}

impl AdminConfig {
    fn default() -> Self {
        AdminConfig {
            host: "127.0.0.1".to_owned(),
            port: 19000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub cluster: ClusterConfig,
    pub schema_change: SchemaChangeConfig,
    pub storage: StorageConfig,
    pub admin: AdminConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: LoggingConfig::default(),
            cluster: ClusterConfig::default(),
            schema_change: SchemaChangeConfig::default(),
            storage: StorageConfig::default(),
            admin: AdminConfig::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from a TOML file located in the app's data
    /// directory, then applies `LIVESC_*` environment overrides (`__`
    /// separates section and key). Writes the defaults to disk if no file
    /// exists. Anything that fails to parse falls back to defaults.
    pub fn load_config(project_dirs: &ProjectDirs) -> Self {
        let data_dir = project_dirs.data_local_dir();
        let config_path = data_dir.join(CONFIG_FILE);
        let default_config = Config::default();

        if !config_path.exists() {
            if let Err(e) = fs::create_dir_all(data_dir) {
                eprintln!(
                    "Failed to create configuration directory {}: {}",
                    data_dir.display(),
                    e
                );
            }
            match toml::to_string_pretty(&default_config) {
                Ok(toml_string) => {
                    if let Err(e) = fs::write(&config_path, toml_string) {
                        eprintln!(
                            "Failed to write default config to {}: {}",
                            config_path.display(),
                            e
                        );
                    }
                }
                Err(_) => eprintln!("Failed to serialize default config."),
            }
        }

        Self::from_figment(Self::figment(&config_path), data_dir)
    }

    fn figment(config_path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("LIVESC_").split("__"))
    }

    fn from_figment(figment: Figment, data_dir: &Path) -> Self {
        let mut config: Config = figment.extract().unwrap_or_else(|err| {
            eprintln!("Could not load configuration: {}. Using default configuration.", err);
            Config::default()
        });
        config.ensure_valid(data_dir);
        config
    }

    fn ensure_valid(&mut self, data_dir: &Path) {
        self.logging.ensure_valid();
        self.cluster.ensure_valid();
        self.schema_change.ensure_valid(data_dir);
        self.storage.ensure_valid(data_dir);
    }

    /// The loaded configuration. Only valid after `CONFIG` was set at startup.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(Config::default)
    }
}
