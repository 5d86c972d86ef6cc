use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "parlor";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const SETTINGS_ENV_PREFIX: &str = "PARLOR_";
pub const DATABASE_FILE_NAME: &str = "parlor.db";
pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_COPILOT_ENDPOINT: &str = "https://api.openai.com/v1";
pub const DEFAULT_COPILOT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopilotSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_copilot_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_copilot_model")]
    pub model: String,
}

impl Default for CopilotSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            endpoint: default_copilot_endpoint(),
            model: default_copilot_model(),
        }
    }
}

impl CopilotSettings {
    /// Enabled and carrying a key; anything else leaves mentions unanswered.
    pub fn is_usable(&self) -> bool {
        self.enabled && !self.api_key.trim().is_empty()
    }

    fn normalized(mut self) -> Self {
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = self.endpoint.trim().to_string();
        self.model = if self.model.trim().is_empty() {
            default_copilot_model()
        } else {
            self.model.trim().to_string()
        };
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Sqlite file backing the chat collections.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Local durable storage for the session entry.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub copilot: CopilotSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            data_dir: default_data_dir(),
            log_filter: default_log_filter(),
            copilot: CopilotSettings::default(),
        }
    }
}

impl ClientSettings {
    pub fn normalized(mut self) -> Self {
        self.log_filter = if self.log_filter.trim().is_empty() {
            default_log_filter()
        } else {
            self.log_filter.trim().to_string()
        };
        if self.database_path.as_os_str().is_empty() {
            self.database_path = default_database_path();
        }
        if self.data_dir.as_os_str().is_empty() {
            self.data_dir = default_data_dir();
        }
        self.copilot = self.copilot.normalized();
        self
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<ClientSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parlor"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ClientSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: ClientSettings) -> Result<(), SettingsError> {
        let settings = settings.normalized();
        self.persist(&settings)?;
        self.settings.store(Arc::new(settings));
        Ok(())
    }

    /// Flips `copilot.enabled` and saves. Returns the copilot section now in effect.
    pub fn set_copilot_enabled(&self, enabled: bool) -> Result<CopilotSettings, SettingsError> {
        let mut settings = ClientSettings::clone(&self.settings());
        settings.copilot.enabled = enabled;
        self.update(settings)?;
        Ok(self.settings().copilot.clone())
    }

    // Defaults, then the JSON file, then `PARLOR_*` variables (`__` separates nested keys).
    fn load_from_disk(path: &Path) -> ClientSettings {
        let mut figment = Figment::from(Serialized::defaults(ClientSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!(path = ?path, "no settings file, starting from defaults");
        }
        figment = figment.merge(Env::prefixed(SETTINGS_ENV_PREFIX).split("__"));

        match figment.extract::<ClientSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(path = ?path, "ignoring unreadable settings: {error}");
                ClientSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ClientSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "settings-persist-create-dir",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(EncodeSettingsSnafu {
            stage: "settings-persist-serialize",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "settings-persist-write-temp",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "settings-persist-replace",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = ?self.config_path, "settings saved");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("cannot create settings directory {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot encode settings as JSON on `{stage}`: {source}"))]
    EncodeSettings {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("cannot write settings to {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "cannot move settings from {from:?} into {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".parlor"))
}

fn default_database_path() -> PathBuf {
    default_data_dir().join(DATABASE_FILE_NAME)
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

fn default_copilot_endpoint() -> String {
    DEFAULT_COPILOT_ENDPOINT.to_string()
}

fn default_copilot_model() -> String {
    DEFAULT_COPILOT_MODEL.to_string()
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|_jail| {
            let store = SettingsStore::new(PathBuf::from("absent/settings.json"));
            assert_eq!(*store.settings(), ClientSettings::default());
            Ok(())
        });
    }

    #[test]
    fn file_values_layer_over_defaults_and_env_wins() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "settings.json",
                r#"{
                    "database_path": "chats/parlor.db",
                    "log_filter": "  debug  ",
                    "copilot": { "enabled": true, "api_key": " sk-test " }
                }"#,
            )?;
            jail.set_env("PARLOR_LOG_FILTER", "parlor=trace");
            jail.set_env("PARLOR_COPILOT__MODEL", "gpt-4.1");

            let store = SettingsStore::new(PathBuf::from("settings.json"));
            let settings = store.settings();

            assert_eq!(settings.database_path, PathBuf::from("chats/parlor.db"));
            assert_eq!(settings.data_dir, default_data_dir());
            assert_eq!(settings.log_filter, "parlor=trace");
            assert_eq!(settings.copilot.api_key, "sk-test");
            assert_eq!(settings.copilot.model, "gpt-4.1");
            assert_eq!(settings.copilot.endpoint, DEFAULT_COPILOT_ENDPOINT);
            assert!(settings.copilot.is_usable());
            Ok(())
        });
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file("settings.json", "{ not json")?;
            let store = SettingsStore::new(PathBuf::from("settings.json"));
            assert_eq!(*store.settings(), ClientSettings::default());
            Ok(())
        });
    }

    #[test]
    fn update_persists_normalized_settings() {
        Jail::expect_with(|_jail| {
            let store = SettingsStore::new(PathBuf::from("nested/settings.json"));
            let mut changed = ClientSettings::default();
            changed.log_filter = "   ".to_string();
            changed.data_dir = PathBuf::from("local-data");

            store.update(changed).expect("update persists");
            assert_eq!(store.settings().log_filter, DEFAULT_LOG_FILTER);

            let reloaded = SettingsStore::new(PathBuf::from("nested/settings.json"));
            assert_eq!(reloaded.settings().data_dir, PathBuf::from("local-data"));
            assert!(!PathBuf::from("nested/settings.json.tmp").exists());
            Ok(())
        });
    }

    #[test]
    fn copilot_switch_is_saved_and_reloaded() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "settings.json",
                r#"{ "copilot": { "enabled": false, "api_key": "sk-test" } }"#,
            )?;
            let store = SettingsStore::new(PathBuf::from("settings.json"));

            let copilot = store.set_copilot_enabled(true).expect("switch saved");
            assert!(copilot.is_usable());
            assert!(store.settings().copilot.enabled);

            let reloaded = SettingsStore::new(PathBuf::from("settings.json"));
            assert!(reloaded.settings().copilot.enabled);
            assert_eq!(reloaded.settings().copilot.api_key, "sk-test");
            Ok(())
        });
    }
}
