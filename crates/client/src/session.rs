use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use snafu::{ResultExt, Snafu};

/// Local storage key holding the display name.
pub const SESSION_KEY: &str = "userName";

/// Durable string key/value storage on the local device.
pub trait LocalStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, SessionError>;
    fn set(&self, key: &str, value: &str) -> Result<(), SessionError>;
    fn remove(&self, key: &str) -> Result<(), SessionError>;
}

/// One file per key under `directory`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    directory: PathBuf,
}

impl FileStorage {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.directory.join(key)
    }
}

impl LocalStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, SessionError> {
        let path = self.entry_path(key);
        match std::fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(source).context(ReadEntrySnafu {
                stage: "read-local-entry",
                path,
            }),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SessionError> {
        std::fs::create_dir_all(&self.directory).context(CreateDirSnafu {
            stage: "create-local-storage-directory",
            path: self.directory.clone(),
        })?;

        let path = self.entry_path(key);
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, value).context(WriteEntrySnafu {
            stage: "write-temporary-local-entry",
            path: temp_path.clone(),
        })?;
        std::fs::rename(&temp_path, &path).context(RenameTempFileSnafu {
            stage: "rename-temporary-local-entry",
            from: temp_path,
            to: path,
        })?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SessionError> {
        let path = self.entry_path(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(source).context(RemoveEntrySnafu {
                stage: "remove-local-entry",
                path,
            }),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, SessionError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SessionError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SessionError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Inactive,
    Active { name: String },
}

/// The locally remembered display name.
pub struct Session {
    storage: Arc<dyn LocalStorage>,
    state: SessionState,
}

impl Session {
    /// Restores the persisted name, if any. A stored blank name counts as absent.
    pub fn init(storage: Arc<dyn LocalStorage>) -> Result<Self, SessionError> {
        let state = match storage.get(SESSION_KEY)? {
            Some(name) if !name.trim().is_empty() => SessionState::Active {
                name: name.trim().to_string(),
            },
            _ => SessionState::Inactive,
        };

        if let SessionState::Active { name } = &state {
            tracing::info!(user = %name, "restored session");
        }

        Ok(Self { storage, state })
    }

    /// Stores the trimmed name and returns it.
    pub fn set_name<'a>(&mut self, raw: &'a str) -> Result<&'a str, SessionError> {
        let name = raw.trim();
        if name.is_empty() {
            return EmptyNameSnafu {
                stage: "session-set-name",
            }
            .fail();
        }

        self.storage.set(SESSION_KEY, name)?;
        tracing::info!(user = %name, "session started");
        self.state = SessionState::Active {
            name: name.to_string(),
        };
        Ok(name)
    }

    pub fn clear(&mut self) -> Result<(), SessionError> {
        self.storage.remove(SESSION_KEY)?;
        if let SessionState::Active { name } = &self.state {
            tracing::info!(user = %name, "session cleared");
        }
        self.state = SessionState::Inactive;
        Ok(())
    }

    pub fn name(&self) -> Option<&str> {
        match &self.state {
            SessionState::Active { name } => Some(name),
            SessionState::Inactive => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Active { .. })
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Session")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("display name must not be empty"))]
    EmptyName { stage: &'static str },
    #[snafu(display("failed to create local storage directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to read local entry at {path:?} on `{stage}`: {source}"))]
    ReadEntry {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to write local entry at {path:?} on `{stage}`: {source}"))]
    WriteEntry {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to replace local entry from {from:?} to {to:?} on `{stage}`: {source}"))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to remove local entry at {path:?} on `{stage}`: {source}"))]
    RemoveEntry {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

impl SessionError {
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::EmptyName { .. })
    }
}
