use crate::StoreError;
use std::fs;
use std::path::{Path, PathBuf};

/// Directory layout for persisted engine state.
///
/// ```text
/// <root>/keel.toml          engine configuration (optional)
/// <root>/state/state.json   the serialized state graph
/// <root>/state/.lock        single-process ownership lock
/// ```
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    #[inline]
    pub fn state_file(&self) -> PathBuf {
        self.state_dir().join("state.json")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.state_dir().join(".lock")
    }

    #[inline]
    pub fn config_file(&self) -> PathBuf {
        self.root.join("keel.toml")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.state_dir())?;
        Ok(())
    }
}
