//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::EngineError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// On-disk layout of the engine
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Uploaded deployment packages
    pub fn uploads_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("uploads"))
    }

    /// Monitoring agent bundles
    pub fn agent_bundle_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("agent"))
    }

    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Create the directories
    pub async fn setup(&self) -> Result<(), EngineError> {
        self.uploads_dir().create().await?;
        self.agent_bundle_dir().create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::new("/etc/opspro")
    }
}
