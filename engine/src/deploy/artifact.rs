//! Uploaded deployment packages

use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use serde::Serialize;
use tracing::{info, warn};

use crate::errors::EngineError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::utils::generate_uuid;

const SITE_ENTRY: &str = "index.html";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactFormat {
    Zip,
    TarGz,
    Tar,
}

impl ArtifactFormat {
    pub fn from_filename(filename: &str) -> Result<Self, EngineError> {
        let lower = filename.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Ok(ArtifactFormat::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Ok(ArtifactFormat::TarGz)
        } else if lower.ends_with(".tar") {
            Ok(ArtifactFormat::Tar)
        } else {
            Err(EngineError::ValidationError(format!(
                "unsupported package '{}': expected .zip, .tar.gz or .tar",
                filename
            )))
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactFormat::Zip => "zip",
            ArtifactFormat::TarGz => "tar.gz",
            ArtifactFormat::Tar => "tar",
        }
    }

    /// Remote command extracting `archive` into `dest`
    pub fn extract_command(&self, archive: &str, dest: &str) -> String {
        match self {
            ArtifactFormat::Zip => format!("unzip -oq {} -d {}", archive, dest),
            ArtifactFormat::TarGz => format!("tar -xzf {} -C {}", archive, dest),
            ArtifactFormat::Tar => format!("tar -xf {} -C {}", archive, dest),
        }
    }

    const ALL: [ArtifactFormat; 3] = [ArtifactFormat::Zip, ArtifactFormat::TarGz, ArtifactFormat::Tar];
}

/// A stored, validated package
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    pub id: String,
    pub format: ArtifactFormat,
    pub size: u64,
    #[serde(skip)]
    pub path: PathBuf,
}

impl Artifact {
    pub async fn read(&self) -> Result<Vec<u8>, EngineError> {
        File::new(&self.path).read_bytes().await
    }
}

pub struct ArtifactStore {
    dir: Dir,
}

impl ArtifactStore {
    pub fn new(dir: Dir) -> Self {
        Self { dir }
    }

    /// Validate and persist an uploaded package
    pub async fn save(&self, filename: &str, contents: Vec<u8>) -> Result<Artifact, EngineError> {
        let format = ArtifactFormat::from_filename(filename)?;
        let contents = validate_blocking(format, contents).await?;

        let id: String = generate_uuid().replace('-', "").chars().take(12).collect();
        self.dir.create().await?;
        let file = self.dir.file(&format!("{}.{}", id, format.extension()));
        file.write_atomic(&contents).await?;

        info!(artifact = %id, %filename, size = contents.len(), "Stored deployment package");
        Ok(Artifact {
            id,
            format,
            size: contents.len() as u64,
            path: file.path().to_path_buf(),
        })
    }

    /// Look up a stored package
    pub async fn get(&self, id: &str) -> Result<Artifact, EngineError> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(EngineError::ValidationError(format!("invalid artifact id '{}'", id)));
        }
        for format in ArtifactFormat::ALL {
            let file = self.dir.file(&format!("{}.{}", id, format.extension()));
            if file.exists().await {
                return Ok(Artifact {
                    id: id.to_string(),
                    format,
                    size: file.size().await?,
                    path: file.path().to_path_buf(),
                });
            }
        }
        Err(EngineError::NotFound(format!("artifact {}", id)))
    }

    /// Load and re-check a package before it goes anywhere near a host
    pub async fn load_validated(&self, id: &str) -> Result<(Artifact, Vec<u8>), EngineError> {
        let artifact = self.get(id).await?;
        let contents = artifact.read().await?;
        let contents = validate_blocking(artifact.format, contents).await?;
        Ok((artifact, contents))
    }

    pub async fn remove(&self, id: &str) -> Result<(), EngineError> {
        let artifact = self.get(id).await?;
        File::new(&artifact.path).delete().await
    }
}

async fn validate_blocking(format: ArtifactFormat, contents: Vec<u8>) -> Result<Vec<u8>, EngineError> {
    tokio::task::spawn_blocking(move || validate_archive(format, &contents).map(|_| contents))
        .await
        .map_err(|e| EngineError::Internal(format!("validation task failed: {}", e)))?
}

/// The package must unpack to a site: `index.html` at the archive root or
/// inside a single top-level directory.
pub fn validate_archive(format: ArtifactFormat, contents: &[u8]) -> Result<(), EngineError> {
    let names = list_entries(format, contents)?;
    if names.is_empty() {
        return Err(EngineError::ValidationError("package is empty".to_string()));
    }

    for name in &names {
        let path = Path::new(name);
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(EngineError::ValidationError(format!("unsafe path in package: {}", name)));
        }
    }

    let has_site = names.iter().any(|name| {
        let parts: Vec<_> = Path::new(name)
            .components()
            .filter(|c| !matches!(c, Component::CurDir))
            .collect();
        match parts.as_slice() {
            [file] => file.as_os_str() == SITE_ENTRY,
            [_, file] => file.as_os_str() == SITE_ENTRY,
            _ => false,
        }
    });

    if has_site {
        Ok(())
    } else {
        warn!(?format, entries = names.len(), "Package rejected: no {}", SITE_ENTRY);
        Err(EngineError::ValidationError(format!(
            "package does not contain {} at its root or in a top-level directory",
            SITE_ENTRY
        )))
    }
}

fn list_entries(format: ArtifactFormat, contents: &[u8]) -> Result<Vec<String>, EngineError> {
    let invalid = |e: &dyn std::fmt::Display| EngineError::ValidationError(format!("unreadable package: {}", e));
    match format {
        ArtifactFormat::Zip => {
            let archive = zip::ZipArchive::new(Cursor::new(contents)).map_err(|e| invalid(&e))?;
            Ok(archive.file_names().map(str::to_string).collect())
        }
        ArtifactFormat::TarGz => tar_entries(GzDecoder::new(Cursor::new(contents))).map_err(|e| invalid(&e)),
        ArtifactFormat::Tar => tar_entries(Cursor::new(contents)).map_err(|e| invalid(&e)),
    }
}

fn tar_entries<R: Read>(reader: R) -> std::io::Result<Vec<String>> {
    let mut archive = tar::Archive::new(reader);
    let mut names = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        names.push(entry.path()?.to_string_lossy().into_owned());
    }
    Ok(names)
}
