//! Firmware artifact store. Uploads are staged to a temp file while the
//! SHA-256 is computed, then moved into place; streams resolve through a
//! directory-traversal guard. Records live in the repository, bytes under
//! `root`.

pub mod diff;

use crate::store::{NewFirmware, Repository, StoreError};
use bytes::Bytes;
use common::{Firmware, FirmwareDiff, FirmwareVersion};
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

/// Upload size cap: 16 MiB.
pub const MAX_FIRMWARE_BYTES: u64 = 16 * 1024 * 1024;

const ALLOWED_EXTENSIONS: [&str; 2] = ["bin", "hex"];

#[derive(Debug, thiserror::Error)]
pub enum FirmwareError {
    #[error("firmware version {0} already exists")]
    VersionExists(FirmwareVersion),
    #[error("firmware {0} not found")]
    NotFound(String),
    #[error("firmware exceeds the {MAX_FIRMWARE_BYTES} byte limit")]
    TooLarge,
    #[error("unsupported firmware extension {0:?}")]
    BadExtension(String),
    #[error("path escapes the firmware directory")]
    PathTraversal,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct FirmwareStore {
    repo: Arc<dyn Repository>,
    root: PathBuf,
}

/// Handle for streaming one firmware image out of the store.
pub struct FirmwareRead {
    pub firmware: Firmware,
    pub stream: ReaderStream<fs::File>,
}

impl FirmwareStore {
    pub async fn new(repo: Arc<dyn Repository>, root: PathBuf) -> Result<Self, FirmwareError> {
        fs::create_dir_all(&root).await?;
        // Canonical root so the traversal guard compares resolved paths.
        let root = fs::canonicalize(&root).await?;
        Ok(FirmwareStore { repo, root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stages the body to a temp file, hashing as bytes arrive, then promotes
    /// it to `default_<version>.ino.bin` and creates the record. The staged
    /// file is removed on any failure.
    pub async fn upload<S, E>(
        &self,
        version: FirmwareVersion,
        original_filename: &str,
        notes: Option<String>,
        mut body: S,
    ) -> Result<Firmware, FirmwareError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::error::Error + Send + Sync + 'static,
    {
        let extension = Path::new(original_filename)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
            return Err(FirmwareError::BadExtension(extension));
        }

        if self.repo.firmware_by_version(&version).await?.is_some() {
            return Err(FirmwareError::VersionExists(version));
        }

        let staging = self.root.join(format!(".upload-{}.tmp", version.as_str()));
        let result = self.stage(&staging, &mut body).await;
        let (size, checksum) = match result {
            Ok(ok) => ok,
            Err(err) => {
                let _ = fs::remove_file(&staging).await;
                return Err(err);
            }
        };

        let filename = format!("default_{}.ino.bin", version.as_str());
        let final_path = self.root.join(&filename);
        fs::rename(&staging, &final_path).await?;

        let record = self
            .repo
            .insert_firmware(NewFirmware {
                version: version.clone(),
                filename: filename.clone(),
                size,
                checksum,
                notes,
            })
            .await;

        match record {
            Ok(firmware) => {
                info!("stored firmware {} ({} bytes)", version, size);
                Ok(firmware)
            }
            Err(err) => {
                // Record creation failed after the move; drop the artifact so
                // disk and repository stay consistent.
                let _ = fs::remove_file(&final_path).await;
                Err(match err {
                    StoreError::Conflict(_) => FirmwareError::VersionExists(version),
                    other => FirmwareError::Store(other),
                })
            }
        }
    }

    async fn stage<S, E>(
        &self,
        staging: &Path,
        body: &mut S,
    ) -> Result<(u64, String), FirmwareError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut file = fs::File::create(staging).await?;
        let mut hasher = Sha256::new();
        let mut size: u64 = 0;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            size += chunk.len() as u64;
            if size > MAX_FIRMWARE_BYTES {
                return Err(FirmwareError::TooLarge);
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        Ok((size, hex::encode(hasher.finalize())))
    }

    pub async fn get(&self, version: &FirmwareVersion) -> Result<Option<Firmware>, FirmwareError> {
        Ok(self.repo.firmware_by_version(version).await?)
    }

    pub async fn list(&self) -> Result<Vec<Firmware>, FirmwareError> {
        Ok(self.repo.list_firmware().await?)
    }

    /// Opens a read stream for the stored image and bumps its download count.
    pub async fn stream(&self, version: &FirmwareVersion) -> Result<FirmwareRead, FirmwareError> {
        let firmware = self
            .repo
            .firmware_by_version(version)
            .await?
            .ok_or_else(|| FirmwareError::NotFound(version.to_string()))?;

        let path = self.resolve(&firmware.filename)?;
        let file = fs::File::open(&path).await?;
        self.repo.record_download(version).await?;

        Ok(FirmwareRead {
            firmware,
            stream: ReaderStream::new(file),
        })
    }

    /// Opens a stored file by name (the device-facing `/firmware/:filename`
    /// path), with the same traversal guard.
    pub async fn open_by_filename(
        &self,
        filename: &str,
    ) -> Result<(Firmware, ReaderStream<fs::File>), FirmwareError> {
        let firmware = self
            .repo
            .list_firmware()
            .await?
            .into_iter()
            .find(|f| f.filename == filename)
            .ok_or_else(|| FirmwareError::NotFound(filename.to_string()))?;

        let path = self.resolve(filename)?;
        let file = fs::File::open(&path).await?;
        self.repo.record_download(&firmware.version).await?;
        Ok((firmware, ReaderStream::new(file)))
    }

    /// Removes the record first, then the artifact; a missing file after the
    /// record is gone only warrants a warning.
    pub async fn delete(&self, version: &FirmwareVersion) -> Result<(), FirmwareError> {
        let firmware = self
            .repo
            .firmware_by_version(version)
            .await?
            .ok_or_else(|| FirmwareError::NotFound(version.to_string()))?;

        self.repo.delete_firmware(version).await?;

        let path = self.resolve(&firmware.filename)?;
        if let Err(err) = fs::remove_file(&path).await {
            warn!("firmware {} record removed but file cleanup failed: {err}", version);
        }
        Ok(())
    }

    /// Byte-level diff of two stored images.
    pub async fn diff(
        &self,
        a: &FirmwareVersion,
        b: &FirmwareVersion,
    ) -> Result<FirmwareDiff, FirmwareError> {
        let fa = self
            .repo
            .firmware_by_version(a)
            .await?
            .ok_or_else(|| FirmwareError::NotFound(a.to_string()))?;
        let fb = self
            .repo
            .firmware_by_version(b)
            .await?
            .ok_or_else(|| FirmwareError::NotFound(b.to_string()))?;

        let bytes_a = fs::read(self.resolve(&fa.filename)?).await?;
        let bytes_b = fs::read(self.resolve(&fb.filename)?).await?;
        Ok(diff::compare(&bytes_a, &bytes_b))
    }

    /// Rejects any name whose resolved path leaves the firmware root.
    fn resolve(&self, filename: &str) -> Result<PathBuf, FirmwareError> {
        let candidate = self.root.join(filename);
        let mut normalized = self.root.clone();
        for component in Path::new(filename).components() {
            use std::path::Component;
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                _ => return Err(FirmwareError::PathTraversal),
            }
        }
        if !normalized.starts_with(&self.root) || normalized != candidate {
            return Err(FirmwareError::PathTraversal);
        }
        Ok(normalized)
    }
}
