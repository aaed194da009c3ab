//! Restorable machine working directories.
//!
//! A host-provisioning command keeps its state (certificates, keys, driver
//! config) in a storage directory. The whole tree is packed into a single
//! blob so it can be saved in the encrypted store and restored on any
//! controller replica.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct Entry {
    mode: u32,
    data: String,
}

/// A machine's working directory on local disk.
#[derive(Debug, Clone)]
pub struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Packs every regular file under the directory into one blob.
    pub async fn snapshot(&self) -> io::Result<Vec<u8>> {
        let root = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut entries = BTreeMap::new();
            if root.exists() {
                collect(&root, &root, &mut entries)?;
            }
            serde_json::to_vec(&entries).map_err(io::Error::other)
        })
        .await
        .map_err(io::Error::other)?
    }

    /// Recreates the directory from a blob, replacing its current content.
    pub async fn restore(&self, blob: &[u8]) -> io::Result<()> {
        let entries: BTreeMap<String, Entry> =
            serde_json::from_slice(blob).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let root = self.path.clone();
        tokio::task::spawn_blocking(move || {
            if root.exists() {
                std::fs::remove_dir_all(&root)?;
            }
            std::fs::create_dir_all(&root)?;
            for (relative, entry) in entries {
                let target = safe_join(&root, &relative)?;
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let data = BASE64
                    .decode(entry.data)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                std::fs::write(&target, data)?;
                set_mode(&target, entry.mode)?;
            }
            Ok(())
        })
        .await
        .map_err(io::Error::other)?
    }

    /// Deletes the directory if present.
    pub async fn remove(&self) -> io::Result<()> {
        match tokio::fs::remove_dir_all(&self.path).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

fn collect(root: &Path, dir: &Path, entries: &mut BTreeMap<String, Entry>) -> io::Result<()> {
    for item in std::fs::read_dir(dir)? {
        let item = item?;
        let path = item.path();
        let file_type = item.file_type()?;
        if file_type.is_dir() {
            collect(root, &path, entries)?;
        } else if file_type.is_file() {
            let relative = path
                .strip_prefix(root)
                .map_err(io::Error::other)?
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            let data = std::fs::read(&path)?;
            entries.insert(
                relative,
                Entry {
                    mode: mode_of(&item.metadata()?),
                    data: BASE64.encode(data),
                },
            );
        }
    }
    Ok(())
}

/// Joins a stored relative path, refusing anything that escapes `root`.
fn safe_join(root: &Path, relative: &str) -> io::Result<PathBuf> {
    let mut target = root.to_path_buf();
    for part in relative.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid path in working state: {relative:?}"),
            ));
        }
        target.push(part);
    }
    Ok(target)
}

#[cfg(unix)]
fn mode_of(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn mode_of(_meta: &std::fs::Metadata) -> u32 {
    0o644
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_snapshot_restores_tree() {
        let src = TempDir::new().unwrap();
        std::fs::create_dir_all(src.path().join("machines/n1")).unwrap();
        std::fs::write(src.path().join("machines/n1/config.json"), br#"{"Driver":{}}"#).unwrap();
        std::fs::write(src.path().join("machines/n1/id_rsa"), b"key").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(src.path().join("machines/n1/id_rsa"), std::fs::Permissions::from_mode(0o600))
                .unwrap();
        }

        let blob = WorkDir::new(src.path()).snapshot().await.unwrap();

        let dst = TempDir::new().unwrap();
        let restored = WorkDir::new(dst.path().join("state"));
        restored.restore(&blob).await.unwrap();

        assert_eq!(std::fs::read(restored.path().join("machines/n1/id_rsa")).unwrap(), b"key");
        assert_eq!(
            std::fs::read(restored.path().join("machines/n1/config.json")).unwrap(),
            br#"{"Driver":{}}"#
        );
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(restored.path().join("machines/n1/id_rsa")).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_missing_directory_snapshots_empty() {
        let tmp = TempDir::new().unwrap();
        let blob = WorkDir::new(tmp.path().join("absent")).snapshot().await.unwrap();
        assert_eq!(blob, b"{}");
    }

    #[tokio::test]
    async fn test_restore_rejects_escaping_paths() {
        let tmp = TempDir::new().unwrap();
        let blob = br#"{"../evil":{"mode":420,"data":""}}"#;
        let err = WorkDir::new(tmp.path().join("state")).restore(blob).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
