//! Runtime Directory
//!
//! Owns the on-disk area the session needs: the ACL file handed to the
//! proxy client, the cached GFW list and the bundled client binaries.
//!
//! ```text
//! <root>/
//! ├── acl.conf
//! ├── gfwlist.txt
//! └── bin/
//! ```

use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const ACL_FILE: &str = "acl.conf";
const GFWLIST_FILE: &str = "gfwlist.txt";
const BIN_DIR: &str = "bin";

/// Runtime directory handle
#[derive(Debug, Clone)]
pub struct RuntimeDir {
    root: PathBuf,
}

impl RuntimeDir {
    /// Use `root` as the runtime directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Platform default: `<data_dir>/shadowdesk/runtime`
    pub fn default_root() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("shadowdesk")
            .join("runtime")
    }

    /// Root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the directory tree
    pub async fn ensure(&self) -> Result<(), RuntimeError> {
        let bin = self.root.join(BIN_DIR);
        tokio::fs::create_dir_all(&bin)
            .await
            .map_err(|e| RuntimeError::io(&bin, e))?;

        #[cfg(unix)]
        {
            set_mode(&self.root, 0o700).await?;
            set_mode(&bin, 0o711).await?;

            async fn set_mode(path: &Path, mode: u32) -> Result<(), RuntimeError> {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
                    .await
                    .map_err(|e| RuntimeError::io(path, e))
            }
        }

        debug!("Runtime directory ready at {}", self.root.display());
        Ok(())
    }

    /// Path of the ACL file
    pub fn acl_path(&self) -> PathBuf {
        self.root.join(ACL_FILE)
    }

    /// Path of the cached GFW list
    pub fn gfwlist_path(&self) -> PathBuf {
        self.root.join(GFWLIST_FILE)
    }

    /// Path of a bundled binary
    pub fn bin_path(&self, name: &str) -> PathBuf {
        self.root.join(BIN_DIR).join(name)
    }

    /// Durably write the ACL rules and return their path
    pub async fn write_acl(&self, text: &str) -> Result<PathBuf, RuntimeError> {
        let path = self.acl_path();
        self.write_durable(&path, text.as_bytes()).await?;
        info!("ACL written to {} ({} bytes)", path.display(), text.len());
        Ok(path)
    }

    /// Durably write the GFW list cache
    pub async fn write_gfwlist(&self, text: &str) -> Result<PathBuf, RuntimeError> {
        let path = self.gfwlist_path();
        self.write_durable(&path, text.as_bytes()).await?;
        Ok(path)
    }

    /// Read the cached GFW list, if any
    pub async fn read_gfwlist(&self) -> Result<Option<String>, RuntimeError> {
        let path = self.gfwlist_path();
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RuntimeError::io(&path, e)),
        }
    }

    /// Write to a sibling temp file, fsync, then rename over `path`
    async fn write_durable(&self, path: &Path, bytes: &[u8]) -> Result<(), RuntimeError> {
        self.ensure().await?;

        let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| RuntimeError::io(&tmp, e))?;
        file.write_all(bytes).await.map_err(|e| RuntimeError::io(&tmp, e))?;
        file.sync_all().await.map_err(|e| RuntimeError::io(&tmp, e))?;
        drop(file);

        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| RuntimeError::io(path, e))
    }
}

impl Default for RuntimeDir {
    fn default() -> Self {
        Self::new(Self::default_root())
    }
}

/// Runtime directory errors
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RuntimeError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_creates_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = RuntimeDir::new(tmp.path().join("runtime"));

        runtime.ensure().await.unwrap();
        assert!(runtime.root().is_dir());
        assert!(runtime.bin_path("ss-local").parent().unwrap().is_dir());

        // Idempotent
        runtime.ensure().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_acl() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = RuntimeDir::new(tmp.path());

        let path = runtime.write_acl("[proxy_all]\n[bypass_list]\n").await.unwrap();
        assert_eq!(path, tmp.path().join("acl.conf"));
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "[proxy_all]\n[bypass_list]\n"
        );

        // Overwrite replaces content and leaves no temp files
        runtime.write_acl("[bypass_all]\n").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[bypass_all]\n");
        let leftovers = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_gfwlist_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = RuntimeDir::new(tmp.path());

        assert_eq!(runtime.read_gfwlist().await.unwrap(), None);
        runtime.write_gfwlist("||example.com").await.unwrap();
        assert_eq!(
            runtime.read_gfwlist().await.unwrap().as_deref(),
            Some("||example.com")
        );
    }

    #[test]
    fn test_default_root() {
        let root = RuntimeDir::default_root();
        assert!(root.ends_with("shadowdesk/runtime"));
    }
}
