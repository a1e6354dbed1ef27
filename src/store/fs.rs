//! Local-disk [`FileSystem`].

use std::path::Path;

use tracing::debug;

use crate::error::Result;
use crate::store::FileSystem;

#[derive(Debug, Default, Clone)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn delete_file(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path)?;
        debug!(path = %path.display(), "Deleted delta column file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpdateError;
    use tempfile::TempDir;

    #[test]
    fn test_delete_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0_1.cols");
        std::fs::write(&path, b"cols").unwrap();

        LocalFileSystem.delete_file(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_delete_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = LocalFileSystem
            .delete_file(&dir.path().join("missing.cols"))
            .unwrap_err();
        assert!(matches!(err, UpdateError::NotFound(_)));
    }
}
