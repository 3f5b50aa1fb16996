// Upload directory: the one filesystem root the engine may touch.

use std::path::{Component, Path, PathBuf};

use crate::constants::BACKUP_FOLDER;
use crate::error::{MigratorError, Result};

/// Upload root on disk plus the public URL it is served under.
#[derive(Debug, Clone)]
pub struct UploadDir {
    basedir: PathBuf,
    baseurl: String,
}

impl UploadDir {
    pub fn new(basedir: impl Into<PathBuf>, baseurl: impl Into<String>) -> Self {
        let baseurl: String = baseurl.into();
        Self {
            basedir: basedir.into(),
            baseurl: baseurl.trim_end_matches('/').to_string(),
        }
    }

    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    pub fn baseurl(&self) -> &str {
        &self.baseurl
    }

    /// Base directory as a string without trailing separator.
    pub fn basedir_str(&self) -> String {
        let s = self.basedir.to_string_lossy().to_string();
        if s.len() > 1 {
            s.trim_end_matches('/').to_string()
        } else {
            s
        }
    }

    /// Resolve a path relative to the upload root. Absolute paths and `..`
    /// segments are refused so nothing outside the root is ever touched.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let rel = Path::new(relative);
        for component in rel.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(MigratorError::InvalidPath(format!(
                        "{} escapes the upload directory",
                        relative
                    )))
                }
            }
        }
        if relative.is_empty() {
            return Err(MigratorError::InvalidPath("empty path".to_string()));
        }
        Ok(self.basedir.join(rel))
    }

    /// Public URL of a relative upload path.
    pub fn url_for(&self, relative: &str) -> String {
        format!("{}/{}", self.baseurl, relative)
    }

    /// Absolute filesystem path of a relative upload path, as a string.
    pub fn fs_path_for(&self, relative: &str) -> String {
        let base = self.basedir_str();
        if base == "/" {
            format!("/{}", relative)
        } else {
            format!("{}/{}", base, relative)
        }
    }

    /// Root of the quarantine tree.
    pub fn backup_root(&self) -> PathBuf {
        self.basedir.join(BACKUP_FOLDER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_and_paths() {
        let uploads = UploadDir::new("/var/www/uploads/", "https://site/wp-content/uploads/");
        assert_eq!(
            uploads.url_for("2024/01/pic.jpg"),
            "https://site/wp-content/uploads/2024/01/pic.jpg"
        );
        assert_eq!(uploads.fs_path_for("2024/01/pic.jpg"), "/var/www/uploads/2024/01/pic.jpg");
        assert_eq!(uploads.backup_root(), PathBuf::from("/var/www/uploads/migrator-backup"));
    }

    #[test]
    fn test_resolve_refuses_escape() {
        let uploads = UploadDir::new("/srv/uploads", "https://site/uploads");
        assert!(uploads.resolve("2024/01/pic.jpg").is_ok());
        assert!(uploads.resolve("../etc/passwd").is_err());
        assert!(uploads.resolve("/etc/passwd").is_err());
        assert!(uploads.resolve("").is_err());
    }
}
