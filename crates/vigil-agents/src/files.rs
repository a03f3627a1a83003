//! Project-scoped file access for agents
//!
//! Agents read and write whole files through [`ProjectFiles`]. Paths are
//! resolved against the project root and anything that escapes it, or
//! touches version-control metadata, is rejected.

use std::fs;
use std::path::{Component, Path, PathBuf};
use vigil_core::{Result, VigilError};

/// Paths agents may never write
const PROTECTED: &[&str] = &[".git", ".vigil", ".env"];

#[derive(Debug, Clone)]
pub struct ProjectFiles {
    root: PathBuf,
}

impl ProjectFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a project-relative path.
    ///
    /// Absolute paths are accepted only when they lie under the root.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let candidate = Path::new(path);
        let relative = if candidate.is_absolute() {
            candidate.strip_prefix(&self.root).map_err(|_| {
                VigilError::PathValidation(format!("{} is outside the project root", path))
            })?
        } else {
            candidate
        };

        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(VigilError::PathValidation(format!(
                        "Path traversal not allowed: {}",
                        path
                    )))
                }
            }
        }
        if relative.as_os_str().is_empty() {
            return Err(VigilError::PathValidation("empty path".to_string()));
        }

        Ok(self.root.join(relative))
    }

    pub fn read(&self, path: &str) -> Result<String> {
        let full = self.resolve(path)?;
        Ok(fs::read_to_string(full)?)
    }

    /// Replace a file's contents in one step.
    ///
    /// Content goes to a sibling temp file that is renamed over the target,
    /// so concurrent readers see either the old or the new file.
    pub fn write(&self, path: &str, content: &str) -> Result<()> {
        let full = self.resolve(path)?;
        let relative = full.strip_prefix(&self.root).unwrap_or(&full);
        let first = relative
            .components()
            .find(|c| !matches!(c, Component::CurDir));
        if let Some(Component::Normal(first)) = first {
            if PROTECTED.iter().any(|p| first.to_str() == Some(*p)) {
                return Err(VigilError::PathValidation(format!(
                    "Cannot write to protected path: {}",
                    path
                )));
            }
        }

        let file_name = full
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| VigilError::PathValidation(format!("not a file: {}", path)))?;
        let tmp = full.with_file_name(format!(".{}.vigil-tmp", file_name));

        fs::write(&tmp, content)?;
        if let Err(e) = fs::rename(&tmp, &full) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        tracing::debug!("Rewrote {}", full.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_write_roundtrip() {
        let dir = TempDir::new().unwrap();
        let files = ProjectFiles::new(dir.path());
        fs::create_dir_all(dir.path().join("pkg")).unwrap();
        fs::write(dir.path().join("pkg/a.py"), "x = 1  \n").unwrap();

        files.write("pkg/a.py", "x = 1\n").unwrap();
        assert_eq!(files.read("./pkg/a.py").unwrap(), "x = 1\n");
        assert!(!dir.path().join("pkg/.a.py.vigil-tmp").exists());
    }

    #[test]
    fn test_rejects_escape() {
        let dir = TempDir::new().unwrap();
        let files = ProjectFiles::new(dir.path());
        assert!(files.resolve("../etc/passwd").is_err());
        assert!(files.resolve("/etc/passwd").is_err());
        assert!(files.resolve("").is_err());

        let inside = dir.path().join("ok.py");
        assert_eq!(
            files.resolve(inside.to_str().unwrap()).unwrap(),
            dir.path().join("ok.py")
        );
    }

    #[test]
    fn test_rejects_protected_write() {
        let dir = TempDir::new().unwrap();
        let files = ProjectFiles::new(dir.path());
        let err = files.write(".git/config", "boom").unwrap_err();
        assert!(matches!(err, VigilError::PathValidation(_)));
        assert!(files.write("./.git/config", "boom").is_err());
    }
}
