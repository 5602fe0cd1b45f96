//! Temporary project trees.

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A project tree on disk, removed when dropped.
#[derive(Debug)]
pub struct Project {
    dir: TempDir,
}

impl Project {
    /// Root of the tree.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Absolute path of a project-relative file.
    #[must_use]
    pub fn join(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    /// Writes a file, creating parent directories.
    ///
    /// # Panics
    ///
    /// Panics if the file cannot be written.
    #[allow(clippy::expect_used)]
    pub fn write(&self, relative: &str, content: &str) {
        let path = self.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create project directory");
        }
        fs::write(&path, content).expect("write project file");
    }

    /// Removes a file.
    ///
    /// # Panics
    ///
    /// Panics if the file cannot be removed.
    #[allow(clippy::expect_used)]
    pub fn remove(&self, relative: &str) {
        fs::remove_file(self.join(relative)).expect("remove project file");
    }
}

/// Builds a [`Project`] from in-memory file contents.
#[derive(Debug, Default)]
pub struct ProjectBuilder {
    files: Vec<(String, String)>,
}

impl ProjectBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file at a project-relative path.
    #[must_use]
    pub fn file(mut self, relative: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.push((relative.into(), content.into()));
        self
    }

    /// Writes every file into a fresh temporary directory.
    ///
    /// # Panics
    ///
    /// Panics if the directory or a file cannot be created.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn build(self) -> Project {
        let project = Project {
            dir: tempfile::tempdir().expect("create temporary project"),
        };
        for (relative, content) in &self.files {
            project.write(relative, content);
        }
        project
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_writes_nested_files() {
        let project = ProjectBuilder::new()
            .file("a/b/c.yaml", "x: 1")
            .file("top.txt", "hi")
            .build();
        assert_eq!(fs::read_to_string(project.join("a/b/c.yaml")).unwrap(), "x: 1");

        project.remove("top.txt");
        assert!(!project.join("top.txt").exists());
    }
}
