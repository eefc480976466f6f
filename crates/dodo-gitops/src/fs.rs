//! Working tree file access
//!
//! All paths are repository paths (`/apps/foo/config.yaml`); a leading `/`
//! is optional and `..` components are refused.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// View of a checked-out working tree
#[derive(Clone, Debug)]
pub struct RepoFs {
    root: PathBuf,
}

impl RepoFs {
    /// Wrap a working tree directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The working tree directory on disk
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let mut out = self.root.clone();
        for comp in Path::new(path.trim_start_matches('/')).components() {
            match comp {
                Component::Normal(c) => out.push(c),
                Component::CurDir => {}
                _ => {
                    return Err(Error::PathEscape {
                        path: path.to_string(),
                    })
                }
            }
        }
        Ok(out)
    }

    /// Open a file for reading
    pub fn reader(&self, path: &str) -> Result<impl Read> {
        let full = self.resolve(path)?;
        File::open(&full).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found(path),
            _ => Error::Io(e),
        })
    }

    /// Open a file for writing, truncating it and creating parent directories
    pub fn writer(&self, path: &str) -> Result<impl Write> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(File::create(full)?)
    }

    /// Create a directory and its parents
    pub fn create_dir(&self, path: &str) -> Result<()> {
        Ok(fs::create_dir_all(self.resolve(path)?)?)
    }

    /// Remove a directory tree; missing directories are not an error
    pub fn remove_dir(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        if full == self.root {
            return Err(Error::PathEscape {
                path: path.to_string(),
            });
        }
        match fs::remove_dir_all(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a single file; missing files are not an error
    pub fn remove_file(&self, path: &str) -> Result<()> {
        match fs::remove_file(self.resolve(path)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of the entries in a directory, sorted; `.git` is hidden
    pub fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let full = self.resolve(path)?;
        let entries = fs::read_dir(&full).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found(path),
            _ => Error::Io(e),
        })?;
        let mut names = Vec::new();
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if name != ".git" {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// True if the path exists
    pub fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.resolve(path)?.exists())
    }

    /// True if the path is a directory
    pub fn is_dir(&self, path: &str) -> Result<bool> {
        Ok(self.resolve(path)?.is_dir())
    }

    /// Read a whole file as UTF-8
    pub fn read_to_string(&self, path: &str) -> Result<String> {
        let mut out = String::new();
        self.reader(path)?.read_to_string(&mut out)?;
        Ok(out)
    }

    /// Write a whole file
    pub fn write_string(&self, path: &str, contents: &str) -> Result<()> {
        self.writer(path)?.write_all(contents.as_bytes())?;
        Ok(())
    }

    /// Deserialize a YAML file
    pub fn read_yaml<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        Ok(serde_yaml::from_str(&self.read_to_string(path)?)?)
    }

    /// Serialize a value to a YAML file
    pub fn write_yaml<T: Serialize>(&self, path: &str, value: &T) -> Result<()> {
        self.write_string(path, &serde_yaml::to_string(value)?)
    }

    /// Deserialize a JSON file
    pub fn read_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        Ok(serde_json::from_str(&self.read_to_string(path)?)?)
    }

    /// Serialize a value to a pretty-printed JSON file
    pub fn write_json<T: Serialize>(&self, path: &str, value: &T) -> Result<()> {
        self.write_string(path, &serde_json::to_string_pretty(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn fs() -> (tempfile::TempDir, RepoFs) {
        let dir = tempfile::tempdir().expect("tempdir");
        let fs = RepoFs::new(dir.path());
        (dir, fs)
    }

    #[test]
    fn writer_creates_parent_directories() {
        let (_dir, fs) = fs();
        fs.write_string("/apps/foo/config.yaml", "id: foo\n")
            .expect("write");
        assert_eq!(
            fs.read_to_string("apps/foo/config.yaml").expect("read"),
            "id: foo\n"
        );
        assert_eq!(fs.list_dir("/apps").expect("list"), vec!["foo"]);
    }

    #[test]
    fn remove_dir_is_idempotent() {
        let (_dir, fs) = fs();
        fs.create_dir("/apps/foo").expect("mkdir");
        fs.remove_dir("/apps/foo").expect("first remove");
        fs.remove_dir("/apps/foo").expect("second remove");
        assert!(!fs.exists("/apps/foo").expect("exists"));
    }

    #[test]
    fn parent_components_are_refused() {
        let (_dir, fs) = fs();
        let err = fs.write_string("../outside", "x").expect_err("escape");
        assert!(matches!(err, Error::PathEscape { .. }));
    }

    #[test]
    fn root_cannot_be_removed() {
        let (_dir, fs) = fs();
        assert!(fs.remove_dir("/").is_err());
    }

    #[test]
    fn missing_file_is_not_found() {
        let (_dir, fs) = fs();
        let err = fs.read_to_string("/config.yaml").expect_err("missing");
        assert!(err.is_not_found());
    }

    #[test]
    fn yaml_and_json_helpers() {
        let (_dir, fs) = fs();
        let mut value = BTreeMap::new();
        value.insert("domain".to_string(), "example.com".to_string());

        fs.write_yaml("/config.yaml", &value).expect("write yaml");
        let back: BTreeMap<String, String> = fs.read_yaml("/config.yaml").expect("read yaml");
        assert_eq!(back, value);

        fs.write_json("/state.json", &value).expect("write json");
        let back: BTreeMap<String, String> = fs.read_json("/state.json").expect("read json");
        assert_eq!(back, value);
    }
}
