//! Naming and containment rules for the recordings directory.
//!
//! Every store operation that touches a client-supplied name goes through
//! [`NameGuard`]; no other module inspects or joins client names.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, error};

use screenreel_common::config::{ALLOWED_EXTENSIONS, DEFAULT_EXTENSION};

use crate::error::StoreError;

/// Longest file name a rename may produce.
pub const MAX_NAME_LEN: usize = 200;

/// Resolves client names against a canonical store root.
#[derive(Debug, Clone)]
pub struct NameGuard {
    root: PathBuf,
}

impl NameGuard {
    /// Create the root if needed and pin its canonical form.
    pub fn new(root: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: std::fs::canonicalize(root)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lower-cased extension of `name`, if any.
    pub fn extension_of(name: &str) -> Option<String> {
        Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }

    pub fn is_allowed_extension(ext: &str) -> bool {
        ALLOWED_EXTENSIONS.contains(&ext)
    }

    /// Extension for a new upload: the declared one when allowed, else the default.
    pub fn upload_extension(declared_name: Option<&str>) -> &'static str {
        declared_name
            .and_then(Self::extension_of)
            .and_then(|ext| ALLOWED_EXTENSIONS.iter().copied().find(|a| *a == ext))
            .unwrap_or(DEFAULT_EXTENSION)
    }

    /// The allow-listed extension of `name`, or `InvalidExtension`.
    pub fn check_extension(name: &str) -> Result<String, StoreError> {
        match Self::extension_of(name) {
            Some(ext) if Self::is_allowed_extension(&ext) => Ok(ext),
            Some(ext) => Err(StoreError::InvalidExtension(ext)),
            None => Err(StoreError::InvalidExtension(String::new())),
        }
    }

    /// Whether a directory entry counts as a stored recording.
    pub fn is_recording(path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        !name.starts_with('.')
            && Self::extension_of(name).is_some_and(|ext| Self::is_allowed_extension(&ext))
    }

    /// Reduce a client-chosen name to `[A-Za-z0-9._-]`, bounded length, no
    /// leading dot.
    pub fn sanitize(name: &str) -> String {
        let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
        let mut safe: String = base
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .take(MAX_NAME_LEN)
            .collect();
        if safe.starts_with('.') {
            safe.insert_str(0, "file_");
        }
        safe
    }

    /// Path a sanitized name would occupy inside the root.
    pub fn target_for(&self, sanitized: &str) -> Result<PathBuf, StoreError> {
        Self::check_component(sanitized)?;
        Ok(self.root.join(sanitized))
    }

    /// Resolve an existing entry, refusing anything that canonicalizes to a
    /// location outside the root.
    pub fn resolve_existing(&self, name: &str) -> Result<PathBuf, StoreError> {
        Self::check_component(name)?;

        let candidate = self.root.join(name);
        let resolved = match std::fs::canonicalize(&candidate) {
            Ok(p) => p,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No recording named {name}");
                return Err(StoreError::NotFound(name.to_string()));
            }
            Err(e) => return Err(StoreError::Io(e)),
        };

        if resolved.parent() != Some(self.root.as_path()) {
            error!(
                name,
                resolved = %resolved.display(),
                "Path escape attempt: name resolves outside the recordings directory"
            );
            return Err(StoreError::PathEscape(name.to_string()));
        }

        if !resolved.is_file() {
            debug!("{name} is not a regular file");
            return Err(StoreError::NotFound(name.to_string()));
        }

        Ok(candidate)
    }

    fn check_component(name: &str) -> Result<(), StoreError> {
        if name.is_empty() {
            return Err(StoreError::BadRequest("Missing file name".into()));
        }
        if name.contains(['/', '\\', '\0']) || name == "." || name == ".." {
            error!(name, "Path escape attempt: separator or relative segment in name");
            return Err(StoreError::PathEscape(name.to_string()));
        }
        Ok(())
    }
}
