//! Process-wide table of loaded binary images
//!
//! Images are keyed by the canonical path of the file the loader mapped, so
//! asking for the same module under different spellings yields the same
//! [`BinaryImage`]. Entries live as long as the registry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::ResolveError;
use crate::image::BinaryImage;

#[cfg(not(windows))]
const LIBRARY_EXTENSION: &str = ".so";
#[cfg(windows)]
const LIBRARY_EXTENSION: &str = ".dll";

/// Suffix Linux dedicated servers append to their module names
const SERVER_SUFFIX: &str = "_srv";

fn has_library_extension(text: &str) -> bool {
    text.ends_with(LIBRARY_EXTENSION) || (cfg!(not(windows)) && text.contains(".so."))
}

/// File names to try, in order, when loading `path`
///
/// Without an extension the platform's library extension is appended. On
/// Linux with `srv_check` the dedicated-server `_srv` variant is tried
/// before the plain name.
pub fn candidate_paths(path: &Path, srv_check: bool) -> Vec<PathBuf> {
    let text = path.to_string_lossy();
    if has_library_extension(&text) {
        return vec![path.to_path_buf()];
    }

    let mut candidates = Vec::with_capacity(2);
    if cfg!(not(windows)) && srv_check && !text.ends_with(SERVER_SUFFIX) {
        candidates.push(PathBuf::from(format!(
            "{}{}{}",
            text, SERVER_SUFFIX, LIBRARY_EXTENSION
        )));
    }

    candidates.push(PathBuf::from(format!("{}{}", text, LIBRARY_EXTENSION)));
    candidates
}

fn canonical_key(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Loaded images keyed by canonical path
#[derive(Default)]
pub struct BinaryImageRegistry {
    images: RwLock<HashMap<PathBuf, Arc<BinaryImage>>>,
}

impl BinaryImageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `path`, or return the image already loaded from it
    ///
    /// Fails with [`ResolveError::Io`] naming `path` when no candidate file
    /// name can be loaded.
    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display(), srv_check = srv_check))]
    pub fn load(
        &self,
        path: impl AsRef<Path>,
        srv_check: bool,
    ) -> Result<Arc<BinaryImage>, ResolveError> {
        let path = path.as_ref();
        let mut last_error = None;

        for candidate in candidate_paths(path, srv_check) {
            if let Some(image) = self.get(&candidate) {
                return Ok(image);
            }

            match BinaryImage::load(&candidate) {
                Ok(image) => return Ok(self.insert(image)),
                Err(e) => {
                    tracing::debug!("Candidate {} failed: {}", candidate.display(), e);
                    last_error = Some(e);
                }
            }
        }

        let reason = match last_error {
            Some(ResolveError::Io { reason, .. }) => reason,
            Some(other) => other.to_string(),
            None => "no candidate paths".to_string(),
        };
        Err(ResolveError::Io {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Register an image under its own canonical path
    ///
    /// If an image with that key already exists it is kept and returned,
    /// and `image` is dropped.
    pub fn insert(&self, image: BinaryImage) -> Arc<BinaryImage> {
        let key = canonical_key(image.path());
        let mut images = self.images.write();
        images.entry(key).or_insert_with(|| Arc::new(image)).clone()
    }

    /// Previously loaded image for `path`
    pub fn get(&self, path: impl AsRef<Path>) -> Option<Arc<BinaryImage>> {
        let key = canonical_key(path.as_ref());
        self.images.read().get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.images.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.read().is_empty()
    }

    /// Snapshot of every loaded image
    pub fn images(&self) -> Vec<Arc<BinaryImage>> {
        self.images.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(windows))]
    #[test]
    fn test_candidate_paths_srv() {
        assert_eq!(
            candidate_paths(Path::new("bin/server"), true),
            vec![
                PathBuf::from("bin/server_srv.so"),
                PathBuf::from("bin/server.so")
            ]
        );
        assert_eq!(
            candidate_paths(Path::new("bin/server"), false),
            vec![PathBuf::from("bin/server.so")]
        );
        assert_eq!(
            candidate_paths(Path::new("bin/engine_srv"), true),
            vec![PathBuf::from("bin/engine_srv.so")]
        );
        assert_eq!(
            candidate_paths(Path::new("bin/server.so"), true),
            vec![PathBuf::from("bin/server.so")]
        );
        assert_eq!(
            candidate_paths(Path::new("libc.so.6"), true),
            vec![PathBuf::from("libc.so.6")]
        );
    }

    #[cfg(windows)]
    #[test]
    fn test_candidate_paths_dll() {
        assert_eq!(
            candidate_paths(Path::new("bin/server"), true),
            vec![PathBuf::from("bin/server.dll")]
        );
    }

    #[test]
    fn test_insert_is_keyed_by_path() {
        let data = vec![0u8; 16];
        let registry = BinaryImageRegistry::new();

        let image = unsafe { BinaryImage::from_memory(data.as_ptr(), data.len()) };
        let path = image.path().to_path_buf();
        let first = registry.insert(image);

        let again = unsafe { BinaryImage::from_memory(data.as_ptr(), data.len()) };
        let second = registry.insert(again);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&path).is_some());
    }

    #[test]
    fn test_load_missing_reports_path() {
        let registry = BinaryImageRegistry::new();
        let err = registry
            .load("/nonexistent/dir/libnothing", true)
            .unwrap_err();
        match err {
            ResolveError::Io { path, .. } => {
                assert_eq!(path, PathBuf::from("/nonexistent/dir/libnothing"))
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(registry.is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_load_is_shared() {
        let registry = BinaryImageRegistry::new();
        let first = registry.load("libc.so.6", false).unwrap();
        let second = registry.load("libc.so.6", false).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.find_symbol("strlen").is_valid());
        assert!(first.find_symbol("definitely_not_a_symbol").is_null());
    }
}
