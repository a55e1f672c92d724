//! Files served by one listener.
//!
//! Concurrent runs on the same host share one HTTP and one TFTP listener.
//! Each publish adds a reference to its file; the file leaves the catalog
//! when its last reference is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

#[derive(Debug)]
struct Entry {
    data: Bytes,
    sha256: String,
    refs: usize,
    downloads: u32,
}

/// Named images one listener hands out.
#[derive(Debug, Clone, Default)]
pub(crate) struct Catalog {
    files: Arc<Mutex<HashMap<String, Entry>>>,
}

impl Catalog {
    fn files(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a reference to `name`.
    ///
    /// A second image under a name already being served is refused unless
    /// it has the same digest.
    pub(crate) fn add(&self, name: &str, sha256: &str, data: Bytes) -> Result<(), String> {
        let mut files = self.files();
        match files.get_mut(name) {
            Some(entry) if entry.sha256 == sha256 => {
                entry.refs += 1;
                Ok(())
            }
            Some(entry) => Err(format!(
                "a different image named {} is already being served (sha256 {})",
                name, entry.sha256
            )),
            None => {
                files.insert(
                    name.to_string(),
                    Entry {
                        data,
                        sha256: sha256.to_string(),
                        refs: 1,
                        downloads: 0,
                    },
                );
                Ok(())
            }
        }
    }

    /// Drop one reference to `name`. Returns true once the catalog is empty.
    pub(crate) fn release(&self, name: &str) -> bool {
        let mut files = self.files();
        if let Some(entry) = files.get_mut(name) {
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 {
                files.remove(name);
            }
        }
        files.is_empty()
    }

    /// Contents of `name` and how many times it has now been handed out.
    pub(crate) fn fetch(&self, name: &str) -> Option<(Bytes, u32)> {
        let mut files = self.files();
        let entry = files.get_mut(name)?;
        entry.downloads += 1;
        Some((entry.data.clone(), entry.downloads))
    }
}
