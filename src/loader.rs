//! Bulk registration from a directory of fingerprint files
//!
//! Each regular file names a domain (`api.example.com`, `*.example.com`) and
//! holds that domain's fingerprint text, optionally in the form printed by
//! `openssl x509 -noout -fingerprint`. Hidden files are skipped.

use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::registry::FingerprintRegistry;

/// Register every fingerprint file in `dir`, returning how many were loaded
///
/// Stops at the first unreadable or invalid file; entries registered before
/// it stay in the registry.
pub fn load_dir(registry: &FingerprintRegistry, dir: impl AsRef<Path>) -> Result<usize> {
    let dir = dir.as_ref();
    let mut loaded = 0;

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }

        let path = entry.path();
        let Some(domain) = path.file_name().and_then(|name| name.to_str()) else {
            warn!(path = %path.display(), "skipping fingerprint file with non UTF-8 name");
            continue;
        };
        if domain.starts_with('.') {
            continue;
        }

        let text = fs::read_to_string(&path)?;
        registry
            .register(domain, &text)
            .map_err(|e| Error::InvalidArgument(format!("{}: {}", path.display(), e)))?;
        loaded += 1;
    }

    info!(dir = %dir.display(), count = loaded, "loaded certificate fingerprints");
    Ok(loaded)
}
