use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::compile::{CompileOptions, CompileOutput};

#[derive(Serialize, Deserialize)]
pub struct CacheEntry {
    pub hash: String,
    pub output: CompileOutput,
}

/// Compile outputs on disk, keyed by file path and validated by a hash of
/// the source and the options it was compiled with.
pub struct IncrementalCache {
    cache_dir: PathBuf,
}

impl IncrementalCache {
    pub fn new(cache_dir: impl AsRef<Path>) -> Self {
        let cache_dir = cache_dir.as_ref().to_path_buf();
        if !cache_dir.exists() {
            fs::create_dir_all(&cache_dir).ok();
        }
        Self { cache_dir }
    }

    pub fn compute_hash(source: &str, options: &CompileOptions) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        hasher.update([0u8]);
        hasher.update(serde_json::to_vec(options).unwrap_or_default());
        format!("{:x}", hasher.finalize())
    }

    fn get_cache_path(&self, file_path: &str, options: &CompileOptions) -> PathBuf {
        let safe_name = file_path.replace(['/', '\\', ':'], "_");
        let mode = match options.mode {
            crate::compile::Mode::Server => "server",
            crate::compile::Mode::Client => "client",
        };
        self.cache_dir.join(format!("{}.{}.json", safe_name, mode))
    }

    pub fn get(&self, file_path: &str, source: &str, options: &CompileOptions) -> Option<CompileOutput> {
        let cache_path = self.get_cache_path(file_path, options);
        let data = fs::read_to_string(&cache_path).ok()?;

        let entry: CacheEntry = match serde_json::from_str(&data) {
            Ok(e) => e,
            Err(e) => {
                warn!(file = file_path, error = %e, "discarding corrupt cache entry");
                fs::remove_file(cache_path).ok();
                return None;
            }
        };

        if entry.hash == Self::compute_hash(source, options) {
            debug!(file = file_path, "cache hit");
            Some(entry.output)
        } else {
            None
        }
    }

    pub fn set(&self, file_path: &str, source: &str, options: &CompileOptions, output: &CompileOutput) {
        let cache_path = self.get_cache_path(file_path, options);
        let entry = CacheEntry {
            hash: Self::compute_hash(source, options),
            output: output.clone(),
        };

        if let Ok(data) = serde_json::to_string(&entry) {
            fs::write(cache_path, data).ok();
        }
    }
}
