//! Discovery Module
//!
//! Walks a source tree, picks the modules that import a tracked API and
//! compiles them in parallel.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

use crate::api::api_table;
use crate::cache::IncrementalCache;
use crate::compile::{compile, CompileOptions, CompileOutput};
use crate::error::CompileError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveryOptions {
    pub extensions: Vec<String>,
    pub exclude_dirs: Vec<String>,
    pub cache_dir: Option<PathBuf>,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        DiscoveryOptions {
            extensions: ["js", "jsx", "ts", "tsx", "mjs", "cjs"]
                .iter()
                .map(|e| e.to_string())
                .collect(),
            exclude_dirs: vec!["node_modules".to_string()],
            cache_dir: None,
        }
    }
}

pub struct FileResult {
    pub path: PathBuf,
    pub result: Result<CompileOutput, CompileError>,
}

/// Source files under `root` with a configured extension, outside excluded
/// directories, in a stable order.
pub fn find_source_files(root: &Path, discovery: &DiscoveryOptions) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| {
            !(entry.file_type().is_dir()
                && entry.depth() > 0
                && discovery
                    .exclude_dirs
                    .iter()
                    .any(|dir| entry.file_name().to_str() == Some(dir.as_str())))
        })
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map_or(false, |ext| discovery.extensions.iter().any(|e| e == ext))
        })
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

/// Compiles every file under `root` that mentions a tracked module. Files
/// that never mention one are skipped without parsing.
pub fn compile_tree(root: &Path, options: &CompileOptions, discovery: &DiscoveryOptions) -> Vec<FileResult> {
    let sources: Vec<String> = api_table(&options.extra_api_table)
        .iter()
        .map(|entry| entry.target.source().to_string())
        .collect();
    let cache = discovery.cache_dir.as_ref().map(IncrementalCache::new);

    let results: Vec<FileResult> = find_source_files(root, discovery)
        .into_par_iter()
        .filter_map(|path| {
            let source = match fs::read_to_string(&path) {
                Ok(source) => source,
                Err(error) => {
                    return Some(FileResult {
                        result: Err(CompileError::Io {
                            path: path.to_string_lossy().to_string(),
                            source: error,
                        }),
                        path,
                    })
                }
            };
            if !sources.iter().any(|module| source.contains(module.as_str())) {
                return None;
            }

            let file_path = path.to_string_lossy().to_string();
            if let Some(output) = cache.as_ref().and_then(|c| c.get(&file_path, &source, options)) {
                return Some(FileResult {
                    path,
                    result: Ok(output),
                });
            }
            let result = compile(&file_path, &source, options);
            if let (Some(cache), Ok(output)) = (cache.as_ref(), &result) {
                cache.set(&file_path, &source, options, output);
            }
            Some(FileResult { path, result })
        })
        .collect();

    info!(
        root = %root.display(),
        compiled = results.len(),
        failed = results.iter().filter(|r| r.result.is_err()).count(),
        "compiled source tree"
    );
    results
}
