//! Discovery of model files on disk.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::Serialize;

pub const MODEL_EXTENSION: &str = "gguf";
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ModelEntry {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    #[serde(rename = "sizeMB")]
    pub size_mb: u64,
}

impl ModelEntry {
    fn new(path: PathBuf, size: u64) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_string();
        Some(Self {
            name,
            path,
            size,
            size_mb: (size as f64 / BYTES_PER_MB).round() as u64,
        })
    }
}

/// Lists `.gguf` files directly inside `dir`, sorted by name.
pub fn list_models(dir: &Path) -> std::io::Result<Vec<ModelEntry>> {
    let mut models: Vec<ModelEntry> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case(MODEL_EXTENSION))
                .unwrap_or(false)
        })
        .filter_map(|entry| {
            let metadata = entry.metadata().ok()?;
            metadata
                .is_file()
                .then(|| ModelEntry::new(entry.path(), metadata.len()))
                .flatten()
        })
        .collect();
    models.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(models)
}

/// Like [`list_models`], but an unreadable directory is just empty.
pub fn list_models_or_empty(dir: &Path) -> Vec<ModelEntry> {
    list_models(dir).unwrap_or_else(|err| {
        tracing::warn!(dir = %dir.display(), %err, "cannot list models");
        Vec::new()
    })
}

/// The model to launch: the configured path, else the first model found.
pub fn resolve_model(explicit: Option<&Path>, models_dir: &Path) -> Option<PathBuf> {
    match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => list_models_or_empty(models_dir)
            .into_iter()
            .next()
            .map(|entry| entry.path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_sized(dir: &Path, name: &str, len: u64) {
        let file = fs::File::create(dir.join(name)).unwrap();
        file.set_len(len).unwrap();
    }

    #[test]
    fn lists_only_model_files_with_rounded_sizes() {
        let dir = tempfile::tempdir().unwrap();
        write_sized(dir.path(), "b-model.gguf", 3 * 1024 * 1024 + 600 * 1024);
        write_sized(dir.path(), "a-model.gguf", 1024 * 1024 + 100);
        write_sized(dir.path(), "notes.txt", 10);

        let models = list_models(dir.path()).unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].name, "a-model.gguf");
        assert_eq!(models[0].size_mb, 1);
        assert_eq!(models[1].name, "b-model.gguf");
        assert_eq!(models[1].size_mb, 4);
        assert_eq!(models[1].path, dir.path().join("b-model.gguf"));
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_models_or_empty(&dir.path().join("nope")).is_empty());
    }

    #[test]
    fn explicit_model_wins_over_discovery() {
        let dir = tempfile::tempdir().unwrap();
        write_sized(dir.path(), "found.gguf", 1);
        let explicit = PathBuf::from("/elsewhere/pinned.gguf");
        assert_eq!(
            resolve_model(Some(&explicit), dir.path()),
            Some(explicit.clone())
        );
        assert_eq!(
            resolve_model(None, dir.path()),
            Some(dir.path().join("found.gguf"))
        );
    }
}
