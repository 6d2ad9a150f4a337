//! Random emoji picks from a local asset directory.

use std::path::{Path, PathBuf};

use rand::seq::IndexedRandom;
use tracing::warn;

const EMOJI_EXTENSIONS: &[&str] = &["gif", "jpg", "jpeg", "png"];

fn is_emoji_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| EMOJI_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// A random image file from `dir`, or `None` if the directory is missing or empty.
pub fn random_emoji(dir: &Path) -> Option<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Emoji directory {:?} unavailable: {}", dir, e);
            return None;
        }
    };

    let files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_emoji_file(path))
        .collect();

    files.choose(&mut rand::rng()).cloned()
}
