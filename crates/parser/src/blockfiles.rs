//! Discovery of `blk*.dat` files in a blocks directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub fn is_block_file(name: &str) -> bool {
    name.starts_with("blk") && name.ends_with(".dat")
}

/// Block files in `dir`, sorted by file name. A file's position in this list
/// is its index in [`crate::DatPosition`].
pub fn list_block_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if name.to_str().is_some_and(is_block_file) {
            files.push(entry.path());
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// Combined size of the block files in `dir`.
pub fn block_files_size(dir: &Path) -> io::Result<u64> {
    let mut total = 0u64;
    for path in list_block_files(dir)? {
        total = total.saturating_add(fs::metadata(&path)?.len());
    }
    Ok(total)
}
