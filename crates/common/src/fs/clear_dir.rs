use std::{
    fs::{create_dir_all, read_dir, remove_dir_all, remove_file},
    io,
    path::Path,
};

use crate::Result;

/// Removes every file and directory inside `path` without deleting `path` itself.
pub fn clear_directory(path: impl AsRef<Path>) -> Result<()> {
    for entry in read_dir(path.as_ref()).map_err(|error| annotate(error, path.as_ref()))? {
        let entry_path = entry?.path();

        if entry_path.is_dir() {
            remove_dir_all(&entry_path).map_err(|error| annotate(error, &entry_path))?
        } else {
            remove_file(&entry_path).map_err(|error| annotate(error, &entry_path))?
        }
    }
    Ok(())
}

/// Makes sure that `path` exists and holds nothing, creating it if needed.
pub fn ensure_empty_directory(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if path.is_dir() {
        clear_directory(path)
    } else {
        create_dir_all(path).map_err(|error| annotate(error, path).into())
    }
}

fn annotate(error: io::Error, path: &Path) -> io::Error {
    io::Error::new(error.kind(), format!("{}: {error}", path.display()))
}
