// src/fsutil.rs

//! Small filesystem helpers shared by the pipeline and installer

use crate::error::{Error, Result};
use std::fs;
use std::path::Path;

/// Recursively copy a directory tree. Symlinks are recreated, not followed.
pub fn copy_dir_recursive(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)
        .map_err(|e| Error::IoError(format!("create {}: {e}", dest.display())))?;

    for entry in fs::read_dir(src)
        .map_err(|e| Error::IoError(format!("read {}: {e}", src.display())))?
    {
        let entry = entry.map_err(|e| Error::IoError(e.to_string()))?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        let file_type = entry
            .file_type()
            .map_err(|e| Error::IoError(e.to_string()))?;

        if file_type.is_dir() {
            copy_dir_recursive(&from, &to)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(&from)
                .map_err(|e| Error::IoError(format!("readlink {}: {e}", from.display())))?;
            if to.symlink_metadata().is_ok() {
                fs::remove_file(&to)
                    .map_err(|e| Error::IoError(format!("replace {}: {e}", to.display())))?;
            }
            std::os::unix::fs::symlink(&target, &to)
                .map_err(|e| Error::IoError(format!("symlink {}: {e}", to.display())))?;
        } else {
            fs::copy(&from, &to).map_err(|e| {
                Error::IoError(format!("copy {} -> {}: {e}", from.display(), to.display()))
            })?;
        }
    }

    Ok(())
}

/// Remove a directory tree if it exists.
pub fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::IoError(format!("remove {}: {e}", path.display()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_copy_tree_with_symlink() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("sub/file"), "data").unwrap();
        std::os::unix::fs::symlink("sub/file", src.join("link")).unwrap();

        let dest = tmp.path().join("dest");
        copy_dir_recursive(&src, &dest).unwrap();

        assert_eq!(fs::read_to_string(dest.join("sub/file")).unwrap(), "data");
        assert!(dest.join("link").symlink_metadata().unwrap().is_symlink());
        assert_eq!(fs::read_to_string(dest.join("link")).unwrap(), "data");
    }

    #[test]
    fn test_remove_missing_is_ok() {
        let tmp = TempDir::new().unwrap();
        remove_dir_if_exists(&tmp.path().join("nope")).unwrap();
    }
}
