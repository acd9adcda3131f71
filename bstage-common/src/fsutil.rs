use crate::error::CommonError;
use std::fs;
use std::path::Path;

pub fn set_executable(path: &Path) -> Result<(), CommonError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms)?;
    }

    Ok(())
}

pub fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path)
            .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

/// Copy `source` over `dest` and mark the result executable.
pub fn install_executable(source: &Path, dest: &Path) -> Result<(), CommonError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, dest)?;
    set_executable(dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_marks_file_executable() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("tool");
        fs::write(&source, b"#!/bin/sh\n").unwrap();
        assert!(!is_executable(&source));

        let dest = dir.path().join("out/bin/tool");
        install_executable(&source, &dest).unwrap();
        assert!(is_executable(&dest));
        assert_eq!(fs::read(&dest).unwrap(), b"#!/bin/sh\n");
    }

    #[test]
    fn install_overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("new");
        let dest = dir.path().join("tool");
        fs::write(&source, b"new").unwrap();
        fs::write(&dest, b"old").unwrap();

        install_executable(&source, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"new");
    }

    #[test]
    fn missing_file_is_not_executable() {
        assert!(!is_executable(Path::new("/nonexistent/bstage/file")));
    }
}
