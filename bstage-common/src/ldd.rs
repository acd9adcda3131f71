//! Parser for `ldd` output.
//!
//! Unresolved libraries and unrecognised lines are errors rather than being
//! skipped, so a changed tool or a broken install cannot silently shrink the
//! staged library set.

use crate::error::CommonError;
use std::path::PathBuf;

/// Parse `ldd` stdout into the absolute paths of every resolved library.
///
/// Virtual objects such as `linux-vdso.so.1` have no file and are skipped.
/// Statically linked binaries yield an empty list.
pub fn parse_ldd_output(stdout: &str) -> Result<Vec<PathBuf>, CommonError> {
    let mut paths: Vec<PathBuf> = Vec::new();

    for raw in stdout.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if line == "statically linked" || line == "not a dynamic executable" {
            return Ok(Vec::new());
        }

        let resolved = match line.split_once("=>") {
            Some((name, target)) => {
                let target = target.trim();
                if target.starts_with("not found") {
                    return Err(CommonError::UnresolvedLibrary {
                        library: name.trim().to_string(),
                    });
                }
                let target = strip_load_address(target);
                if target.is_empty() {
                    None
                } else if target.starts_with('/') {
                    Some(target)
                } else {
                    return Err(unexpected(line));
                }
            }
            None => {
                let object = strip_load_address(line);
                if object.starts_with('/') {
                    Some(object)
                } else if object != line {
                    // e.g. `linux-vdso.so.1 (0x00007ffd...)`
                    None
                } else {
                    return Err(unexpected(line));
                }
            }
        };

        if let Some(path) = resolved {
            let path = PathBuf::from(path);
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
    }

    Ok(paths)
}

fn strip_load_address(text: &str) -> &str {
    match text.find(" (0x").or_else(|| text.find("(0x")) {
        Some(index) => text[..index].trim(),
        None => text.trim(),
    }
}

fn unexpected(line: &str) -> CommonError {
    CommonError::UnexpectedLddOutput {
        line: line.to_string(),
    }
}
