//! Embedded-name handling and crash-safe file moves.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Extract the name embedded in brackets within a file name.
///
/// Names nest when a file passes through several queues
/// (`QF-a1b2c3[000[image.dcm]]`), so the innermost bracketed name is returned.
/// Without brackets the full name is returned when `default_to_full` is set,
/// otherwise an empty string.
pub fn embedded_name(name: &str, default_to_full: bool) -> String {
    match (name.find('['), name.rfind(']')) {
        (Some(open), Some(close)) if open < close => {
            let inner = &name[open + 1..close];
            if inner.contains('[') {
                embedded_name(inner, true)
            } else {
                inner.to_string()
            }
        }
        _ if default_to_full => name.to_string(),
        _ => String::new(),
    }
}

/// Embedded name of a path's file name, defaulting to the full name.
pub fn embedded_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| embedded_name(&name.to_string_lossy(), true))
        .unwrap_or_default()
}

/// Format the bracketed suffix that carries an embedded name.
pub(crate) fn bracketed(embedded: &str) -> String {
    if embedded.is_empty() {
        String::new()
    } else {
        format!("[{}]", embedded)
    }
}

/// Reserve a fresh temp-style file name in `dir` that carries `embedded`.
///
/// The returned path exists as an empty placeholder; callers overwrite it.
pub(crate) fn reserve_path(dir: &Path, prefix: &str, embedded: &str) -> io::Result<PathBuf> {
    let suffix = bracketed(embedded);
    let placeholder = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(&suffix)
        .rand_bytes(8)
        .tempfile_in(dir)?;
    let (_file, path) = placeholder.keep().map_err(|e| e.error)?;
    Ok(path)
}

/// Move `source` onto `target`, falling back to copy and delete when a
/// rename is not possible (e.g. across filesystems).
///
/// On failure the source is left where it was and `target` is removed.
pub(crate) fn move_file(source: &Path, target: &Path) -> io::Result<()> {
    if fs::rename(source, target).is_ok() {
        return Ok(());
    }

    let copied = fs::copy(source, target).and_then(|copied| {
        let expected = fs::metadata(source)?.len();
        if copied == expected {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "Copy verification failed: source {} bytes, dest {} bytes",
                    expected, copied
                ),
            ))
        }
    });

    match copied {
        Ok(()) => fs::remove_file(source),
        Err(e) => {
            let _ = fs::remove_file(target);
            Err(e)
        }
    }
}
