//! First-run license acceptance patching.
//!
//! When the classifier reports `EulaBlocked`, the host prompts the user and
//! then calls [`accept`] before resubmitting `restart()`.

use std::{fs, io, path::Path, path::PathBuf};

/// Flip `eula=false` to `eula=true` in the server directory's `eula.txt`,
/// creating the file when missing. Returns the patched path.
pub fn accept(server_dir: &Path) -> io::Result<PathBuf> {
    let path = server_dir.join("eula.txt");
    let body = match fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    let patched = if body.contains("eula=false") {
        body.replace("eula=false", "eula=true")
    } else if body.contains("eula=true") {
        body
    } else {
        let mut b = body;
        if !b.is_empty() && !b.ends_with('\n') {
            b.push('\n');
        }
        b.push_str("eula=true\n");
        b
    };

    let tmp = server_dir.join("eula.txt.tmp");
    fs::write(&tmp, patched)?;
    fs::rename(&tmp, &path)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flips_existing_false_flag() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("eula.txt"),
            "#By changing the setting below to TRUE...\neula=false\n",
        )
        .unwrap();

        let path = accept(dir.path()).unwrap();
        let body = fs::read_to_string(path).unwrap();
        assert!(body.contains("eula=true"));
        assert!(!body.contains("eula=false"));
    }

    #[test]
    fn creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = accept(dir.path()).unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "eula=true\n");
    }

    #[test]
    fn already_accepted_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("eula.txt"), "eula=true\n").unwrap();
        let path = accept(dir.path()).unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "eula=true\n");
    }
}
