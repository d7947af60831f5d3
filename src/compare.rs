//! Structural comparison of two JSON block dumps.

use std::path::Path;

use serde_json::Value;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum CompareError {
    #[error("unable to read block file {path:?}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("unable to unmarshal block {path:?}: {source}")]
    Parse { path: String, source: serde_json::Error },
}

/// True when both files hold the same JSON value, regardless of key order
/// or formatting.
pub fn compare_block_files<A: AsRef<Path>, B: AsRef<Path>>(a: A, b: B) -> Result<bool, CompareError> {
    let (a, b) = (a.as_ref(), b.as_ref());
    info!(block_a_file_path = %a.display(), block_b_file_path = %b.display(), "comparing block files");
    Ok(load(a)? == load(b)?)
}

/// Shell command showing the difference between two files; `DIFF_EDITOR`
/// overrides the default `diff`.
pub fn diff_command(a: &Path, b: &Path, diff_editor: Option<&str>) -> String {
    match diff_editor.filter(|e| !e.is_empty()) {
        Some(editor) => format!("{editor} \"{}\" \"{}\"", a.display(), b.display()),
        None => format!("diff -C 5 \"{}\" \"{}\" | less", a.display(), b.display()),
    }
}

fn load(path: &Path) -> Result<Value, CompareError> {
    let display = path.display().to_string();
    let raw = std::fs::read(path).map_err(|source| CompareError::Read { path: display.clone(), source })?;
    serde_json::from_slice(&raw).map_err(|source| CompareError::Parse { path: display, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_order_and_whitespace_do_not_matter() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.json");
        let b = dir.path().join("b.json");
        let c = dir.path().join("c.json");
        std::fs::write(&a, r#"{"number": 5, "id": "ab", "trx": [1, 2]}"#).unwrap();
        std::fs::write(&b, "{\n  \"id\": \"ab\",\n  \"trx\": [1, 2],\n  \"number\": 5\n}").unwrap();
        std::fs::write(&c, r#"{"number": 5, "id": "ab", "trx": [2, 1]}"#).unwrap();

        assert!(compare_block_files(&a, &b).unwrap());
        assert!(!compare_block_files(&a, &c).unwrap());
    }

    #[test]
    fn reports_unreadable_and_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.json");
        let bad = dir.path().join("bad.json");
        std::fs::write(&good, "{}").unwrap();
        std::fs::write(&bad, "{not json").unwrap();

        assert!(matches!(compare_block_files(&good, &bad), Err(CompareError::Parse { .. })));
        assert!(matches!(
            compare_block_files(dir.path().join("missing.json"), &good),
            Err(CompareError::Read { .. })
        ));
    }

    #[test]
    fn diff_command_honours_editor() {
        let (a, b) = (Path::new("a.json"), Path::new("b.json"));
        assert_eq!(diff_command(a, b, None), "diff -C 5 \"a.json\" \"b.json\" | less");
        assert_eq!(diff_command(a, b, Some("meld")), "meld \"a.json\" \"b.json\"");
    }
}
