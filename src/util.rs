// util.rs - path, comment and file helpers shared by config.rs and json_store.rs

use std::io::Write;
use std::path::{Path, PathBuf};

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn expand_tilde(s: &str) -> String {
    match s.strip_prefix('~') {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            format!("{home}{rest}")
        }
        None => s.to_owned(),
    }
}

/// Resolve `value` against the directory containing `relative_to`.
pub fn resolve_path(value: &str, relative_to: &Path) -> PathBuf {
    let expanded = expand_tilde(value);
    let p = PathBuf::from(&expanded);
    if p.is_absolute() {
        p
    } else {
        relative_to.parent().unwrap_or(Path::new(".")).join(p)
    }
}

/// `$var`, else `$HOME/<fallback>`.
pub fn xdg_dir(var: &str, fallback: &str) -> PathBuf {
    std::env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(std::env::var("HOME").unwrap_or_default()).join(fallback))
}

// ── Comment stripper ──────────────────────────────────────────────────────────
//
// A `#` starts a comment at column 0 or when preceded by whitespace. A `#`
// glued to other text (`name = grid#2`) is kept.

pub fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'#' && (i == 0 || bytes[i - 1].is_ascii_whitespace()) {
            return &line[..i];
        }
    }
    line
}

// ── Atomic write ──────────────────────────────────────────────────────────────
//
// Write to a sibling temp file and rename over the target, so readers (and
// the file watcher) never see a half-written file.

pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("snapzones");
    let tmp = dir.join(format!(".{name}.tmp"));
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(contents)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_trailing_comment() {
        assert_eq!(strip_comment("autotile = off  # for now"), "autotile = off  ");
        assert_eq!(strip_comment("# whole line"), "");
    }

    #[test]
    fn glued_hash_is_kept() {
        assert_eq!(strip_comment("default_layout = grid#2"), "default_layout = grid#2");
    }

    #[test]
    fn expand_tilde_home() {
        std::env::set_var("HOME", "/home/user");
        assert_eq!(expand_tilde("~/.config"), "/home/user/.config");
        assert_eq!(expand_tilde("/absolute"), "/absolute");
    }

    #[test]
    fn resolve_relative_to_including_file() {
        assert_eq!(
            resolve_path("extra.conf", Path::new("/etc/snapzones/main.conf")),
            PathBuf::from("/etc/snapzones/extra.conf")
        );
        assert_eq!(
            resolve_path("/abs/x.conf", Path::new("/etc/snapzones/main.conf")),
            PathBuf::from("/abs/x.conf")
        );
    }

    #[test]
    fn atomic_write_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("a.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
        assert!(!dir.path().join("nested").join(".a.json.tmp").exists());
    }
}
