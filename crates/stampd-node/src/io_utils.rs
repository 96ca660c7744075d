use std::fs;
use std::path::Path;

pub fn parse_hex32(name: &str, value: &str) -> Result<[u8; 32], String> {
    let bytes = hex::decode(value.trim()).map_err(|e| format!("{name}: {e}"))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| format!("{name}: expected 32 bytes, got {}", b.len()))
}

/// Write `data` beside `path` and rename it into place, so readers never see
/// a half-written dump.
pub fn write_file_atomic(path: &Path, data: &[u8]) -> Result<(), String> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| format!("create parent {}: {e}", parent.display()))?;
    }
    let tmp_path = format!("{}.tmp.{}", path.display(), std::process::id());
    fs::write(&tmp_path, data).map_err(|e| format!("write temp {tmp_path}: {e}"))?;
    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        format!("rename temp {tmp_path} -> {}: {e}", path.display())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hex32_checks_length() {
        assert_eq!(parse_hex32("digest", &"0a".repeat(32)).unwrap(), [0x0a; 32]);
        assert!(parse_hex32("digest", "0a0b").unwrap_err().contains("got 2"));
        assert!(parse_hex32("digest", "zz").is_err());
    }

    #[test]
    fn write_file_atomic_replaces_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dumps").join("stampd.jsonl");
        write_file_atomic(&path, b"first").expect("write");
        write_file_atomic(&path, b"second").expect("rewrite");
        assert_eq!(fs::read(&path).expect("read"), b"second");
    }
}
