use std::fs;
use std::path::Path;

/// Truncate to `max` characters, marking the cut with `...` (Unicode-safe).
pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// Strip a surrounding markdown code fence (```lang ... ```) from a model reply.
pub fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return text;
    }
    // Drop the opening fence line, including any language tag.
    let body = match trimmed.find('\n') {
        Some(idx) => &trimmed[idx + 1..],
        None => return "",
    };
    let body = body.trim_end();
    match body.strip_suffix("```") {
        Some(inner) => inner.strip_suffix('\n').unwrap_or(inner),
        None => body,
    }
}

/// Write `content` to `path` through a sibling temp file and a rename.
///
/// Readers see either the old or the new file, never a partial one. When
/// `path` already exists its permissions are carried over to the new file.
pub fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{}.tmp", file_name));
    fs::write(&tmp_path, content)?;

    if let Ok(meta) = fs::metadata(path) {
        let _ = fs::set_permissions(&tmp_path, meta.permissions());
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_truncate_unicode_safe() {
        assert_eq!(truncate("错误: 失败 😊", 6), "错误:...");
        assert_eq!(truncate("ok", 10), "ok");
        assert_eq!(truncate("abcdef", 0), "");
    }

    #[test]
    fn test_strip_markdown_fences() {
        assert_eq!(strip_markdown_fences("```python\nx = 1\n```"), "x = 1");
        assert_eq!(strip_markdown_fences("```\na\nb\n```\n"), "a\nb");
        assert_eq!(strip_markdown_fences("plain\n"), "plain\n");
    }

    #[test]
    fn test_write_atomic_replaces_content_and_leaves_no_temp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
