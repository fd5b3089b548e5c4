//! ETag 计算与 If-None-Match 校验。

use axum::http::{HeaderMap, header};
use std::fs::Metadata;
use std::time::UNIX_EPOCH;

/// 根据文件元数据生成弱 ETag。
pub fn etag_from_metadata(metadata: &Metadata) -> String {
    let size = metadata.len();
    let modified = metadata.modified().ok();
    if let Some(modified) = modified
        && let Ok(duration) = modified.duration_since(UNIX_EPOCH)
    {
        return format!(
            "W/\"{}-{}-{}\"",
            size,
            duration.as_secs(),
            duration.subsec_nanos()
        );
    }
    format!("W/\"{}\"", size)
}

/// 判断 If-None-Match 是否命中当前 ETag（命中时应返回 304）。
pub fn is_not_modified(headers: &HeaderMap, current_etag: &str) -> bool {
    let Some(value) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    if value.trim() == "*" {
        return true;
    }
    value
        .split(',')
        .map(|item| item.trim())
        .any(|item| weak_eq(item, current_etag))
}

fn weak_eq(a: &str, b: &str) -> bool {
    a.trim_start_matches("W/") == b.trim_start_matches("W/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use tempfile::tempdir;

    #[test]
    fn etag_changes_with_content_size() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("a.txt");
        std::fs::write(&path, b"one").expect("write");
        let first = etag_from_metadata(&std::fs::metadata(&path).expect("stat"));
        std::fs::write(&path, b"three").expect("write");
        let second = etag_from_metadata(&std::fs::metadata(&path).expect("stat"));
        assert!(first.starts_with("W/\"3-"));
        assert_ne!(first, second);
    }

    #[test]
    fn if_none_match_uses_weak_comparison() {
        let mut headers = HeaderMap::new();
        assert!(!is_not_modified(&headers, "W/\"1-2-3\""));

        headers.insert(
            header::IF_NONE_MATCH,
            HeaderValue::from_static("\"other\", \"1-2-3\""),
        );
        assert!(is_not_modified(&headers, "W/\"1-2-3\""));

        headers.insert(header::IF_NONE_MATCH, HeaderValue::from_static("*"));
        assert!(is_not_modified(&headers, "W/\"9\""));
    }
}
