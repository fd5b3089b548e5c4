//! 目录读取、请求路径清理与文件元数据。

use chrono::{DateTime, Utc};
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;

/// One child of a listed directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub modified: SystemTime,
    pub mode: u32,
    pub is_dir: bool,
}

impl FileEntry {
    pub fn from_metadata(name: String, metadata: &Metadata) -> Self {
        Self {
            name,
            size: metadata.len(),
            modified: metadata.modified().unwrap_or(UNIX_EPOCH),
            mode: mode_bits(metadata),
            is_dir: metadata.is_dir(),
        }
    }

    pub fn modified_display(&self) -> String {
        let datetime: DateTime<Utc> = self.modified.into();
        datetime.format("%Y-%m-%d %H:%M:%S").to_string()
    }

    pub fn mode_display(&self) -> String {
        format_mode(self.mode, self.is_dir)
    }
}

/// Percent-decodes and lexically cleans a request path.
///
/// The result always starts with `/`, never ends with one (except for the
/// root itself) and contains no `.` or `..` segments, so `..` can never climb
/// above the root.
pub fn clean_url_path(raw: &str) -> String {
    let decoded = urlencoding::decode(raw)
        .map(|value| value.into_owned())
        .unwrap_or_else(|_| raw.to_string());
    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return "/".to_string();
    }
    let mut cleaned = String::new();
    for segment in segments {
        cleaned.push('/');
        cleaned.push_str(segment);
    }
    cleaned
}

/// Percent-encodes each segment of a cleaned path, keeping the `/` separators.
pub fn encode_url_path(cleaned: &str) -> String {
    cleaned
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Joins an already cleaned URL path onto the served root.
pub fn resolve_local_path(root: &Path, cleaned: &str) -> PathBuf {
    let mut target = root.to_path_buf();
    for segment in cleaned.split('/').filter(|segment| !segment.is_empty()) {
        target.push(segment);
    }
    target
}

/// Reads every child of `dir` in whatever order the filesystem yields them.
pub async fn read_entries(dir: &Path) -> io::Result<Vec<FileEntry>> {
    let mut reader = fs::read_dir(dir).await?;
    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        let metadata = entry.metadata().await?;
        let name = entry.file_name().to_string_lossy().to_string();
        entries.push(FileEntry::from_metadata(name, &metadata));
    }
    Ok(entries)
}

/// File type and special bits, packed above the permission bits. Directories
/// outrank every other kind of entry under `sort=mode`.
pub const MODE_DIR: u32 = 1 << 31;
pub const MODE_SYMLINK: u32 = 1 << 27;
pub const MODE_DEVICE: u32 = 1 << 26;
pub const MODE_NAMED_PIPE: u32 = 1 << 25;
pub const MODE_SOCKET: u32 = 1 << 24;
pub const MODE_SETUID: u32 = 1 << 23;
pub const MODE_SETGID: u32 = 1 << 22;
pub const MODE_CHAR_DEVICE: u32 = 1 << 21;
pub const MODE_STICKY: u32 = 1 << 20;

#[cfg(unix)]
fn mode_bits(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::{FileTypeExt, PermissionsExt};

    let raw = metadata.permissions().mode();
    let file_type = metadata.file_type();
    let mut mode = raw & 0o777;
    if file_type.is_dir() {
        mode |= MODE_DIR;
    }
    if file_type.is_symlink() {
        mode |= MODE_SYMLINK;
    }
    if file_type.is_block_device() {
        mode |= MODE_DEVICE;
    }
    if file_type.is_char_device() {
        mode |= MODE_DEVICE | MODE_CHAR_DEVICE;
    }
    if file_type.is_fifo() {
        mode |= MODE_NAMED_PIPE;
    }
    if file_type.is_socket() {
        mode |= MODE_SOCKET;
    }
    if raw & 0o4000 != 0 {
        mode |= MODE_SETUID;
    }
    if raw & 0o2000 != 0 {
        mode |= MODE_SETGID;
    }
    if raw & 0o1000 != 0 {
        mode |= MODE_STICKY;
    }
    mode
}

#[cfg(not(unix))]
fn mode_bits(metadata: &Metadata) -> u32 {
    let perm = if metadata.permissions().readonly() {
        0o444
    } else {
        0o666
    };
    if metadata.is_dir() {
        MODE_DIR | perm | 0o111
    } else if metadata.file_type().is_symlink() {
        MODE_SYMLINK | perm
    } else {
        perm
    }
}

/// Renders mode bits the way `ls -l` does, e.g. `drwxr-xr-x`.
pub fn format_mode(mode: u32, is_dir: bool) -> String {
    let mut out = String::with_capacity(10);
    out.push(if is_dir { 'd' } else { '-' });
    const FLAGS: [(u32, char); 9] = [
        (0o400, 'r'),
        (0o200, 'w'),
        (0o100, 'x'),
        (0o040, 'r'),
        (0o020, 'w'),
        (0o010, 'x'),
        (0o004, 'r'),
        (0o002, 'w'),
        (0o001, 'x'),
    ];
    for (bit, flag) in FLAGS {
        out.push(if mode & bit != 0 { flag } else { '-' });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn clean_url_path_collapses_dots_and_slashes() {
        assert_eq!(clean_url_path("/"), "/");
        assert_eq!(clean_url_path(""), "/");
        assert_eq!(clean_url_path("/a//b/./c/"), "/a/b/c");
        assert_eq!(clean_url_path("/a/b/../c"), "/a/c");
    }

    #[test]
    fn clean_url_path_never_rises_above_root() {
        assert_eq!(clean_url_path("/../../etc/passwd"), "/etc/passwd");
        assert_eq!(clean_url_path("/%2e%2e/secret"), "/secret");
    }

    #[test]
    fn clean_url_path_decodes_percent_escapes() {
        assert_eq!(clean_url_path("/my%20docs/"), "/my docs");
    }

    #[test]
    fn encode_url_path_escapes_segments() {
        assert_eq!(encode_url_path("/"), "/");
        assert_eq!(encode_url_path("/my docs/a#b"), "/my%20docs/a%23b");
        assert_eq!(encode_url_path(&clean_url_path("//evil.example/..")), "/");
    }

    #[test]
    fn resolve_local_path_stays_under_root() {
        let root = Path::new("/srv/data");
        assert_eq!(resolve_local_path(root, "/"), PathBuf::from("/srv/data"));
        assert_eq!(
            resolve_local_path(root, &clean_url_path("/../x/y")),
            PathBuf::from("/srv/data/x/y")
        );
    }

    #[test]
    fn format_mode_matches_ls_style() {
        assert_eq!(format_mode(0o755, true), "drwxr-xr-x");
        assert_eq!(format_mode(MODE_DIR | 0o755, true), "drwxr-xr-x");
        assert_eq!(format_mode(0, false), "----------");
    }

    #[tokio::test]
    async fn read_entries_reports_files_and_directories() {
        let temp = tempdir().expect("tempdir");
        std::fs::write(temp.path().join("a.txt"), b"hello").expect("write file");
        std::fs::create_dir(temp.path().join("sub")).expect("create dir");

        let mut entries = read_entries(temp.path()).await.expect("read entries");
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[0].size, 5);
        assert!(!entries[0].is_dir);
        assert_eq!(entries[1].name, "sub");
        assert!(entries[1].is_dir);
        assert_ne!(entries[1].mode & MODE_DIR, 0);
        assert_eq!(entries[0].mode & MODE_DIR, 0);
        assert!(entries[1].mode > entries[0].mode);
    }

    #[tokio::test]
    async fn read_entries_fails_for_missing_directory() {
        let temp = tempdir().expect("tempdir");
        let result = read_entries(&temp.path().join("missing")).await;
        assert!(result.is_err());
    }
}
