//! 目录条目排序：排序键、方向与比较规则。

use std::cmp::Ordering;

use crate::storage::FileEntry;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortKey {
    #[default]
    Name,
    Time,
    Size,
    Mode,
}

impl SortKey {
    pub const ALL: [SortKey; 4] = [SortKey::Name, SortKey::Size, SortKey::Time, SortKey::Mode];

    /// 解析 `sort` 查询参数，未识别的值回退为按名称排序。
    pub fn from_query(value: Option<&str>) -> Self {
        match value {
            Some("time") => SortKey::Time,
            Some("size") => SortKey::Size,
            Some("mode") => SortKey::Mode,
            _ => SortKey::Name,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SortKey::Name => "name",
            SortKey::Time => "time",
            SortKey::Size => "size",
            SortKey::Mode => "mode",
        }
    }
}

/// 每个排序键的默认展示顺序都是降序，只有 `by=asc` 才会翻转为升序。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    #[default]
    Descending,
}

impl SortDirection {
    /// 解析 `by` 查询参数。
    pub fn from_query(value: Option<&str>) -> Self {
        match value {
            Some("asc") => SortDirection::Ascending,
            _ => SortDirection::Descending,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SortDirection::Ascending => "asc",
            SortDirection::Descending => "desc",
        }
    }

    pub fn flipped(self) -> Self {
        match self {
            SortDirection::Ascending => SortDirection::Descending,
            SortDirection::Descending => SortDirection::Ascending,
        }
    }
}

fn compare_key(key: SortKey, a: &FileEntry, b: &FileEntry) -> Ordering {
    match key {
        SortKey::Mode => a.mode.cmp(&b.mode),
        SortKey::Time => a.modified.cmp(&b.modified),
        SortKey::Size => a.size.cmp(&b.size),
        SortKey::Name => a.name.as_bytes().cmp(b.name.as_bytes()),
    }
}

/// 按给定键与方向原地排序；相等键保持原有读取顺序。
pub fn sort_entries(entries: &mut [FileEntry], key: SortKey, direction: SortDirection) {
    match direction {
        SortDirection::Ascending => entries.sort_by(|a, b| compare_key(key, a, b)),
        SortDirection::Descending => entries.sort_by(|a, b| compare_key(key, b, a)),
    }
}
