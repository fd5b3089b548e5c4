//! multipart 表单上传：把 `file` 字段写入目标目录。

use axum::extract::Multipart;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::ApiError;

pub const FILE_FIELD: &str = "file";

/// 逐个处理表单字段，返回写入的文件数。
///
/// 任一字段出错立即中止；此前已写入的文件保留在磁盘上。
pub async fn save_parts(mut multipart: Multipart, dest_dir: &Path) -> Result<usize, ApiError> {
    let mut saved = 0;
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
    {
        let form_name = field.name().unwrap_or_default().to_string();
        if form_name != FILE_FIELD {
            info!(form_name, "skipping form field");
            continue;
        }
        let target = destination(dest_dir, field.file_name())?;
        info!(form_name, path = %target.display(), "handling upload");

        let mut file = File::create(&target)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        let mut written: u64 = 0;
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|err| ApiError::Internal(err.to_string()))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        debug!(path = %target.display(), bytes = written, "upload saved");
        saved += 1;
    }
    Ok(saved)
}

/// 只取客户端文件名的最后一段，已存在的同名文件会被覆盖。
fn destination(dest_dir: &Path, file_name: Option<&str>) -> Result<PathBuf, ApiError> {
    let name = file_name
        .and_then(|name| Path::new(name).file_name())
        .ok_or_else(|| ApiError::Internal("missing file name in upload".into()))?;
    Ok(dest_dir.join(name))
}
