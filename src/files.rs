//! 单文件下载：条件请求、Range 与 ETag。

use axum::body::Body as AxumBody;
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use httpdate::fmt_http_date;
use std::fs::Metadata;
use std::path::Path;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::info;

use crate::error::ApiError;
use crate::etag::{etag_from_metadata, is_not_modified};

/// 发送已 stat 过的文件；Range 与 If-Modified-Since 交给 `ServeFile` 处理。
pub async fn send_file(
    local_path: &Path,
    metadata: &Metadata,
    mut request: Request,
) -> Result<Response, ApiError> {
    let etag = etag_from_metadata(metadata);
    let etag_value =
        HeaderValue::from_str(&etag).map_err(|_| ApiError::Internal("响应头构建失败".into()))?;

    if is_not_modified(request.headers(), &etag) {
        let mut headers = HeaderMap::new();
        headers.insert(header::ETAG, etag_value);
        if let Ok(modified) = metadata.modified() {
            headers.insert(
                header::LAST_MODIFIED,
                HeaderValue::from_str(&fmt_http_date(modified))
                    .map_err(|_| ApiError::Internal("响应头构建失败".into()))?,
            );
        }
        return Ok((StatusCode::NOT_MODIFIED, headers).into_response());
    }

    // If-None-Match 存在时忽略 If-Modified-Since（RFC 9110 13.1.3）。
    if request.headers().contains_key(header::IF_NONE_MATCH) {
        request.headers_mut().remove(header::IF_MODIFIED_SINCE);
    }

    let mime = mime_guess::from_path(local_path).first_or_octet_stream();
    info!(path = %local_path.display(), size = metadata.len(), "serving file");
    let response = ServeFile::new_with_mime(local_path, &mime)
        .oneshot(request)
        .await
        .unwrap_or_else(|never| match never {});
    let mut response = response.map(AxumBody::new);
    if response.status().is_success() {
        response.headers_mut().insert(header::ETAG, etag_value);
    }
    Ok(response)
}
