//! 路由与按方法划分的请求入口。

use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Extension, Multipart, Query, Request};
use axum::http::{HeaderValue, StatusCode, Uri, header};
use axum::Router;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, error, warn};

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::files::send_file;
use crate::listing::{self, ListingContext};
use crate::sort::{SortDirection, SortKey, sort_entries};
use crate::storage::{clean_url_path, encode_url_path, read_entries, resolve_local_path};
use crate::upload::save_parts;

#[derive(Deserialize, Default)]
pub(crate) struct ListingQuery {
    sort: Option<String>,
    by: Option<String>,
}

/// 构建文件服务路由；GET 与 POST 之外的方法由 axum 返回 405。
pub fn build_router(config: Arc<ServerConfig>) -> Router {
    Router::new()
        .route("/", get(get_entry).post(post_entry))
        .route("/{*path}", get(get_entry).post(post_entry))
        .layer(DefaultBodyLimit::disable())
        .layer(Extension(config))
}

/// GET：目录列表、目录补全斜杠重定向或文件下载。
pub async fn get_entry(
    Extension(config): Extension<Arc<ServerConfig>>,
    request: Request,
) -> Result<Response, ApiError> {
    let raw_path = request.uri().path().to_string();
    let url_path = clean_url_path(&raw_path);
    let local_path = resolve_local_path(&config.root, &url_path);

    let metadata = fs::metadata(&local_path).await.map_err(|err| {
        error!(path = %local_path.display(), error = %err, "stat failed");
        ApiError::from(err)
    })?;

    if !metadata.is_dir() {
        return send_file(&local_path, &metadata, request).await;
    }
    if !raw_path.ends_with('/') {
        return found(&directory_location(&url_path));
    }

    let query = Query::<ListingQuery>::try_from_uri(request.uri())
        .map(|Query(query)| query)
        .unwrap_or_default();
    let sort_key = SortKey::from_query(query.sort.as_deref());
    let direction = SortDirection::from_query(query.by.as_deref());

    let mut entries = read_entries(&local_path).await.map_err(|err| {
        error!(path = %local_path.display(), error = %err, "read dir failed");
        ApiError::from(err)
    })?;
    sort_entries(&mut entries, sort_key, direction);
    debug!(
        path = %local_path.display(),
        count = entries.len(),
        sort = sort_key.as_str(),
        by = direction.as_str(),
        "list directory"
    );

    let is_root = url_path == "/";
    let ctx = ListingContext {
        url_path: if is_root {
            url_path
        } else {
            format!("{url_path}/")
        },
        is_root,
        upload_enabled: config.upload_enabled,
        sort_key,
        direction,
        entries,
    };
    let body = listing::render(&ctx).map_err(|err| {
        error!(path = %local_path.display(), "rendering listing failed");
        ApiError::Internal(err.to_string())
    })?;
    Ok(Html(body).into_response())
}

/// POST：把 multipart 表单中的文件写入当前目录，成功后重定向回原路径。
pub async fn post_entry(
    Extension(config): Extension<Arc<ServerConfig>>,
    uri: Uri,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    if !config.upload_enabled {
        warn!(path = uri.path(), "upload rejected, uploads are disabled");
        return Err(ApiError::MethodNotAllowed);
    }
    let url_path = clean_url_path(uri.path());
    let local_path = resolve_local_path(&config.root, &url_path);

    let multipart = multipart.map_err(|rejection| {
        error!(path = %local_path.display(), error = %rejection, "invalid multipart request");
        ApiError::Internal(rejection.body_text())
    })?;
    let saved = save_parts(multipart, &local_path).await.map_err(|err| {
        error!(path = %local_path.display(), error = ?err, "upload failed");
        err
    })?;
    debug!(path = %local_path.display(), saved, "upload finished");
    found(&directory_location(&url_path))
}

/// 由清理后的路径生成目录重定向地址，结果总以单个 `/` 开头。
fn directory_location(url_path: &str) -> String {
    if url_path == "/" {
        return "/".to_string();
    }
    format!("{}/", encode_url_path(url_path))
}

fn found(location: &str) -> Result<Response, ApiError> {
    let location = HeaderValue::from_str(location)
        .map_err(|_| ApiError::Internal("invalid redirect location".into()))?;
    Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body as AxumBody;
    use http_body_util::BodyExt;
    use std::path::Path;
    use tempfile::{TempDir, tempdir};
    use tower::ServiceExt;

    const BOUNDARY: &str = "goup-test-boundary";

    fn make_app(upload_enabled: bool) -> (TempDir, Router) {
        let temp = tempdir().expect("tempdir");
        let config = Arc::new(ServerConfig {
            root: temp.path().to_path_buf(),
            upload_enabled,
        });
        (temp, build_router(config))
    }

    async fn send(app: &Router, request: Request) -> Response {
        app.clone().oneshot(request).await.expect("infallible")
    }

    async fn get_path(app: &Router, uri: &str) -> Response {
        let request = Request::builder()
            .uri(uri)
            .body(AxumBody::empty())
            .unwrap();
        send(app, request).await
    }

    async fn body_text(response: Response) -> String {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        String::from_utf8(bytes.to_vec()).expect("utf8 body")
    }

    fn location(response: &Response) -> &str {
        response.headers()[header::LOCATION].to_str().unwrap()
    }

    /// `parts` 为 (字段名, 文件名, 内容)。
    fn multipart_request(uri: &str, parts: &[(&str, Option<&str>, &[u8])]) -> Request {
        let mut body = Vec::new();
        for (name, file_name, data) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match file_name {
                Some(file_name) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(AxumBody::from(body))
            .unwrap()
    }

    fn touch(root: &Path, name: &str, size: usize) {
        std::fs::write(root.join(name), vec![b'x'; size]).expect("write fixture");
    }

    fn order_of(body: &str, names: &[&str]) -> Vec<usize> {
        names
            .iter()
            .map(|name| {
                body.find(&format!(">{name}</a>"))
                    .unwrap_or_else(|| panic!("{name} missing from listing"))
            })
            .collect()
    }

    #[tokio::test]
    async fn listing_defaults_to_name_descending() {
        let (temp, app) = make_app(true);
        for name in ["a.txt", "c.txt", "b.txt"] {
            touch(temp.path(), name, 1);
        }

        let response = get_path(&app, "/").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        let positions = order_of(&body, &["c.txt", "b.txt", "a.txt"]);
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(!body.contains("<a href=\"../\">"));
    }

    #[tokio::test]
    async fn listing_ascending_reverses_size_order() {
        let (temp, app) = make_app(true);
        touch(temp.path(), "small", 1);
        touch(temp.path(), "medium", 10);
        touch(temp.path(), "large", 100);

        let body = body_text(get_path(&app, "/?sort=size").await).await;
        let positions = order_of(&body, &["large", "medium", "small"]);
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));

        let body = body_text(get_path(&app, "/?sort=size&by=asc").await).await;
        let positions = order_of(&body, &["small", "medium", "large"]);
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test]
    async fn unknown_sort_key_lists_by_name() {
        let (temp, app) = make_app(true);
        touch(temp.path(), "b", 1);
        touch(temp.path(), "a", 100);

        let body = body_text(get_path(&app, "/?sort=bogus&by=asc").await).await;
        let positions = order_of(&body, &["a", "b"]);
        assert!(positions[0] < positions[1]);
    }

    #[tokio::test]
    async fn directory_without_slash_redirects() {
        let (temp, app) = make_app(true);
        std::fs::create_dir(temp.path().join("docs")).expect("mkdir");

        let response = get_path(&app, "/docs").await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/docs/");

        let response = get_path(&app, "/docs/").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("<a href=\"../\">../</a>"));
    }

    #[tokio::test]
    async fn upload_round_trip() {
        let (temp, app) = make_app(true);
        std::fs::create_dir(temp.path().join("d")).expect("mkdir");

        let response = send(
            &app,
            multipart_request("/d/", &[("file", Some("x.txt"), b"uploaded bytes")]),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/d/");

        let response = get_path(&app, "/d/x.txt").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "uploaded bytes");
    }

    #[tokio::test]
    async fn upload_overwrites_and_skips_other_fields() {
        let (temp, app) = make_app(true);
        touch(temp.path(), "x.txt", 3);

        let response = send(
            &app,
            multipart_request(
                "/",
                &[
                    ("notes", None, b"ignored"),
                    ("file", Some("x.txt"), b"new"),
                    ("file", Some("y.txt"), b"second"),
                ],
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(std::fs::read(temp.path().join("x.txt")).unwrap(), b"new");
        assert_eq!(std::fs::read(temp.path().join("y.txt")).unwrap(), b"second");
        assert!(!temp.path().join("notes").exists());
    }

    #[tokio::test]
    async fn non_file_fields_write_nothing() {
        let (temp, app) = make_app(true);

        let response = send(
            &app,
            multipart_request("/", &[("notes", Some("notes.txt"), b"hello")]),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/");
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn upload_disabled_returns_405() {
        let (temp, app) = make_app(false);

        let response = send(
            &app,
            multipart_request("/", &[("file", Some("x.txt"), b"data")]),
        )
        .await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);

        let body = body_text(get_path(&app, "/").await).await;
        assert!(!body.contains("<form"));
    }

    #[tokio::test]
    async fn upload_into_missing_directory_fails() {
        let (_temp, app) = make_app(true);

        let response = send(
            &app,
            multipart_request("/missing/", &[("file", Some("x.txt"), b"data")]),
        )
        .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn malformed_multipart_is_internal_error() {
        let (_temp, app) = make_app(true);
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(AxumBody::from("not multipart"))
            .unwrap();

        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn missing_path_reports_error_text() {
        let (temp, app) = make_app(true);
        let expected = std::fs::metadata(temp.path().join("nope"))
            .unwrap_err()
            .to_string();

        let response = get_path(&app, "/nope").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_text(response).await, expected);
    }

    #[tokio::test]
    async fn other_methods_are_not_allowed() {
        let (_temp, app) = make_app(true);
        for method in ["PUT", "DELETE", "PATCH"] {
            let request = Request::builder()
                .method(method)
                .uri("/")
                .body(AxumBody::empty())
                .unwrap();
            let response = send(&app, request).await;
            assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED, "{method}");
        }
    }

    #[tokio::test]
    async fn traversal_is_clamped_to_root() {
        let (temp, app) = make_app(true);
        touch(temp.path(), "inside.txt", 4);

        let response = get_path(&app, "/../../inside.txt").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "xxxx");
    }

    #[tokio::test]
    async fn redirect_never_leaves_the_host() {
        let (_temp, app) = make_app(true);

        let response = get_path(&app, "//evil.example/..").await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/");
    }

    #[tokio::test]
    async fn redirect_uses_cleaned_encoded_path() {
        let (temp, app) = make_app(true);
        std::fs::create_dir_all(temp.path().join("my docs")).expect("mkdir");

        let response = get_path(&app, "/./my%20docs").await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/my%20docs/");

        let response = send(
            &app,
            multipart_request("//my%20docs/", &[("file", Some("x.txt"), b"data")]),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/my%20docs/");
    }

    #[tokio::test]
    async fn mode_sort_lists_directories_first() {
        let (temp, app) = make_app(true);
        std::fs::create_dir(temp.path().join("adir")).expect("mkdir");
        touch(temp.path(), "zfile", 1);

        let body = body_text(get_path(&app, "/?sort=mode").await).await;
        let positions = order_of(&body, &["adir/", "zfile"]);
        assert!(positions[0] < positions[1]);

        let body = body_text(get_path(&app, "/?sort=mode&by=asc").await).await;
        let positions = order_of(&body, &["zfile", "adir/"]);
        assert!(positions[0] < positions[1]);
    }
}
