//! 文件列表、下载与删除处理器。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use httpdate::fmt_http_date;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::storage::{PathError, Storage, StorageError, StoredFile, check_stored_name};
use crate::upload::UploadPolicy;

/// 重新读取目录并按名称排序。
pub async fn sorted_listing(storage: &Storage) -> Result<Vec<StoredFile>, ApiError> {
    let mut files = storage.list().await?;
    files.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    Ok(files)
}

/// 以 JSON 返回文件列表。
pub async fn list_files(
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<JsonResponse<Vec<StoredFile>>, ApiError> {
    let files = sorted_listing(&storage).await?;
    debug!(count = files.len(), "list files");
    Ok(JsonResponse(files))
}

/// 下载单个文件。
pub async fn download_file(
    Path(name): Path<String>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    debug!(name, "download requested");
    if let Err(err) = check_stored_name(&name) {
        warn!(name, "rejected download name");
        return Err(err.into());
    }
    if !UploadPolicy::is_approved(&name) {
        warn!(name, "download of unapproved file type");
        return Err(ApiError::BadRequest("Invalid file type".into()));
    }

    let (file, metadata) = storage.open(&name).await?;
    let size = metadata.len();
    let mime = mime_guess::from_path(&name).first_or_octet_stream();

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid mime type".into()))?,
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    if let Ok(modified) = metadata.modified() {
        headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&fmt_http_date(modified))
                .map_err(|_| ApiError::Internal("failed to build response header".into()))?,
        );
    }
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&content_disposition(&name))
            .map_err(|_| ApiError::Internal("failed to build response header".into()))?,
    );

    info!(name, size, "download file");
    Ok((
        StatusCode::OK,
        headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// 删除单个文件后重定向回首页。
pub async fn delete_file(
    Path(name): Path<String>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    debug!(name, "delete requested");
    if let Err(err) = storage.delete(&name).await {
        if matches!(err, StorageError::Path(PathError::NotFound)) {
            warn!(name, "file not found");
        }
        return Err(err.into());
    }
    info!(name, "file deleted");
    Ok(redirect_home())
}

/// 删除根目录下的全部文件后重定向回首页。
pub async fn delete_all_files(
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    let count = storage.delete_all().await?;
    info!(count, "deleted all files");
    Ok(redirect_home())
}

/// 存活探针。
pub async fn ping() -> &'static str {
    "pong"
}

fn redirect_home() -> Response {
    (StatusCode::FOUND, [(header::LOCATION, "/")]).into_response()
}

/// 生成的存储名用引号形式；其他进程放入的文件名（如非 ASCII）改用 RFC 5987 编码。
fn content_disposition(name: &str) -> String {
    let plain = name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if plain {
        format!("attachment; filename=\"{name}\"")
    } else {
        format!("attachment; filename*=UTF-8''{}", urlencoding::encode(name))
    }
}
