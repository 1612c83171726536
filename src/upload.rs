//! 上传校验（扩展名白名单与大小上限）与 multipart 上传处理器。

use axum::extract::multipart::{Field, MultipartError, MultipartRejection};
use axum::extract::{Extension, Multipart};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Json as JsonResponse;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::MULTIPART_OVERHEAD;
use crate::error::ApiError;
use crate::sanitize::stored_name;
use crate::storage::Storage;

/// 允许上传与下载的扩展名（小写）。
pub const APPROVED_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".img", ".svg", ".mp3", ".mp4", ".txt", ".xlsx", ".docx",
];

/// multipart 中承载文件的字段名。
pub const FILE_FIELD: &str = "file";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoFileReason {
    MissingPart,
    EmptyName,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationError {
    NoFile(NoFileReason),
    UnapprovedType,
    TooLarge { limit: u64 },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::NoFile(NoFileReason::MissingPart) => f.write_str("No file part"),
            ValidationError::NoFile(NoFileReason::EmptyName) => f.write_str("No selected file"),
            ValidationError::UnapprovedType => f.write_str("Unwanted file type"),
            ValidationError::TooLarge { .. } => f.write_str("File too large"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub max_size: u64,
}

impl UploadPolicy {
    pub fn new(max_size: u64) -> Self {
        Self { max_size }
    }

    /// 请求体在传输层的上限，为 multipart 分隔符预留余量。
    pub fn body_limit(&self) -> usize {
        usize::try_from(self.max_size.saturating_add(MULTIPART_OVERHEAD)).unwrap_or(usize::MAX)
    }

    pub fn is_approved(filename: &str) -> bool {
        let lower = filename.to_ascii_lowercase();
        APPROVED_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
    }

    /// 按 文件名 → 扩展名 → 声明大小 的顺序校验，全部发生在写入之前。
    pub fn validate(&self, declared_len: Option<u64>, filename: &str) -> Result<(), ValidationError> {
        if filename.is_empty() {
            return Err(ValidationError::NoFile(NoFileReason::EmptyName));
        }
        if !Self::is_approved(filename) {
            return Err(ValidationError::UnapprovedType);
        }
        if let Some(len) = declared_len
            && len > self.max_size
        {
            return Err(ValidationError::TooLarge {
                limit: self.max_size,
            });
        }
        Ok(())
    }
}

#[derive(Serialize)]
pub(crate) struct UploadResponse {
    message: &'static str,
    filename: String,
}

/// 接收 multipart 中的 `file` 字段并以生成的存储名保存。
pub async fn upload_file(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(policy): Extension<Arc<UploadPolicy>>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, JsonResponse<UploadResponse>), ApiError> {
    let Ok(mut multipart) = multipart else {
        warn!("upload without multipart body");
        return Err(ValidationError::NoFile(NoFileReason::MissingPart).into());
    };
    let request_len = content_length(&headers);

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| multipart_error(err, policy.max_size))?
    {
        if field.name() != Some(FILE_FIELD) {
            debug!(field = field.name().unwrap_or(""), "skipping multipart field");
            continue;
        }
        return receive_file(&storage, &policy, request_len, field).await;
    }

    warn!("no file part in upload request");
    Err(ValidationError::NoFile(NoFileReason::MissingPart).into())
}

async fn receive_file(
    storage: &Storage,
    policy: &UploadPolicy,
    request_len: Option<u64>,
    mut field: Field<'_>,
) -> Result<(StatusCode, JsonResponse<UploadResponse>), ApiError> {
    let raw_name = field.file_name().unwrap_or_default().to_string();
    let declared = content_length(field.headers()).or(request_len);
    debug!(filename = raw_name, declared, "file received");
    if let Err(err) = policy.validate(declared, &raw_name) {
        warn!(filename = raw_name, declared, error = %err, "upload rejected");
        return Err(err.into());
    }

    let name = stored_name(Utc::now().timestamp(), &raw_name);
    // 清洗可能丢掉扩展名，之后将无法下载
    if !UploadPolicy::is_approved(&name) {
        warn!(filename = raw_name, stored = name, "extension lost during sanitizing");
        return Err(ValidationError::UnapprovedType.into());
    }

    let mut staged = storage.stage(&name).await?;
    let write_result: Result<(), ApiError> = async {
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|err| multipart_error(err, policy.max_size))?
        {
            if staged.written() + chunk.len() as u64 > policy.max_size {
                return Err(ValidationError::TooLarge {
                    limit: policy.max_size,
                }
                .into());
            }
            staged
                .write_chunk(&chunk)
                .await
                .map_err(|err| ApiError::Internal(err.to_string()))?;
        }
        Ok(())
    }
    .await;
    if let Err(err) = write_result {
        warn!(stored = name, written = staged.written(), "upload aborted");
        staged.discard().await;
        return Err(err);
    }

    let size = staged.written();
    staged
        .publish()
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    info!(stored = name, size, "file uploaded");

    Ok((
        StatusCode::CREATED,
        JsonResponse(UploadResponse {
            message: "File uploaded successfully",
            filename: name,
        }),
    ))
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

fn multipart_error(err: MultipartError, limit: u64) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return ValidationError::TooLarge { limit }.into();
    }
    ApiError::BadRequest(err.body_text())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checks_run_in_order() {
        let policy = UploadPolicy::new(10);
        assert_eq!(
            policy.validate(Some(100), ""),
            Err(ValidationError::NoFile(NoFileReason::EmptyName))
        );
        assert_eq!(
            policy.validate(Some(100), "run.exe"),
            Err(ValidationError::UnapprovedType)
        );
        assert_eq!(
            policy.validate(Some(100), "notes.txt"),
            Err(ValidationError::TooLarge { limit: 10 })
        );
        assert_eq!(policy.validate(Some(10), "notes.txt"), Ok(()));
        assert_eq!(policy.validate(None, "notes.txt"), Ok(()));
    }

    #[test]
    fn extension_match_is_case_insensitive() {
        assert!(UploadPolicy::is_approved("PHOTO.JPG"));
        assert!(UploadPolicy::is_approved("sheet.xlsx"));
        assert!(!UploadPolicy::is_approved("archive.tar.gz"));
        assert!(!UploadPolicy::is_approved("txt"));
        assert!(!UploadPolicy::is_approved("page.html"));
    }

    #[test]
    fn error_messages() {
        assert_eq!(
            ValidationError::NoFile(NoFileReason::MissingPart).to_string(),
            "No file part"
        );
        assert_eq!(ValidationError::UnapprovedType.to_string(), "Unwanted file type");
    }

    #[test]
    fn body_limit_leaves_room_for_framing() {
        let policy = UploadPolicy::new(1024);
        assert_eq!(policy.body_limit() as u64, 1024 + MULTIPART_OVERHEAD);
    }
}
