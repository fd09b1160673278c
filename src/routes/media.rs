use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::Json;

use crate::app_state::AppState;
use crate::models::requests::MediaUploadResponse;
use crate::routes::jobs::ApiError;

/// POST /api/v1/media — store an uploaded source video or product image.
///
/// Images are sniffed and stored under their real content type; anything
/// else is accepted as a video and checked when a job analyses it.
pub async fn upload_media(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<MediaUploadResponse>), ApiError> {
    let mut upload: Option<(Vec<u8>, String)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Malformed multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let declared = field.content_type().map(str::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("Failed to read upload: {}", e)))?;

        let content_type = match image::guess_format(&data) {
            Ok(format) => format.to_mime_type().to_string(),
            Err(_) => match declared {
                Some(ct) if ct.starts_with("image/") => {
                    return Err(ApiError::new(
                        StatusCode::UNSUPPORTED_MEDIA_TYPE,
                        "unsupported_media",
                        "Unrecognized image format",
                    ))
                }
                Some(ct) if ct.starts_with("video/") => ct,
                _ => "video/mp4".to_string(),
            },
        };
        upload = Some((data.to_vec(), content_type));
    }

    let (data, content_type) =
        upload.ok_or_else(|| ApiError::bad_request("Missing 'file' field"))?;
    if data.is_empty() {
        return Err(ApiError::bad_request("Uploaded file is empty"));
    }

    let media_ref = state.storage.put(&data, &content_type).await.map_err(|e| {
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "storage_unavailable",
            e.to_string(),
        )
    })?;
    tracing::info!(media = %media_ref, content_type = %content_type, size = data.len(), "Media stored");

    Ok((
        StatusCode::CREATED,
        Json(MediaUploadResponse {
            media_ref,
            size: data.len(),
        }),
    ))
}
