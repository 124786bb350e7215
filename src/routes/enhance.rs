use crate::{
    model_service::{ModelService, UpscaleError},
    server::SharedState,
};
use axum::{
    extract::{multipart::MultipartError, Multipart, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum EnhanceError {
    #[error("failed to read multipart body: {0}")]
    Multipart(#[from] MultipartError),
    #[error("no image file found in request")]
    MissingFile,
    #[error("upscale failed: {0}")]
    Upscale(#[from] UpscaleError),
    #[error("HTTP builder failed: {0}")]
    HttpBuilder(String),
}

impl IntoResponse for EnhanceError {
    fn into_response(self) -> Response {
        let status = match self {
            EnhanceError::Multipart(_) | EnhanceError::MissingFile => StatusCode::BAD_REQUEST,
            EnhanceError::Upscale(_) | EnhanceError::HttpBuilder(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, format!("Something went wrong: {}", self)).into_response()
    }
}

#[instrument(skip(state, multipart))]
pub async fn enhance<M: ModelService>(
    State(state): State<SharedState<M>>,
    mut multipart: Multipart,
) -> Result<Response, EnhanceError> {
    let mut image_data = None;
    while let Some(field) = multipart.next_field().await? {
        if field.file_name().is_some() || field.name() == Some("file") {
            image_data = Some(field.bytes().await?.to_vec());
            break;
        }
    }
    let image_data = image_data.ok_or(EnhanceError::MissingFile)?;

    let png_data = state.model_service.upscale(image_data).await?;

    let response = Response::builder()
        .header(header::CONTENT_TYPE, "image/png")
        .body(axum::body::Body::from(png_data))
        .map_err(|e| EnhanceError::HttpBuilder(e.to_string()))?;

    Ok(response)
}
