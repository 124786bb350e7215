use async_trait::async_trait;
use thiserror::Error;

/// Fixed multiplier the pre-trained network applies to both image dimensions.
pub const UPSCALE_FACTOR: u32 = 4;

#[derive(Error, Debug)]
pub enum UpscaleError {
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error("model session lock poisoned")]
    SessionPoisoned,
    #[error("inference failed: {0}")]
    Inference(#[from] ort::Error),
    #[error("unexpected model output: {0}")]
    OutputShape(String),
    #[error("failed to encode png: {0}")]
    Encode(#[from] image::ImageError),
}

#[async_trait]
pub trait ModelService: Send + Sync + Clone + 'static {
    async fn upscale(&self, image_data: Vec<u8>) -> Result<Vec<u8>, UpscaleError>;
}
