use crate::config::ModelConfig;
use std::path::Path;
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};

#[derive(Error, Debug)]
pub enum WeightsError {
    #[error("weights download failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("weights download failed: HTTP {0}")]
    BadStatus(reqwest::StatusCode),
    #[error("failed to write weights file: {0}")]
    Io(#[from] std::io::Error),
}

/// Make sure the ONNX weights file is present on disk, downloading it from
/// the configured URL on first start.
pub async fn ensure_weights(model_config: &ModelConfig) -> Result<(), WeightsError> {
    let path = model_config.get_model_path();
    if path.exists() {
        tracing::debug!("Model weights already present at {:?}", path);
        return Ok(());
    }

    tracing::info!(
        "Model weights not found at {:?}, downloading from {}",
        path,
        model_config.weights_url
    );

    fs::create_dir_all(&model_config.model_dir).await?;

    // Download to a sibling temp file and rename so a partial download never
    // masquerades as valid weights on the next start.
    let tmp = path.with_extension("part");
    if let Err(e) = download_to(&model_config.weights_url, &tmp).await {
        fs::remove_file(&tmp).await.ok();
        return Err(e);
    }
    fs::rename(&tmp, &path).await?;

    tracing::info!("Model weights saved to {:?}", path);

    Ok(())
}

async fn download_to(url: &str, dest: &Path) -> Result<(), WeightsError> {
    let mut response = reqwest::get(url).await?;
    if !response.status().is_success() {
        return Err(WeightsError::BadStatus(response.status()));
    }

    let mut file = fs::File::create(dest).await?;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_weights_skips_download_when_file_exists() {
        let dir = std::env::temp_dir().join(format!("image_enhance_weights_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let model_config = ModelConfig {
            onnx_file: "model.onnx".to_string(),
            model_dir: dir.clone(),
            // Unresolvable on purpose, ensure_weights must return before any request.
            weights_url: "http://invalid.invalid/model.onnx".to_string(),
            num_instances: 1,
        };
        std::fs::write(model_config.get_model_path(), b"weights").unwrap();

        let result = ensure_weights(&model_config).await;

        assert!(result.is_ok());

        std::fs::remove_dir_all(&dir).ok();
    }
}
