use crate::config::Config;
use crate::ort_service::OrtModelService;
use crate::server::HttpServer;
use crate::weights;

use std::{error::Error, sync::Arc};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    if let Err(e) = weights::ensure_weights(&config.model).await {
        tracing::error!("Failed to fetch model weights: {:?}", e);
        return Err(Box::new(e));
    }

    let model_service = match OrtModelService::new(&config.model) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            tracing::error!("Failed to initialize model service: {:?}", e);
            return Err(e);
        }
    };

    let server = HttpServer::new(model_service, &config).await?;

    server.run().await?;

    Ok(())
}
