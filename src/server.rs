use crate::{
    config::{Config, CorsConfig},
    model_service::ModelService,
    routes::api_routes,
};
use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    Router,
};
use std::sync::Arc;
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct SharedState<M: ModelService> {
    pub model_service: Arc<M>,
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new<M: ModelService>(
        model_service: Arc<M>,
        config: &Config,
    ) -> anyhow::Result<Self> {
        let addr = config.server.get_address();

        let app_state = SharedState { model_service };
        let router = build_router(app_state, &config.cors)?;

        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        let shutdown = async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, starting graceful shutdown");
        };

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

fn build_router<M: ModelService>(
    app_state: SharedState<M>,
    cors_config: &CorsConfig,
) -> anyhow::Result<Router> {
    let origin = cors_config
        .allowed_origin
        .parse::<HeaderValue>()
        .with_context(|| format!("invalid CORS origin: {}", cors_config.allowed_origin))?;

    let cors_layer = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true);

    // Uploads are passed through whole; no size cap is enforced.
    Ok(api_routes()
        .with_state(app_state)
        .layer(DefaultBodyLimit::disable())
        .layer(cors_layer))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_service::{UpscaleError, UPSCALE_FACTOR};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use image::{imageops::FilterType, ImageFormat};
    use std::io::Cursor;
    use tower::ServiceExt;

    const ALLOWED_ORIGIN: &str = "http://localhost:3000";

    // Honors the fixed-factor contract without a real ONNX session.
    #[derive(Clone)]
    struct MockModelService {}

    #[async_trait]
    impl ModelService for MockModelService {
        async fn upscale(&self, image_data: Vec<u8>) -> Result<Vec<u8>, UpscaleError> {
            let img = image::load_from_memory(&image_data)
                .map_err(|e| UpscaleError::Decode(e.to_string()))?
                .to_rgb8();
            let (width, height) = img.dimensions();
            let upscaled = image::imageops::resize(
                &img,
                width * UPSCALE_FACTOR,
                height * UPSCALE_FACTOR,
                FilterType::Nearest,
            );

            let mut buf = Cursor::new(Vec::new());
            upscaled.write_to(&mut buf, ImageFormat::Png)?;
            Ok(buf.into_inner())
        }
    }

    fn test_router() -> Router {
        let app_state = SharedState {
            model_service: Arc::new(MockModelService {}),
        };
        let cors_config = CorsConfig {
            allowed_origin: ALLOWED_ORIGIN.to_string(),
        };
        build_router(app_state, &cors_config).unwrap()
    }

    fn multipart_request(field_name: &str, filename: Option<&str>, data: &[u8]) -> Request<Body> {
        let boundary = "test-boundary";
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        let disposition = match filename {
            Some(f) => format!(
                "Content-Disposition: form-data; name=\"{field_name}\"; filename=\"{f}\"\r\n\r\n"
            ),
            None => format!("Content-Disposition: form-data; name=\"{field_name}\"\r\n\r\n"),
        };
        body.extend_from_slice(disposition.as_bytes());
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        Request::builder()
            .method(Method::POST)
            .uri("/enhance")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::ImageBuffer::<image::Rgb<u8>, Vec<u8>>::from_pixel(
            width,
            height,
            image::Rgb([0, 128, 255]),
        );
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[tokio::test]
    async fn test_healthcheck() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_enhance_returns_upscaled_png() {
        let request = multipart_request("file", Some("input.png"), &png_bytes(3, 5));

        let response = test_router().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/png"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let img = image::load_from_memory(&body).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), (3 * UPSCALE_FACTOR, 5 * UPSCALE_FACTOR));
    }

    #[tokio::test]
    async fn test_enhance_rejects_non_image_payload() {
        let request = multipart_request("file", Some("input.png"), b"definitely not an image");

        let response = test_router().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_enhance_without_file_field_is_bad_request() {
        let request = multipart_request("comment", None, b"just text");

        let response = test_router().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cors_preflight_allows_configured_origin() {
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/enhance")
            .header(header::ORIGIN, ALLOWED_ORIGIN)
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();

        let response = test_router().oneshot(request).await.unwrap();

        let allow_origin = response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .unwrap();
        assert_eq!(allow_origin, ALLOWED_ORIGIN);
    }

    #[tokio::test]
    async fn test_cors_preflight_ignores_other_origins() {
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/enhance")
            .header(header::ORIGIN, "http://evil.example")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();

        let response = test_router().oneshot(request).await.unwrap();

        assert!(response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_none());
    }
}
