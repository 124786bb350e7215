use crate::{
    config::ModelConfig,
    model_service::{ModelService, UpscaleError, UPSCALE_FACTOR},
};
use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use ndarray::{Array, ArrayD, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::io::Cursor;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

const OUTPUT_NAME: &str = "output";

/// Decode an uploaded byte buffer into a `[1, 3, H, W]` float tensor scaled
/// to `[0, 1]`, along with the original dimensions.
fn decode_image(image_data: &[u8]) -> Result<(Array<f32, Ix4>, u32, u32), UpscaleError> {
    let image_reader = image::ImageReader::new(Cursor::new(image_data))
        .with_guessed_format()
        .map_err(|e| UpscaleError::Decode(e.to_string()))?;

    let original_img = image_reader
        .decode()
        .map_err(|e| UpscaleError::Decode(e.to_string()))?;

    let img = original_img.to_rgb8();
    let (img_width, img_height) = img.dimensions();

    let mut input = Array::zeros((1, 3, img_height as usize, img_width as usize));
    for (x, y, pixel) in img.enumerate_pixels() {
        let x = x as usize;
        let y = y as usize;
        let [r, g, b] = pixel.0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    Ok((input, img_width, img_height))
}

/// Encode a `[1, 3, H, W]` float tensor back into PNG bytes, clamping to the
/// `[0, 1]` range before quantization.
fn encode_png(output: ArrayD<f32>) -> Result<Vec<u8>, UpscaleError> {
    let output = output
        .into_dimensionality::<Ix4>()
        .map_err(|e| UpscaleError::OutputShape(e.to_string()))?;

    let (out_height, out_width) = (output.shape()[2], output.shape()[3]);

    let mut img = RgbImage::new(out_width as u32, out_height as u32);
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        let x = x as usize;
        let y = y as usize;
        let r = output[[0, 0, y, x]].clamp(0.0, 1.0);
        let g = output[[0, 1, y, x]].clamp(0.0, 1.0);
        let b = output[[0, 2, y, x]].clamp(0.0, 1.0);
        *pixel = Rgb([
            (r * 255.).round() as u8,
            (g * 255.).round() as u8,
            (b * 255.).round() as u8,
        ]);
    }

    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
}

#[derive(Clone)]
pub struct OrtModelService {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: Arc<AtomicUsize>,
}

impl OrtModelService {
    pub fn new(model_config: &ModelConfig) -> Result<Self, Box<dyn std::error::Error>> {
        ort::init().commit()?;
        let num_instances = model_config.num_instances;
        let sessions = (0..num_instances)
            .map(|_| {
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .commit_from_file(model_config.get_model_path())?;
                Ok(Arc::new(Mutex::new(session)))
            })
            .collect::<Result<Vec<_>, ort::Error>>()?;

        tracing::info!("Created {} ONNX sessions", num_instances);

        Ok(Self {
            sessions: Arc::new(sessions),
            counter: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn run_inference(&self, input: &Array<f32, Ix4>) -> Result<ArrayD<f32>, UpscaleError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let session_arc = &self.sessions[index];
        let mut session = session_arc
            .lock()
            .map_err(|_| UpscaleError::SessionPoisoned)?;

        tracing::debug!("Handling request with session {}", index);

        let tensor_ref = TensorRef::from_array_view(input.view())?;
        let input_tensor = ort::inputs![tensor_ref];

        let outputs = session.run(input_tensor)?;

        let (shape, data) = outputs[OUTPUT_NAME].try_extract_tensor::<f32>()?;

        let ix = shape.to_ixdyn();
        let array = ArrayD::from_shape_vec(ix, data.to_vec())
            .map_err(|e| UpscaleError::OutputShape(e.to_string()))?;

        Ok(array)
    }
}

#[async_trait]
impl ModelService for OrtModelService {
    async fn upscale(&self, image_data: Vec<u8>) -> Result<Vec<u8>, UpscaleError> {
        let (input, img_width, img_height) = decode_image(&image_data)?;
        tracing::debug!("Upscaling {}x{} image", img_width, img_height);

        let output = self.run_inference(&input)?;

        if output.ndim() == 4 {
            let (out_height, out_width) = (output.shape()[2] as u32, output.shape()[3] as u32);
            if out_width != img_width * UPSCALE_FACTOR || out_height != img_height * UPSCALE_FACTOR
            {
                tracing::warn!(
                    "Model returned {}x{} for a {}x{} input, expected a {}x upscale",
                    out_width,
                    out_height,
                    img_width,
                    img_height,
                    UPSCALE_FACTOR
                );
            }
        }

        encode_png(output)
    }
}
