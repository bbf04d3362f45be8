// THEORY:
// Turns a finished attack back into pictures. For every frame of an attacked video two
// 8-bit RGB PNGs are produced:
//
//   <out>/adversarial/<video>/<frame>.png   composed frame + mean, clipped to the pixel range
//   <out>/noise/<video>/<frame>.png         |perturbation| * 255 on perturbable frames, black elsewhere
//
// Rendering (array -> interleaved bytes) is split from encoding (bytes -> file) so callers
// can push the encoding onto worker threads.

use crate::core_modules::classifier::DataSpec;
use crate::core_modules::temporal_indicator::TemporalIndicator;
use crate::error::{AttackError, Result};
use crate::pipeline::VideoResult;
use image::ImageEncoder;
use ndarray::{ArrayView3, Axis};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

const NOISE_GAIN: f32 = 255.0;

/// Writes an 8-bit RGB buffer as a PNG file.
pub fn save(path: &Path, width: u32, height: u32, buffer: &[u8]) -> Result<()> {
    let output = BufWriter::new(std::fs::File::create(path)?);
    let encoder = image::codecs::png::PngEncoder::new(output);

    encoder.write_image(buffer, width, height, image::ExtendedColorType::Rgb8)?;

    Ok(())
}

/// One frame, rendered and waiting to be encoded.
#[derive(Debug, Clone)]
pub struct RenderedFrame {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl RenderedFrame {
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        save(&self.path, self.width, self.height, &self.pixels)
    }
}

/// Interleaves a `(channels, height, width)` frame into RGB bytes after `map` and clipping.
fn interleave(frame: ArrayView3<f32>, lower: f32, upper: f32, map: impl Fn(usize, f32) -> f32) -> Vec<u8> {
    let (channels, height, width) = frame.dim();
    let mut pixels = Vec::with_capacity(height * width * channels);
    for y in 0..height {
        for x in 0..width {
            for c in 0..channels {
                let value = map(c, frame[[c, y, x]]).clamp(lower, upper);
                pixels.push(value.round().clamp(0.0, 255.0) as u8);
            }
        }
    }
    pixels
}

/// Composed, mean-centred frame back to displayable pixels.
pub fn adversarial_pixels(frame: ArrayView3<f32>, spec: &DataSpec) -> Vec<u8> {
    interleave(frame, spec.rescale.0, spec.rescale.1, |c, v| v + spec.mean[c])
}

pub fn noise_pixels(perturbation: ArrayView3<f32>) -> Vec<u8> {
    interleave(perturbation, 0.0, 255.0, |_, v| v.abs() * NOISE_GAIN)
}

fn frame_file_name(frame: &Path, index: usize) -> String {
    frame
        .file_stem()
        .and_then(|stem| stem.to_str())
        .map(|stem| format!("{stem}.png"))
        .unwrap_or_else(|| format!("{index:04}.png"))
}

/// Renders every frame of an attacked video. Skipped videos render to nothing.
pub fn render_video(
    result: &VideoResult,
    spec: &DataSpec,
    indicator: &TemporalIndicator,
    out_dir: &Path,
) -> Result<Vec<RenderedFrame>> {
    let outcome = &result.outcome;
    if outcome.was_skipped() {
        return Ok(Vec::new());
    }
    if spec.mean.len() != outcome.composed.len_of(Axis(1)) {
        return Err(AttackError::ShapeMismatch(format!(
            "{} mean values for {} channels",
            spec.mean.len(),
            outcome.composed.len_of(Axis(1))
        )));
    }

    let (_, channels, height, width) = outcome.composed.dim();
    let adversarial_dir = out_dir.join("adversarial").join(&result.sample.name);
    let noise_dir = out_dir.join("noise").join(&result.sample.name);
    let mut rendered = Vec::with_capacity(2 * result.frames.len());

    for (t, frame_path) in result.frames.iter().enumerate() {
        let file_name = frame_file_name(frame_path, t);
        let composed = outcome.composed.index_axis(Axis(0), t);
        rendered.push(RenderedFrame {
            path: adversarial_dir.join(&file_name),
            width: width as u32,
            height: height as u32,
            pixels: adversarial_pixels(composed, spec),
        });

        let noise = if indicator.is_perturbable(t) {
            noise_pixels(outcome.perturbation.index_axis(Axis(0), t))
        } else {
            vec![0u8; channels * height * width]
        };
        rendered.push(RenderedFrame {
            path: noise_dir.join(&file_name),
            width: width as u32,
            height: height as u32,
            pixels: noise,
        });
    }
    Ok(rendered)
}

/// Renders and writes a video on the calling thread.
pub fn write_video(result: &VideoResult, spec: &DataSpec, indicator: &TemporalIndicator, out_dir: &Path) -> Result<usize> {
    let rendered = render_video(result, spec, indicator, out_dir)?;
    for frame in &rendered {
        frame.save()?;
    }
    Ok(rendered.len())
}
