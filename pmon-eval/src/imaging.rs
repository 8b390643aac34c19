//! Region image loading and pixel-level helpers
//!
//! Region input arrives either as a synthesized PNG or as a multi-page TIFF
//! depth stack. Loading goes through the transient-I/O retry policy: the
//! producer may still hold the file open, so reads block with exponential
//! backoff, warning once on the first failure.

use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use image::{DynamicImage, GrayImage};
use tiff::decoder::DecodingResult;

use pmon_common::config::RetryConfig;
use pmon_common::{Error, Result};

/// Object crop handed to the classifier.
pub type CropImage = DynamicImage;

/// Decoded region image data in the representation the detector expects.
#[derive(Clone)]
pub struct RegionImage {
    pub path: PathBuf,
    /// Depth stack frames (TIFF input only).
    pub stack: Option<Vec<GrayImage>>,
    /// Synthesized image; produced from the stack when absent.
    pub synth: Option<DynamicImage>,
}

impl RegionImage {
    /// Pixel dimensions of the region.
    ///
    /// A region with neither stack nor synth data is corrupt input.
    pub fn dimensions(&self) -> Result<(u32, u32)> {
        if let Some(synth) = &self.synth {
            return Ok((synth.width(), synth.height()));
        }
        if let Some(first) = self.stack.as_ref().and_then(|s| s.first()) {
            return Ok((first.width(), first.height()));
        }
        tracing::error!(path = %self.path.display(), "Could not get size of image");
        Err(Error::Integrity(format!(
            "could not get size of image {}",
            self.path.display()
        )))
    }

    pub fn is_stack(&self) -> bool {
        self.stack.is_some()
    }

    /// Synthesize the detector-ready image from the stack when the input was
    /// a raw stack. A synth input passes through untouched.
    pub fn ensure_synth(&mut self) {
        if self.synth.is_some() {
            return;
        }
        if let Some(stack) = &self.stack {
            self.synth = Some(DynamicImage::ImageLuma8(synthesize(stack)));
        }
    }

    /// The synthesized image; call after [`RegionImage::ensure_synth`].
    pub fn synth(&self) -> Result<&DynamicImage> {
        self.synth.as_ref().ok_or_else(|| {
            Error::Integrity(format!(
                "region image {} has no synthesized representation",
                self.path.display()
            ))
        })
    }
}

/// Run `op` under the transient-I/O retry policy.
///
/// Logs one warning on the first failure, then keeps retrying silently with
/// exponential backoff. With `max_wait_secs` configured the wait is bounded
/// and escalates to an integrity error.
pub async fn with_retry<T, E, F>(what: &str, retry: &RetryConfig, mut op: F) -> Result<T>
where
    E: std::fmt::Display,
    F: FnMut() -> std::result::Result<T, E>,
{
    let started = Instant::now();
    let mut delay = Duration::from_millis(retry.initial_delay_ms.max(1));
    let max_backoff = Duration::from_millis(retry.max_backoff_ms.max(1));
    let mut warned = false;

    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !warned {
                    tracing::warn!(file = %what, error = %e, "No permission to load file, retrying");
                    warned = true;
                }
                if let Some(max_wait) = retry.max_wait_secs {
                    if started.elapsed() >= Duration::from_secs(max_wait) {
                        tracing::error!(file = %what, "Gave up waiting for file");
                        return Err(Error::Integrity(format!(
                            "file not readable within {max_wait}s: {what}"
                        )));
                    }
                }
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(max_backoff);
            }
        }
    }
}

/// Load a region image, blocking through transient failures.
///
/// `.tif` loads as a depth stack, `.png` as a synthesized image; anything
/// else is rejected.
pub async fn load_region_image(path: &Path, retry: &RetryConfig) -> Result<RegionImage> {
    let name = path.to_string_lossy().into_owned();

    if name.ends_with(".tif") {
        let stack = with_retry(&name, retry, || load_stack(path)).await?;
        Ok(RegionImage {
            path: path.to_path_buf(),
            stack: Some(stack),
            synth: None,
        })
    } else if name.ends_with(".png") {
        let synth = with_retry(&name, retry, || image::open(path)).await?;
        Ok(RegionImage {
            path: path.to_path_buf(),
            stack: None,
            synth: Some(synth),
        })
    } else {
        Err(Error::InvalidInput(format!(
            "only .tif or .png region images are allowed ({name})"
        )))
    }
}

/// Decode every page of a TIFF depth stack as 8-bit grayscale.
fn load_stack(path: &Path) -> std::result::Result<Vec<GrayImage>, String> {
    let file = std::fs::File::open(path).map_err(|e| e.to_string())?;
    let mut decoder =
        tiff::decoder::Decoder::new(BufReader::new(file)).map_err(|e| e.to_string())?;

    let mut frames = Vec::new();
    loop {
        let (width, height) = decoder.dimensions().map_err(|e| e.to_string())?;
        let frame = match decoder.read_image().map_err(|e| e.to_string())? {
            DecodingResult::U8(data) => GrayImage::from_raw(width, height, data)
                .ok_or_else(|| "stack frame size mismatch".to_string())?,
            DecodingResult::U16(data) => {
                let scaled: Vec<u8> = data.iter().map(|v| (v >> 8) as u8).collect();
                GrayImage::from_raw(width, height, scaled)
                    .ok_or_else(|| "stack frame size mismatch".to_string())?
            }
            _ => return Err("unsupported stack sample format".to_string()),
        };
        frames.push(frame);

        if !decoder.more_images() {
            break;
        }
        decoder.next_image().map_err(|e| e.to_string())?;
    }

    if frames.is_empty() {
        return Err("empty image stack".to_string());
    }
    Ok(frames)
}

/// Flatten a depth stack into one image by darkest projection: particles
/// absorb light, so the in-focus plane holds the darkest value per pixel.
pub fn synthesize(stack: &[GrayImage]) -> GrayImage {
    let (width, height) = (stack[0].width(), stack[0].height());
    let mut out = GrayImage::from_pixel(width, height, image::Luma([255u8]));

    for frame in stack {
        for (x, y, pixel) in frame.enumerate_pixels() {
            let current = out.get_pixel_mut(x, y);
            if pixel[0] < current[0] {
                current[0] = pixel[0];
            }
        }
    }
    out
}

/// Shift `value` by `offset`, rejecting the shift (returning `value`
/// unchanged) when it would cross `bound`.
pub fn offset_value(value: u32, offset: i64, bound: u32) -> u32 {
    let shifted = value as i64 + offset;
    if offset >= 0 {
        if shifted > bound as i64 {
            return value;
        }
    } else if shifted < bound as i64 {
        return value;
    }
    shifted as u32
}

/// Cut an object crop, optionally growing the box by `border` pixels on each
/// side within the image bounds.
pub fn crop_object(
    img: &DynamicImage,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    border: u32,
) -> DynamicImage {
    let bx = offset_value(x, -(border as i64), 0);
    let by = offset_value(y, -(border as i64), 0);
    let bw = offset_value(width, 2 * border as i64, img.width());
    let bh = offset_value(height, 2 * border as i64, img.height());

    let bw = bw.min(img.width().saturating_sub(bx)).max(1);
    let bh = bh.min(img.height().saturating_sub(by)).max(1);

    img.crop_imm(bx, by, bw, bh)
}

/// Draw a one-pixel white box outline (segmentation overlay).
pub fn draw_box_outline(img: &mut GrayImage, x: u32, y: u32, width: u32, height: u32) {
    let (img_w, img_h) = (img.width(), img.height());
    if img_w == 0 || img_h == 0 || width == 0 || height == 0 {
        return;
    }
    let x1 = (x + width - 1).min(img_w - 1);
    let y1 = (y + height - 1).min(img_h - 1);
    let x0 = x.min(img_w - 1);
    let y0 = y.min(img_h - 1);

    for cx in x0..=x1 {
        img.put_pixel(cx, y0, image::Luma([255]));
        img.put_pixel(cx, y1, image::Luma([255]));
    }
    for cy in y0..=y1 {
        img.put_pixel(x0, cy, image::Luma([255]));
        img.put_pixel(x1, cy, image::Luma([255]));
    }
}

/// Write a grayscale stack as a multi-page TIFF.
pub fn write_gray_stack(path: &Path, frames: &[GrayImage]) -> Result<()> {
    let file = std::fs::File::create(path)?;
    let mut encoder = tiff::encoder::TiffEncoder::new(BufWriter::new(file))
        .map_err(|e| Error::Integrity(format!("cannot write stack {}: {e}", path.display())))?;

    for frame in frames {
        encoder
            .write_image::<tiff::encoder::colortype::Gray8>(
                frame.width(),
                frame.height(),
                frame.as_raw(),
            )
            .map_err(|e| {
                Error::Integrity(format!("cannot write stack {}: {e}", path.display()))
            })?;
    }
    Ok(())
}
