//! Decode-time downsampling.
//!
//! No path here materialises an unbounded full-size bitmap:
//!
//! - JPEG asks the decoder for a DCT-scaled output (1/8, 1/4, 1/2 or 1) that still covers the
//!   target, so the IDCT never produces the full resolution.
//! - Non-interlaced PNG is streamed row by row into a box filter sized for the target; peak
//!   memory is one source row plus the output bitmap.
//! - Everything else decodes one full frame under an allocation budget derived from the target
//!   and is rejected when the frame would exceed it.

use std::io::Cursor;

use image::{ImageFormat, ImageReader, Limits, Rgba, RgbaImage, imageops};
use jpeg_decoder::PixelFormat;

use super::error::ImageCacheError;

/// How far past the target edge a full-frame decode may go.
const FULL_FRAME_OVERSAMPLE: u64 = 8;
const MIN_FULL_FRAME_BYTES: u64 = 16 * 1024 * 1024;
const MAX_FULL_FRAME_BYTES: u64 = 256 * 1024 * 1024;

/// Display size an image is requested at, in layout points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetSize {
    pub width: u32,
    pub height: u32,
}

impl TargetSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Longest edge in device pixels; never below one.
    pub fn max_pixel_dimension(&self, display_scale: f64) -> u32 {
        let scale = if display_scale.is_finite() && display_scale > 0.0 {
            display_scale
        } else {
            1.0
        };
        let longest = f64::from(self.width.max(self.height)) * scale;
        let pixels = longest.ceil();
        if pixels >= f64::from(u32::MAX) {
            u32::MAX
        } else {
            (pixels as u32).max(1)
        }
    }
}

/// A decoded RGBA bitmap already reduced to its display size.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pixels: RgbaImage,
}

impl DecodedImage {
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    /// Bytes retained by the bitmap (`bytes_per_row * height`).
    pub fn cost(&self) -> u64 {
        u64::from(self.width()) * 4 * u64::from(self.height())
    }
}

/// Decode `bytes` at a size whose longest edge does not exceed `max_dimension`.
pub(crate) fn decode_downsampled(
    bytes: &[u8],
    max_dimension: u32,
) -> Result<DecodedImage, ImageCacheError> {
    let reduced = match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg) => decode_jpeg_scaled(bytes, max_dimension)?,
        Ok(ImageFormat::Png) => match decode_png_rows(bytes, max_dimension)? {
            Some(pixels) => pixels,
            None => decode_full_frame(bytes, max_dimension, full_frame_budget(max_dimension))?,
        },
        _ => decode_full_frame(bytes, max_dimension, full_frame_budget(max_dimension))?,
    };
    Ok(DecodedImage {
        pixels: fit_within(reduced, max_dimension),
    })
}

/// Output size for a `width`x`height` source whose longest edge must fit `max_dimension`.
fn fit_dimensions(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    let longest = width.max(height);
    let max_dimension = max_dimension.max(1);
    if longest <= max_dimension {
        return (width.max(1), height.max(1));
    }
    let scale = |edge: u32| {
        let scaled = (u64::from(edge) * u64::from(max_dimension) + u64::from(longest) / 2)
            / u64::from(longest);
        scaled.clamp(1, u64::from(max_dimension)) as u32
    };
    (scale(width), scale(height))
}

fn fit_within(pixels: RgbaImage, max_dimension: u32) -> RgbaImage {
    let (width, height) = fit_dimensions(pixels.width(), pixels.height(), max_dimension);
    if (width, height) == pixels.dimensions() {
        return pixels;
    }
    imageops::thumbnail(&pixels, width, height)
}

fn decode_jpeg_scaled(bytes: &[u8], max_dimension: u32) -> Result<RgbaImage, ImageCacheError> {
    let request = u16::try_from(max_dimension).unwrap_or(u16::MAX);
    let mut decoder = jpeg_decoder::Decoder::new(bytes);
    let (width, height) = decoder.scale(request, request)?;
    let data = decoder.decode()?;
    let (width, height) = (u32::from(width), u32::from(height));
    let malformed = |len| ImageCacheError::Malformed { width, height, len };
    let format = decoder
        .info()
        .map(|info| info.pixel_format)
        .ok_or_else(|| malformed(data.len()))?;

    let rgba: Vec<u8> = match format {
        PixelFormat::L8 => data.iter().flat_map(|&l| [l, l, l, u8::MAX]).collect(),
        // Big-endian samples; the high byte is enough for display.
        PixelFormat::L16 => data
            .chunks_exact(2)
            .flat_map(|l| [l[0], l[0], l[0], u8::MAX])
            .collect(),
        PixelFormat::RGB24 => data
            .chunks_exact(3)
            .flat_map(|p| [p[0], p[1], p[2], u8::MAX])
            .collect(),
        PixelFormat::CMYK32 => data.chunks_exact(4).flat_map(cmyk_to_rgba).collect(),
    };
    let len = rgba.len();
    RgbaImage::from_raw(width, height, rgba).ok_or_else(|| malformed(len))
}

fn cmyk_to_rgba(cmyk: &[u8]) -> [u8; 4] {
    let k = u32::from(cmyk[3]);
    let channel = |c: u8| ((255 - u32::from(c)) * (255 - k) / 255) as u8;
    [channel(cmyk[0]), channel(cmyk[1]), channel(cmyk[2]), u8::MAX]
}

/// Stream PNG rows into a target-sized box filter.
///
/// Returns `None` for layouts that cannot be streamed in display order (Adam7 interlacing).
fn decode_png_rows(
    bytes: &[u8],
    max_dimension: u32,
) -> Result<Option<RgbaImage>, ImageCacheError> {
    let mut decoder = png::Decoder::new(Cursor::new(bytes));
    decoder.set_transformations(png::Transformations::normalize_to_color8());
    let mut reader = decoder.read_info()?;
    if reader.info().interlaced {
        return Ok(None);
    }
    let channels = match reader.output_color_type() {
        (png::ColorType::Grayscale, png::BitDepth::Eight) => 1,
        (png::ColorType::GrayscaleAlpha, png::BitDepth::Eight) => 2,
        (png::ColorType::Rgb, png::BitDepth::Eight) => 3,
        (png::ColorType::Rgba, png::BitDepth::Eight) => 4,
        _ => return Ok(None),
    };

    let (src_width, src_height) = (reader.info().width, reader.info().height);
    let (width, height) = fit_dimensions(src_width, src_height, max_dimension);
    let mut filter = BoxFilter::new(src_width, src_height, width, height);
    while let Some(row) = reader.next_row()? {
        filter.push_row(row.data(), channels);
    }
    Ok(Some(filter.finish()))
}

/// Averages source rows into a smaller RGBA bitmap as they arrive.
struct BoxFilter {
    src_height: u32,
    columns: Vec<u32>,
    sums: Vec<u64>,
    counts: Vec<u32>,
    next_row: u32,
    pending: Option<u32>,
    pixels: RgbaImage,
}

impl BoxFilter {
    fn new(src_width: u32, src_height: u32, width: u32, height: u32) -> Self {
        let columns = (0..src_width)
            .map(|x| scale_index(x, src_width, width))
            .collect();
        Self {
            src_height,
            columns,
            sums: vec![0; width as usize * 4],
            counts: vec![0; width as usize],
            next_row: 0,
            pending: None,
            pixels: RgbaImage::new(width, height),
        }
    }

    fn push_row(&mut self, data: &[u8], channels: usize) {
        let row = scale_index(self.next_row, self.src_height, self.pixels.height());
        if self.pending.is_some_and(|pending| pending != row) {
            self.flush();
        }
        self.pending = Some(row);
        self.next_row += 1;

        for (pixel, &column) in data.chunks_exact(channels).zip(&self.columns) {
            let column = column as usize;
            let sums = &mut self.sums[column * 4..column * 4 + 4];
            for (sum, value) in sums.iter_mut().zip(expand_to_rgba(pixel)) {
                *sum += u64::from(value);
            }
            self.counts[column] += 1;
        }
    }

    fn flush(&mut self) {
        let Some(row) = self.pending.take() else {
            return;
        };
        for (x, (sums, count)) in self
            .sums
            .chunks_exact_mut(4)
            .zip(self.counts.iter_mut())
            .enumerate()
        {
            let samples = u64::from((*count).max(1));
            let pixel = [0, 1, 2, 3].map(|c| ((sums[c] + samples / 2) / samples) as u8);
            self.pixels.put_pixel(x as u32, row, Rgba(pixel));
            sums.fill(0);
            *count = 0;
        }
    }

    fn finish(mut self) -> RgbaImage {
        self.flush();
        self.pixels
    }
}

fn scale_index(index: u32, source: u32, output: u32) -> u32 {
    let scaled = u64::from(index) * u64::from(output) / u64::from(source.max(1));
    (scaled as u32).min(output.saturating_sub(1))
}

fn expand_to_rgba(pixel: &[u8]) -> [u8; 4] {
    match *pixel {
        [l] => [l, l, l, u8::MAX],
        [l, a] => [l, l, l, a],
        [r, g, b] => [r, g, b, u8::MAX],
        [r, g, b, a] => [r, g, b, a],
        _ => [0; 4],
    }
}

/// Byte budget for formats that must be decoded as one full frame.
fn full_frame_budget(max_dimension: u32) -> u64 {
    let edge = u64::from(max_dimension).saturating_mul(FULL_FRAME_OVERSAMPLE);
    edge.saturating_mul(edge)
        .saturating_mul(4)
        .clamp(MIN_FULL_FRAME_BYTES, MAX_FULL_FRAME_BYTES)
}

fn decode_full_frame(
    bytes: &[u8],
    max_dimension: u32,
    budget: u64,
) -> Result<RgbaImage, ImageCacheError> {
    let mut reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    let mut limits = Limits::default();
    limits.max_alloc = Some(budget);
    reader.limits(limits);

    let decoded = reader.decode()?;
    let (width, height) = fit_dimensions(decoded.width(), decoded.height(), max_dimension);
    if (width, height) == (decoded.width(), decoded.height()) {
        return Ok(decoded.into_rgba8());
    }
    Ok(decoded.thumbnail(width, height).into_rgba8())
}

#[cfg(test)]
pub(crate) fn encode_png(width: u32, height: u32) -> Vec<u8> {
    encode(width, height, ImageFormat::Png)
}

#[cfg(test)]
fn encode(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    let image = image::RgbImage::from_fn(width, height, |x, _| {
        if x < width / 2 {
            image::Rgb([200, 30, 30])
        } else {
            image::Rgb([30, 30, 200])
        }
    });
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(image)
        .write_to(&mut out, format)
        .expect("encode image");
    out.into_inner()
}
