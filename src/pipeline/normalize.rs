//! Image normalization: arbitrary raster bytes → print-ready page image.
//!
//! ## Order of operations
//!
//! 1. **Decode**: format sniffed from content, not from the file extension.
//! 2. **Orientation**: the EXIF orientation tag is applied to the pixels, so
//!    nothing downstream needs metadata. Phone photos are routinely stored
//!    sideways with a tag saying "rotate me"; a PDF page has no such tag.
//! 3. **Size cap**: images whose longest edge exceeds `max_dimension` are
//!    pre-downscaled with area averaging. A 50-megapixel scan costs ~150 MB
//!    of RGB pixels; capping first bounds the cost of every later step.
//! 4. **Colour**: alpha is composited over opaque white (PDF images have no
//!    implicit background), then converted to RGB, grayscale, or 1-bit.
//! 5. **Page geometry**: [`PagePolicy`]: content-preserving fit (default),
//!    cover-and-crop (opt-in), or untouched pixel size.
//!
//! Monochrome dithering runs last, after resampling, so the error-diffusion
//! pattern is computed at the final pixel grid instead of being blurred by a
//! later resize.
//!
//! All resampling uses Lanczos3 or area averaging, never nearest-neighbor.

use crate::error::PdfToolsError;
use image::imageops::{self, BiLevel, FilterType};
use image::{DynamicImage, GrayImage, ImageDecoder, ImageReader, RgbImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use tracing::debug;

/// A4 at 300 DPI, the reference canvas for cover-and-crop.
pub const A4_300_DPI: (u32, u32) = (2480, 3508);

/// A4 dimensions in inches.
const A4_INCHES: (f32, f32) = (8.27, 11.69);

/// Default cap on the longest image edge before any other processing.
pub const DEFAULT_MAX_DIMENSION: u32 = 6000;

/// Colour model of a normalized page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    #[default]
    Rgb,
    Grayscale,
    /// Floyd–Steinberg dithered 1-bit.
    Monochrome,
}

/// Page-geometry policy applied after colour conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PagePolicy {
    /// Keep the decoded pixel size.
    Original,
    /// Scale down (never up), preserving aspect ratio, so the image fits
    /// inside the canvas. The canvas is turned to landscape for landscape
    /// images. No content is lost.
    FitWithin { width: u32, height: u32 },
    /// Scale to cover the canvas, preserving aspect ratio, and center-crop
    /// the overflow. Border-free, but edge content is lost.
    FillAndCrop { width: u32, height: u32 },
}

impl PagePolicy {
    /// Content-preserving fit within an A4 canvas at `dpi`.
    pub fn fit_a4(dpi: f32) -> Self {
        let (w, h) = a4_canvas(dpi);
        PagePolicy::FitWithin {
            width: w,
            height: h,
        }
    }

    /// Cover-and-crop onto the A4 @ 300 DPI reference canvas.
    pub fn fill_a4() -> Self {
        PagePolicy::FillAndCrop {
            width: A4_300_DPI.0,
            height: A4_300_DPI.1,
        }
    }
}

impl PagePolicy {
    /// Reject a canvas with no area.
    pub fn validate(&self) -> Result<(), PdfToolsError> {
        match *self {
            PagePolicy::Original => Ok(()),
            PagePolicy::FitWithin { width, height } | PagePolicy::FillAndCrop { width, height } => {
                if width == 0 || height == 0 {
                    return Err(PdfToolsError::InvalidConfig(format!(
                        "page canvas must have positive width and height, got {width}x{height}"
                    )));
                }
                Ok(())
            }
        }
    }
}

impl Default for PagePolicy {
    fn default() -> Self {
        PagePolicy::fit_a4(crate::pipeline::assemble::DEFAULT_RESOLUTION)
    }
}

/// Pixel size of an A4 page at `dpi`.
pub fn a4_canvas(dpi: f32) -> (u32, u32) {
    let dpi = dpi.max(1.0);
    (
        (A4_INCHES.0 * dpi).round() as u32,
        (A4_INCHES.1 * dpi).round() as u32,
    )
}

/// Everything [`normalize`] needs to know.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizePolicy {
    pub color: ColorMode,
    pub page: PagePolicy,
    pub max_dimension: u32,
}

impl Default for NormalizePolicy {
    fn default() -> Self {
        Self {
            color: ColorMode::default(),
            page: PagePolicy::default(),
            max_dimension: DEFAULT_MAX_DIMENSION,
        }
    }
}

/// Pixels of a normalized page, in their final colour model.
#[derive(Debug, Clone)]
pub enum Raster {
    Rgb(RgbImage),
    Gray(GrayImage),
    /// 1-bit content stored one byte per pixel: 0 (black) or 255 (white).
    Mono(GrayImage),
}

/// A decoded, upright, colour-normalized page image.
#[derive(Debug, Clone)]
pub struct PageImage {
    raster: Raster,
}

impl PageImage {
    pub fn new(raster: Raster) -> Self {
        Self { raster }
    }

    pub fn width(&self) -> u32 {
        match &self.raster {
            Raster::Rgb(img) => img.width(),
            Raster::Gray(img) | Raster::Mono(img) => img.width(),
        }
    }

    pub fn height(&self) -> u32 {
        match &self.raster {
            Raster::Rgb(img) => img.height(),
            Raster::Gray(img) | Raster::Mono(img) => img.height(),
        }
    }

    pub fn mode(&self) -> ColorMode {
        match &self.raster {
            Raster::Rgb(_) => ColorMode::Rgb,
            Raster::Gray(_) => ColorMode::Grayscale,
            Raster::Mono(_) => ColorMode::Monochrome,
        }
    }

    pub fn raster(&self) -> &Raster {
        &self.raster
    }
}

/// Normalize raw image bytes into a page image.
///
/// # Errors
/// [`PdfToolsError::UnsupportedImage`] when the bytes are not a decodable
/// raster image. The `index` field is 0; callers processing a batch replace
/// it with the input position.
pub fn normalize(raw: &[u8], policy: &NormalizePolicy) -> Result<PageImage, PdfToolsError> {
    let img = decode_upright(raw)?;
    let (src_w, src_h) = (img.width(), img.height());

    // ── Size cap ─────────────────────────────────────────────────────────
    let img = cap_dimension(img, policy.max_dimension);

    // ── Colour ───────────────────────────────────────────────────────────
    let flat = flatten_alpha(&img);
    drop(img);

    let page = match policy.color {
        ColorMode::Rgb => {
            let rgb = apply_geometry(DynamicImage::ImageRgb8(flat), policy.page);
            Raster::Rgb(rgb.to_rgb8())
        }
        ColorMode::Grayscale | ColorMode::Monochrome => {
            let gray = DynamicImage::ImageRgb8(flat).to_luma8();
            let mut gray = apply_geometry(DynamicImage::ImageLuma8(gray), policy.page).to_luma8();
            if policy.color == ColorMode::Monochrome {
                imageops::dither(&mut gray, &BiLevel);
                Raster::Mono(gray)
            } else {
                Raster::Gray(gray)
            }
        }
    };

    let page = PageImage::new(page);
    debug!(
        "Normalized {}x{} → {}x{} ({:?})",
        src_w,
        src_h,
        page.width(),
        page.height(),
        page.mode()
    );
    Ok(page)
}

/// Decode and bake in the EXIF orientation.
fn decode_upright(raw: &[u8]) -> Result<DynamicImage, PdfToolsError> {
    let unsupported = |detail: String| PdfToolsError::UnsupportedImage { index: 0, detail };

    let reader = ImageReader::new(Cursor::new(raw))
        .with_guessed_format()
        .map_err(|e| unsupported(e.to_string()))?;
    if reader.format().is_none() {
        return Err(unsupported("unrecognised image format".into()));
    }

    let mut decoder = reader.into_decoder().map_err(|e| unsupported(e.to_string()))?;
    // Missing or unreadable orientation metadata means "already upright".
    let orientation = decoder
        .orientation()
        .unwrap_or(image::metadata::Orientation::NoTransforms);
    let mut img = DynamicImage::from_decoder(decoder).map_err(|e| unsupported(e.to_string()))?;
    img.apply_orientation(orientation);

    if img.width() == 0 || img.height() == 0 {
        return Err(unsupported("image has zero area".into()));
    }
    Ok(img)
}

/// Area-averaging pre-downscale when the longest edge exceeds `max`.
fn cap_dimension(img: DynamicImage, max: u32) -> DynamicImage {
    let longest = img.width().max(img.height());
    if max == 0 || longest <= max {
        return img;
    }
    debug!("Pre-downscaling {}x{} to fit {}px", img.width(), img.height(), max);
    img.thumbnail(max, max)
}

/// Composite any alpha channel over opaque white and return RGB pixels.
pub(crate) fn flatten_alpha(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }
    let rgba = img.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (src, dst) in rgba.pixels().zip(out.pixels_mut()) {
        let [r, g, b, a] = src.0;
        let a = a as u32;
        let over_white = |c: u8| ((c as u32 * a + 255 * (255 - a) + 127) / 255) as u8;
        dst.0 = [over_white(r), over_white(g), over_white(b)];
    }
    out
}

/// Apply the page-geometry policy.
fn apply_geometry(img: DynamicImage, policy: PagePolicy) -> DynamicImage {
    match policy {
        PagePolicy::Original => img,
        PagePolicy::FitWithin { width, height } => {
            let (cw, ch) = if img.width() > img.height() {
                (width.max(height), width.min(height))
            } else {
                (width.min(height), width.max(height))
            };
            if img.width() <= cw && img.height() <= ch {
                img
            } else {
                img.resize(cw, ch, FilterType::Lanczos3)
            }
        }
        PagePolicy::FillAndCrop { width, height } => {
            img.resize_to_fill(width, height, FilterType::Lanczos3)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, Rgba, RgbaImage};

    /// Encode an RGB image as PNG bytes.
    pub(crate) fn png_bytes(img: &RgbImage) -> Vec<u8> {
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(img.clone())
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .expect("png encode");
        buf
    }

    /// Encode an RGB image as JPEG carrying an EXIF orientation tag.
    pub(crate) fn jpeg_with_orientation(img: &RgbImage, orientation: u16) -> Vec<u8> {
        let mut jpeg = Vec::new();
        DynamicImage::ImageRgb8(img.clone())
            .write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)
            .expect("jpeg encode");

        // Minimal big-endian TIFF with a single IFD0 entry: Orientation (0x0112).
        let mut exif = b"Exif\0\0".to_vec();
        exif.extend_from_slice(b"MM\0\x2a\0\0\0\x08");
        exif.extend_from_slice(&1u16.to_be_bytes());
        exif.extend_from_slice(&0x0112u16.to_be_bytes());
        exif.extend_from_slice(&3u16.to_be_bytes());
        exif.extend_from_slice(&1u32.to_be_bytes());
        exif.extend_from_slice(&orientation.to_be_bytes());
        exif.extend_from_slice(&[0, 0]);
        exif.extend_from_slice(&0u32.to_be_bytes());

        let mut out = jpeg[..2].to_vec(); // SOI
        out.extend_from_slice(&[0xFF, 0xE1]);
        out.extend_from_slice(&((exif.len() + 2) as u16).to_be_bytes());
        out.extend_from_slice(&exif);
        out.extend_from_slice(&jpeg[2..]);
        out
    }

    /// A portrait image whose top half is red and bottom half blue.
    pub(crate) fn upright_portrait(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |_, y| {
            if y < h / 2 {
                Rgb([220, 20, 20])
            } else {
                Rgb([20, 20, 220])
            }
        })
    }

    /// Store `upright` so that applying EXIF `orientation` restores it.
    pub(crate) fn stored_for_orientation(upright: &RgbImage, orientation: u16) -> RgbImage {
        match orientation {
            3 => imageops::rotate180(upright),
            6 => imageops::rotate270(upright),
            8 => imageops::rotate90(upright),
            _ => upright.clone(),
        }
    }

    fn original_rgb() -> NormalizePolicy {
        NormalizePolicy {
            color: ColorMode::Rgb,
            page: PagePolicy::Original,
            max_dimension: DEFAULT_MAX_DIMENSION,
        }
    }

    fn assert_upright(page: &PageImage) {
        let Raster::Rgb(img) = page.raster() else {
            panic!("expected rgb raster");
        };
        assert!(img.height() > img.width(), "page should be portrait");
        let top = img.get_pixel(img.width() / 2, img.height() / 8);
        let bottom = img.get_pixel(img.width() / 2, img.height() * 7 / 8);
        assert!(top.0[0] > 150 && top.0[2] < 100, "top should be red: {top:?}");
        assert!(bottom.0[2] > 150 && bottom.0[0] < 100, "bottom should be blue: {bottom:?}");
    }

    #[test]
    fn rejects_non_image_bytes() {
        let err = normalize(b"not an image at all", &NormalizePolicy::default()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UnsupportedImage);
    }

    #[test]
    fn exif_orientations_are_baked_in() {
        let upright = upright_portrait(40, 64);
        for orientation in [1u16, 3, 6, 8] {
            let stored = stored_for_orientation(&upright, orientation);
            let bytes = jpeg_with_orientation(&stored, orientation);
            let page = normalize(&bytes, &original_rgb()).expect("normalize");
            assert_eq!((page.width(), page.height()), (40, 64), "orientation {orientation}");
            assert_upright(&page);
        }
    }

    #[test]
    fn alpha_is_composited_over_white() {
        let img = RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 0]));
        let mut buf = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        let page = normalize(&buf, &original_rgb()).unwrap();
        let Raster::Rgb(rgb) = page.raster() else {
            panic!("expected rgb");
        };
        assert_eq!(rgb.get_pixel(0, 0).0, [255, 255, 255]);
    }

    #[test]
    fn half_transparent_black_becomes_mid_gray() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(2, 2, Rgba([0, 0, 0, 128])));
        let flat = flatten_alpha(&img);
        let v = flat.get_pixel(0, 0).0[0];
        assert!((120..=135).contains(&v), "got {v}");
    }

    #[test]
    fn grayscale_and_monochrome_modes() {
        let bytes = png_bytes(&upright_portrait(30, 50));

        let gray = normalize(
            &bytes,
            &NormalizePolicy {
                color: ColorMode::Grayscale,
                ..original_rgb()
            },
        )
        .unwrap();
        assert_eq!(gray.mode(), ColorMode::Grayscale);

        let mono = normalize(
            &bytes,
            &NormalizePolicy {
                color: ColorMode::Monochrome,
                ..original_rgb()
            },
        )
        .unwrap();
        assert_eq!(mono.mode(), ColorMode::Monochrome);
        let Raster::Mono(bits) = mono.raster() else {
            panic!("expected mono");
        };
        assert!(bits.pixels().all(|p| p.0[0] == 0 || p.0[0] == 255));
    }

    #[test]
    fn fit_within_preserves_aspect_without_cropping() {
        let bytes = png_bytes(&upright_portrait(400, 1000));
        let policy = NormalizePolicy {
            page: PagePolicy::FitWithin {
                width: 100,
                height: 200,
            },
            ..original_rgb()
        };
        let page = normalize(&bytes, &policy).unwrap();
        assert_eq!((page.width(), page.height()), (80, 200));
    }

    #[test]
    fn fit_within_never_upscales() {
        let bytes = png_bytes(&upright_portrait(20, 30));
        let policy = NormalizePolicy {
            page: PagePolicy::fit_a4(100.0),
            ..original_rgb()
        };
        let page = normalize(&bytes, &policy).unwrap();
        assert_eq!((page.width(), page.height()), (20, 30));
    }

    #[test]
    fn fit_within_turns_canvas_for_landscape_images() {
        let bytes = png_bytes(&RgbImage::from_pixel(1000, 400, Rgb([1, 2, 3])));
        let policy = NormalizePolicy {
            page: PagePolicy::FitWithin {
                width: 100,
                height: 200,
            },
            ..original_rgb()
        };
        let page = normalize(&bytes, &policy).unwrap();
        assert_eq!((page.width(), page.height()), (200, 80));
    }

    #[test]
    fn fill_and_crop_covers_exact_canvas() {
        let bytes = png_bytes(&upright_portrait(300, 300));
        let policy = NormalizePolicy {
            page: PagePolicy::FillAndCrop {
                width: 100,
                height: 150,
            },
            ..original_rgb()
        };
        let page = normalize(&bytes, &policy).unwrap();
        assert_eq!((page.width(), page.height()), (100, 150));
    }

    #[test]
    fn fill_and_crop_keeps_the_centre() {
        // Red and blue side bands, green middle. At half scale the bands end
        // 5 px inside the 25 px trimmed from each side.
        let src = RgbImage::from_fn(300, 300, |x, _| match x {
            0..=39 => Rgb([255, 0, 0]),
            260..=299 => Rgb([0, 0, 255]),
            _ => Rgb([0, 255, 0]),
        });
        let policy = NormalizePolicy {
            page: PagePolicy::FillAndCrop {
                width: 100,
                height: 150,
            },
            ..original_rgb()
        };
        let page = normalize(&png_bytes(&src), &policy).unwrap();
        let Raster::Rgb(img) = page.raster() else {
            panic!("expected an RGB page");
        };
        for x in [0, 50, 99] {
            let [r, g, b] = img.get_pixel(x, 75).0;
            assert!(g > 200 && r < 50 && b < 50, "x={x}: {:?}", (r, g, b));
        }
    }

    #[test]
    fn oversized_images_are_capped_first() {
        let bytes = png_bytes(&upright_portrait(200, 400));
        let policy = NormalizePolicy {
            max_dimension: 100,
            ..original_rgb()
        };
        let page = normalize(&bytes, &policy).unwrap();
        assert_eq!((page.width(), page.height()), (50, 100));
    }

    #[test]
    fn default_policy_is_content_preserving() {
        assert!(matches!(
            NormalizePolicy::default().page,
            PagePolicy::FitWithin { .. }
        ));
    }

    #[test]
    fn a4_canvas_matches_reference() {
        assert_eq!(a4_canvas(300.0), (2481, 3507));
        assert_eq!(PagePolicy::fill_a4(), PagePolicy::FillAndCrop { width: 2480, height: 3508 });
    }
}
