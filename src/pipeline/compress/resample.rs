//! In-process image resampling.
//!
//! Walks every page's image XObjects and rewrites the JPEG ones: decode,
//! downsample so the image carries no more than the profile's resolution
//! across the page it sits on, apply the profile's colour mode, re-encode at
//! the profile's quality. A rewritten image replaces the original only when
//! its stream is smaller. The [`restructure`] pass runs afterwards.
//!
//! Only baseline `DCTDecode` images in `DeviceRGB` or `DeviceGray` are
//! touched. Anything else (CMYK, ICC-based spaces, masks, exotic filters) is
//! copied through unchanged; this backend never makes a document worse.

use super::restructure::restructure;
use super::{BackendKind, CompressionBackend, CompressionProfile, ProfileColorMode};
use crate::error::PdfToolsError;
use crate::pipeline::assemble::image_xobject;
use crate::pipeline::normalize::Raster;
use crate::pipeline::{inherited_attribute, load_document, media_box_size, resolve, save_document};
use async_trait::async_trait;
use image::imageops::{self, BiLevel, FilterType};
use image::{DynamicImage, ImageFormat};
use lopdf::{Document, Object, ObjectId, Stream};
use std::collections::HashMap;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Keys the encoder sets itself; everything else is carried over.
const REPLACED_KEYS: &[&[u8]] = &[
    b"Width",
    b"Height",
    b"ColorSpace",
    b"BitsPerComponent",
    b"Filter",
    b"DecodeParms",
    b"Decode",
    b"Length",
];

/// Downsample and re-encode embedded JPEG images, then restructure.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResampleBackend;

#[async_trait]
impl CompressionBackend for ResampleBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Resample
    }

    async fn compress(
        &self,
        input: &Path,
        output: &Path,
        profile: &CompressionProfile,
        cancel: &CancellationToken,
    ) -> Result<(), PdfToolsError> {
        let bytes = tokio::fs::read(input)
            .await
            .map_err(|e| PdfToolsError::io(input, e))?;
        let profile = *profile;
        let cancel = cancel.clone();

        let compressed = tokio::task::spawn_blocking(move || {
            let mut document = load_document(&bytes, 0)?;
            let rewritten = resample_images(&mut document, &profile, &cancel)?;
            debug!("Resampled {} image(s)", rewritten);
            restructure(&mut document);
            save_document(&mut document)
        })
        .await
        .map_err(|e| PdfToolsError::Internal(format!("Resample task panicked: {e}")))??;

        tokio::fs::write(output, compressed)
            .await
            .map_err(|e| PdfToolsError::io(output, e))
    }
}

/// Rewrite eligible images in place; returns how many were replaced.
pub(crate) fn resample_images(
    document: &mut Document,
    profile: &CompressionProfile,
    cancel: &CancellationToken,
) -> Result<usize, PdfToolsError> {
    let targets = image_targets(document, profile.target_dpi);
    let mut rewritten = 0;

    for (image_id, (max_w, max_h)) in targets {
        if cancel.is_cancelled() {
            return Err(PdfToolsError::Cancelled {
                job: "compression".into(),
            });
        }
        let replacement = match document.get_object(image_id) {
            Ok(Object::Stream(stream)) => rewrite_image(stream, max_w, max_h, profile),
            _ => None,
        };
        if let Some(stream) = replacement {
            document.objects.insert(image_id, Object::Stream(stream));
            rewritten += 1;
        }
    }
    Ok(rewritten)
}

/// Every image XObject referenced from a page, with the largest pixel box
/// it may keep: the page's size in inches times `dpi`.
///
/// An image shared by several pages gets the most generous bound.
fn image_targets(document: &Document, dpi: u32) -> HashMap<ObjectId, (u32, u32)> {
    let mut targets: HashMap<ObjectId, (u32, u32)> = HashMap::new();

    for page_id in document.get_pages().into_values() {
        let Some((w_pt, h_pt)) = media_box_size(document, page_id) else {
            continue;
        };
        let bound = (
            ((w_pt / 72.0) * dpi as f32).ceil().max(1.0) as u32,
            ((h_pt / 72.0) * dpi as f32).ceil().max(1.0) as u32,
        );

        let Some(resources) = inherited_attribute(document, page_id, b"Resources") else {
            continue;
        };
        let Some(Object::Dictionary(resources)) = resolve(document, &resources) else {
            continue;
        };
        let Some(Object::Dictionary(xobjects)) = resources
            .get(b"XObject")
            .ok()
            .and_then(|x| resolve(document, x))
        else {
            continue;
        };

        for (_, value) in xobjects.iter() {
            if let Object::Reference(id) = value {
                let entry = targets.entry(*id).or_insert(bound);
                entry.0 = entry.0.max(bound.0);
                entry.1 = entry.1.max(bound.1);
            }
        }
    }
    targets
}

/// Re-encoded replacement for one image stream, or `None` to keep it.
fn rewrite_image(
    stream: &Stream,
    max_w: u32,
    max_h: u32,
    profile: &CompressionProfile,
) -> Option<Stream> {
    let dict = &stream.dict;
    if !name_is(dict.get(b"Subtype").ok(), b"Image") || !is_dct(dict.get(b"Filter").ok()) {
        return None;
    }
    if !matches!(dict.get(b"BitsPerComponent"), Ok(Object::Integer(8))) {
        return None;
    }
    if matches!(dict.get(b"ImageMask"), Ok(Object::Boolean(true))) {
        return None;
    }
    let source_is_gray = if name_is(dict.get(b"ColorSpace").ok(), b"DeviceGray") {
        true
    } else if name_is(dict.get(b"ColorSpace").ok(), b"DeviceRGB") {
        false
    } else {
        return None;
    };

    let img = match image::load_from_memory_with_format(&stream.content, ImageFormat::Jpeg) {
        Ok(img) => img,
        Err(e) => {
            warn!("Skipping undecodable JPEG image: {}", e);
            return None;
        }
    };

    let img = if img.width() > max_w || img.height() > max_h {
        img.resize(max_w, max_h, FilterType::Lanczos3)
    } else {
        img
    };

    let raster = to_raster(img, source_is_gray, profile.color_mode);
    let mut replacement = match image_xobject(&raster, profile.image_quality) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Skipping image that failed to re-encode: {}", e);
            return None;
        }
    };
    if replacement.content.len() >= stream.content.len() {
        return None;
    }

    for (key, value) in dict.iter() {
        if !REPLACED_KEYS.contains(&key.as_slice()) && !replacement.dict.has(key) {
            replacement.dict.set(key.clone(), value.clone());
        }
    }
    Some(replacement)
}

fn to_raster(img: DynamicImage, source_is_gray: bool, mode: ProfileColorMode) -> Raster {
    match mode {
        ProfileColorMode::Unchanged if source_is_gray => Raster::Gray(img.to_luma8()),
        ProfileColorMode::Unchanged => Raster::Rgb(img.to_rgb8()),
        ProfileColorMode::Grayscale => Raster::Gray(img.to_luma8()),
        ProfileColorMode::Monochrome => {
            let mut gray = img.to_luma8();
            imageops::dither(&mut gray, &BiLevel);
            Raster::Mono(gray)
        }
    }
}

fn name_is(object: Option<&Object>, expected: &[u8]) -> bool {
    matches!(object, Some(Object::Name(name)) if name.as_slice() == expected)
}

/// `/DCTDecode`, alone or as the only entry of a filter array.
fn is_dct(filter: Option<&Object>) -> bool {
    match filter {
        Some(Object::Name(name)) => name.as_slice() == b"DCTDecode",
        Some(Object::Array(filters)) => {
            filters.len() == 1 && name_is(filters.first(), b"DCTDecode")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::assemble::{assemble, AssembleOptions};
    use crate::pipeline::normalize::PageImage;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    /// A single-page document with one busy 1200×1200 photo at 300 DPI (4 in).
    fn photo_document() -> Document {
        let img = RgbImage::from_fn(1200, 1200, |x, y| {
            Rgb([(x % 251) as u8, (y % 241) as u8, ((x * y) % 239) as u8])
        });
        let options = AssembleOptions {
            resolution: 300.0,
            jpeg_quality: 95,
        };
        assemble(vec![PageImage::new(Raster::Rgb(img))], &options).unwrap()
    }

    fn only_image(document: &Document) -> &Stream {
        document
            .objects
            .values()
            .find_map(|obj| match obj {
                Object::Stream(s) if name_is(s.dict.get(b"Subtype").ok(), b"Image") => Some(s),
                _ => None,
            })
            .expect("document has an image")
    }

    fn width_of(stream: &Stream) -> i64 {
        match stream.dict.get(b"Width") {
            Ok(Object::Integer(w)) => *w,
            other => panic!("unexpected width: {other:?}"),
        }
    }

    #[test]
    fn images_are_bounded_by_page_size_at_target_dpi() {
        let mut doc = photo_document();
        let profile = CompressionProfile::new(72, 60, ProfileColorMode::Unchanged);
        let n = resample_images(&mut doc, &profile, &CancellationToken::new()).unwrap();
        assert_eq!(n, 1);

        // 4 in × 72 dpi.
        let image = only_image(&doc);
        assert_eq!(width_of(image), 288);
        assert!(name_is(image.dict.get(b"ColorSpace").ok(), b"DeviceRGB"));
    }

    #[test]
    fn grayscale_profile_converts_colour_space() {
        let mut doc = photo_document();
        let profile = CompressionProfile::new(150, 60, ProfileColorMode::Grayscale);
        resample_images(&mut doc, &profile, &CancellationToken::new()).unwrap();
        assert!(name_is(only_image(&doc).dict.get(b"ColorSpace").ok(), b"DeviceGray"));
    }

    #[test]
    fn larger_result_keeps_original() {
        let mut doc = photo_document();
        let before = only_image(&doc).content.len();
        // Already at 300 DPI and quality 95; re-encoding at 100 cannot shrink it.
        let profile = CompressionProfile::new(300, 100, ProfileColorMode::Unchanged);
        let n = resample_images(&mut doc, &profile, &CancellationToken::new()).unwrap();
        assert_eq!(n, 0);
        assert_eq!(only_image(&doc).content.len(), before);
    }

    #[test]
    fn cancellation_stops_the_walk() {
        let mut doc = photo_document();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = resample_images(&mut doc, &CompressionProfile::default(), &cancel).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn backend_writes_smaller_parseable_output() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.pdf");
        let output = dir.path().join("out.pdf");
        let mut doc = photo_document();
        let original = save_document(&mut doc).unwrap();
        std::fs::write(&input, &original).unwrap();

        ResampleBackend
            .compress(
                &input,
                &output,
                &CompressionProfile::new(72, 50, ProfileColorMode::Grayscale),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let compressed = std::fs::read(&output).unwrap();
        assert!(compressed.len() < original.len());
        assert_eq!(crate::pipeline::page_count(&compressed).unwrap(), 1);
    }
}
