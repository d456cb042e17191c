//! PDF assembly: one page per normalized image, in input order.
//!
//! Each page is a single image XObject painted over the full media box.
//! Page size in points is the image's pixel size at the configured
//! resolution (`px / dpi × 72`), so a page that was pre-fit to a fixed canvas
//! comes out at exactly that paper size.
//!
//! ## Why JPEG for continuous-tone pages?
//!
//! A `DCTDecode` stream is the JPEG file itself: PDF viewers decode it
//! natively, and there is no second compression pass. 1-bit pages are
//! packed eight pixels per byte and Flate-compressed instead, which is
//! lossless and far smaller than JPEG for bilevel content.

use crate::error::PdfToolsError;
use crate::pipeline::normalize::{PageImage, Raster};
use image::codecs::jpeg::JpegEncoder;
use image::GrayImage;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use tracing::debug;

/// Default page resolution, matching the original service's output.
pub const DEFAULT_RESOLUTION: f32 = 100.0;

/// Default JPEG quality for continuous-tone pages.
pub const DEFAULT_JPEG_QUALITY: u8 = 92;

/// Options for [`assemble`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssembleOptions {
    /// Pixels per inch used to derive page size.
    pub resolution: f32,
    /// JPEG quality (1–100) for RGB and grayscale pages.
    pub jpeg_quality: u8,
}

impl Default for AssembleOptions {
    fn default() -> Self {
        Self {
            resolution: DEFAULT_RESOLUTION,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// Build one document from pages, preserving order.
///
/// # Errors
/// [`PdfToolsError::EmptyInput`] on zero pages.
pub fn assemble(
    pages: Vec<PageImage>,
    options: &AssembleOptions,
) -> Result<Document, PdfToolsError> {
    if pages.is_empty() {
        return Err(PdfToolsError::EmptyInput);
    }
    let resolution = options.resolution.max(1.0);

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids: Vec<Object> = Vec::with_capacity(pages.len());

    // Consume pages one at a time so each raster is freed once embedded.
    for (idx, page) in pages.into_iter().enumerate() {
        let width_pt = page.width() as f32 / resolution * 72.0;
        let height_pt = page.height() as f32 / resolution * 72.0;

        let image_id = doc.add_object(image_xobject(page.raster(), options.jpeg_quality)?);

        let content = Content {
            operations: vec![
                Operation::new("q", vec![]),
                Operation::new(
                    "cm",
                    vec![
                        width_pt.into(),
                        0.into(),
                        0.into(),
                        height_pt.into(),
                        0.into(),
                        0.into(),
                    ],
                ),
                Operation::new("Do", vec![Object::Name(b"Im0".to_vec())]),
                Operation::new("Q", vec![]),
            ],
        };
        let encoded = content
            .encode()
            .map_err(|e| PdfToolsError::Internal(format!("Content stream encoding failed: {e}")))?;
        let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));

        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), width_pt.into(), height_pt.into()],
            "Contents" => content_id,
            "Resources" => dictionary! {
                "XObject" => dictionary! { "Im0" => image_id },
            },
        });
        debug!(
            "Page {} → {:.1}x{:.1} pt ({:?})",
            idx + 1,
            width_pt,
            height_pt,
            page.mode()
        );
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let info_id = doc.add_object(dictionary! {
        "Producer" => Object::string_literal(concat!("pdftools ", env!("CARGO_PKG_VERSION"))),
    });
    doc.trailer.set("Info", info_id);

    Ok(doc)
}

/// Encode a raster as an image XObject stream.
///
/// Shared with the in-process resampling compressor so both produce the
/// same stream layout.
pub(crate) fn image_xobject(raster: &Raster, jpeg_quality: u8) -> Result<Stream, PdfToolsError> {
    let quality = jpeg_quality.clamp(1, 100);
    match raster {
        Raster::Rgb(img) => {
            let jpeg = encode_jpeg(img, quality)?;
            Ok(dct_stream(img.width(), img.height(), "DeviceRGB", jpeg))
        }
        Raster::Gray(img) => {
            let jpeg = encode_jpeg(img, quality)?;
            Ok(dct_stream(img.width(), img.height(), "DeviceGray", jpeg))
        }
        Raster::Mono(img) => {
            let mut stream = Stream::new(
                dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Image",
                    "Width" => img.width() as i64,
                    "Height" => img.height() as i64,
                    "ColorSpace" => "DeviceGray",
                    "BitsPerComponent" => 1,
                },
                pack_bilevel(img),
            );
            stream
                .compress()
                .map_err(|e| PdfToolsError::Internal(format!("Flate encoding failed: {e}")))?;
            Ok(stream)
        }
    }
}

fn dct_stream(width: u32, height: u32, color_space: &str, jpeg: Vec<u8>) -> Stream {
    let mut stream = Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => width as i64,
            "Height" => height as i64,
            "ColorSpace" => color_space,
            "BitsPerComponent" => 8,
            "Filter" => "DCTDecode",
        },
        jpeg,
    );
    // Already JPEG; a later Document::compress must not wrap it in Flate.
    stream.allows_compression = false;
    stream
}

fn encode_jpeg<I>(img: &I, quality: u8) -> Result<Vec<u8>, PdfToolsError>
where
    I: image::GenericImageView,
    I::Pixel: image::PixelWithColorType,
{
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode_image(img)
        .map_err(|e| PdfToolsError::Internal(format!("JPEG encoding failed: {e}")))?;
    Ok(buf)
}

/// Pack a 0/255 gray image into 1-bit rows (1 = white), each row padded to a byte.
pub(crate) fn pack_bilevel(img: &GrayImage) -> Vec<u8> {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let row_bytes = w.div_ceil(8);
    let mut packed = vec![0u8; row_bytes * h];
    for (x, y, px) in img.enumerate_pixels() {
        if px.0[0] >= 128 {
            let (x, y) = (x as usize, y as usize);
            packed[y * row_bytes + x / 8] |= 0x80 >> (x % 8);
        }
    }
    packed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{media_box_size, save_document};
    use image::{Luma, Rgb, RgbImage};

    fn rgb_page(w: u32, h: u32) -> PageImage {
        PageImage::new(Raster::Rgb(RgbImage::from_pixel(w, h, Rgb([10, 200, 30]))))
    }

    #[test]
    fn empty_input_is_rejected() {
        let err = assemble(vec![], &AssembleOptions::default()).unwrap_err();
        assert!(matches!(err, PdfToolsError::EmptyInput));
    }

    #[test]
    fn page_count_and_order_follow_input() {
        let pages = vec![rgb_page(100, 200), rgb_page(300, 100), rgb_page(50, 50)];
        let mut doc = assemble(pages, &AssembleOptions::default()).unwrap();
        let bytes = save_document(&mut doc).unwrap();

        let reloaded = Document::load_mem(&bytes).unwrap();
        let page_ids: Vec<_> = reloaded.get_pages().into_values().collect();
        assert_eq!(page_ids.len(), 3);

        let sizes: Vec<(f32, f32)> = page_ids
            .iter()
            .map(|id| media_box_size(&reloaded, *id).unwrap())
            .collect();
        // 100 DPI: 100 px → 72 pt.
        assert!((sizes[0].0 - 72.0).abs() < 0.01 && (sizes[0].1 - 144.0).abs() < 0.01);
        assert!((sizes[1].0 - 216.0).abs() < 0.01 && (sizes[1].1 - 72.0).abs() < 0.01);
        assert!((sizes[2].0 - 36.0).abs() < 0.01);
    }

    #[test]
    fn resolution_scales_page_size() {
        let options = AssembleOptions {
            resolution: 300.0,
            ..AssembleOptions::default()
        };
        let doc = assemble(vec![rgb_page(300, 600)], &options).unwrap();
        let page_id = *doc.get_pages().values().next().unwrap();
        let (w, h) = media_box_size(&doc, page_id).unwrap();
        assert!((w - 72.0).abs() < 0.01 && (h - 144.0).abs() < 0.01);
    }

    #[test]
    fn gray_pages_use_device_gray_jpeg() {
        let gray = GrayImage::from_pixel(8, 8, Luma([90]));
        let stream = image_xobject(&Raster::Gray(gray), 80).unwrap();
        assert!(matches!(
            stream.dict.get(b"ColorSpace"),
            Ok(Object::Name(n)) if n == b"DeviceGray"
        ));
        assert!(matches!(stream.dict.get(b"Filter"), Ok(Object::Name(n)) if n == b"DCTDecode"));
        assert!(!stream.allows_compression);
    }

    #[test]
    fn mono_pages_are_one_bit_flate() {
        // Large enough for Flate to pay off; tiny streams are left raw.
        let mono = GrayImage::from_fn(200, 200, |x, _| {
            if x % 2 == 0 {
                Luma([255])
            } else {
                Luma([0])
            }
        });
        let stream = image_xobject(&Raster::Mono(mono), 80).unwrap();
        assert!(matches!(stream.dict.get(b"BitsPerComponent"), Ok(Object::Integer(1))));
        assert!(matches!(stream.dict.get(b"Filter"), Ok(Object::Name(n)) if n == b"FlateDecode"));
    }

    #[test]
    fn pack_bilevel_pads_rows() {
        let img = GrayImage::from_fn(10, 2, |x, _| {
            if x == 0 || x == 9 {
                Luma([255])
            } else {
                Luma([0])
            }
        });
        let packed = pack_bilevel(&img);
        assert_eq!(packed.len(), 4);
        assert_eq!(packed[0], 0b1000_0000);
        assert_eq!(packed[1], 0b0100_0000);
        assert_eq!(packed[2], 0b1000_0000);
    }
}
