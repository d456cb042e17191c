//! Pipeline stages for document transformation.
//!
//! Each submodule implements exactly one transformation. They are plain,
//! blocking functions over in-memory values; the job layer
//! ([`crate::job`]) decides when to move them onto the blocking pool and how
//! to connect them to the artifact store.
//!
//! ## Data Flow
//!
//! ```text
//! images ──▶ normalize ──▶ assemble ──▶ PDF
//! PDFs   ──▶ merge ──────────────────▶ PDF
//! PDF    ──▶ compress (backend chain) ▶ PDF
//! ```
//!
//! 1. [`normalize`]: decode, apply EXIF orientation, flatten alpha, convert
//!    colour, apply the page-geometry policy
//! 2. [`assemble`]: one page per normalized image, in order
//! 3. [`merge`]: concatenate pages of several documents, in order
//! 4. [`compress`]: validated profile + pluggable backend strategy

pub mod assemble;
pub mod compress;
pub mod merge;
pub mod normalize;

use crate::error::PdfToolsError;
use lopdf::{Document, Object, ObjectId};

/// Image extensions accepted for conversion (lower-case, no dot).
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp"];

/// Document extensions accepted for merge and compression.
pub const DOCUMENT_EXTENSIONS: &[&str] = &["pdf"];

/// Whether `ext` (with or without leading dot, any case) is an accepted image.
pub fn is_image_extension(ext: &str) -> bool {
    let ext = crate::store::normalize_extension(ext);
    IMAGE_EXTENSIONS.contains(&ext.as_str())
}

/// Whether `ext` (with or without leading dot, any case) is an accepted document.
pub fn is_document_extension(ext: &str) -> bool {
    let ext = crate::store::normalize_extension(ext);
    DOCUMENT_EXTENSIONS.contains(&ext.as_str())
}

/// Parse PDF bytes; `index` identifies the input in error messages.
pub fn load_document(bytes: &[u8], index: usize) -> Result<Document, PdfToolsError> {
    let document = Document::load_mem(bytes).map_err(|e| PdfToolsError::CorruptDocument {
        index,
        detail: e.to_string(),
    })?;
    // A parseable file without a page tree is as useless as a corrupt one.
    if document.get_pages().is_empty() {
        return Err(PdfToolsError::CorruptDocument {
            index,
            detail: "document has no pages".into(),
        });
    }
    Ok(document)
}

/// Serialise a document to bytes.
pub fn save_document(document: &mut Document) -> Result<Vec<u8>, PdfToolsError> {
    let mut buf = Vec::new();
    document
        .save_to(&mut buf)
        .map_err(|e| PdfToolsError::Internal(format!("Failed to serialise PDF: {e}")))?;
    Ok(buf)
}

/// Number of pages in a PDF held in memory.
pub fn page_count(bytes: &[u8]) -> Result<usize, PdfToolsError> {
    Ok(load_document(bytes, 0)?.get_pages().len())
}

/// Page attributes a page may inherit from its ancestors in the page tree.
pub(crate) const INHERITABLE_ATTRIBUTES: &[&[u8]] =
    &[b"MediaBox", b"CropBox", b"Resources", b"Rotate"];

/// Look up `key` on a page, walking up `/Parent` links when absent.
pub(crate) fn inherited_attribute(
    document: &Document,
    page_id: ObjectId,
    key: &[u8],
) -> Option<Object> {
    let mut current = page_id;
    // Bounded walk: a malformed tree with a parent cycle must not hang us.
    for _ in 0..64 {
        let dict = document.get_dictionary(current).ok()?;
        if let Ok(value) = dict.get(key) {
            return Some(value.clone());
        }
        current = dict.get(b"Parent").ok()?.as_reference().ok()?;
    }
    None
}

/// Resolve an object through at most one level of indirection.
pub(crate) fn resolve<'a>(document: &'a Document, object: &'a Object) -> Option<&'a Object> {
    match object {
        Object::Reference(id) => document.get_object(*id).ok(),
        other => Some(other),
    }
}

/// Read a numeric PDF object as `f32`.
pub(crate) fn as_number(object: &Object) -> Option<f32> {
    match object {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(r) => Some(*r as f32),
        _ => None,
    }
}

/// Width and height, in points, of a page's media box.
pub(crate) fn media_box_size(document: &Document, page_id: ObjectId) -> Option<(f32, f32)> {
    let media_box = inherited_attribute(document, page_id, b"MediaBox")?;
    let values = match resolve(document, &media_box)? {
        Object::Array(values) => values.clone(),
        _ => return None,
    };
    if values.len() != 4 {
        return None;
    }
    let nums: Vec<f32> = values.iter().filter_map(as_number).collect();
    if nums.len() != 4 {
        return None;
    }
    Some(((nums[2] - nums[0]).abs(), (nums[3] - nums[1]).abs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_extensions_are_case_insensitive() {
        for ext in ["jpg", ".JPEG", "Png", ".gif", "BMP"] {
            assert!(is_image_extension(ext), "{ext} should be accepted");
        }
        assert!(!is_image_extension("tiff"));
        assert!(!is_image_extension("pdf"));
    }

    #[test]
    fn document_extension_is_pdf_only() {
        assert!(is_document_extension(".PDF"));
        assert!(is_document_extension("pdf"));
        assert!(!is_document_extension("png"));
    }

    #[test]
    fn load_document_rejects_garbage() {
        let err = load_document(b"definitely not a pdf", 3).unwrap_err();
        match err {
            PdfToolsError::CorruptDocument { index, .. } => assert_eq!(index, 3),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
