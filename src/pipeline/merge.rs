//! PDF merge: concatenate the pages of several documents, in order.
//!
//! Pages are never decoded. Each input's object graph is renumbered into a
//! disjoint id range and copied wholesale into the output; only the page-tree
//! nodes (`/Catalog`, `/Pages`) are dropped and rebuilt as one flat tree.
//!
//! ## Inherited attributes
//!
//! A page may omit `MediaBox`, `Resources`, `CropBox` or `Rotate` and inherit
//! them from an ancestor `/Pages` node. Since those nodes are discarded, the
//! inherited values are copied onto each page before it is re-parented;
//! otherwise a merged page could lose its fonts or its size.

use crate::error::PdfToolsError;
use crate::pipeline::{inherited_attribute, INHERITABLE_ATTRIBUTES};
use lopdf::{dictionary, Document, Object, ObjectId};
use tracing::debug;

/// Merge parsed documents into one, preserving document and page order.
///
/// # Errors
/// [`PdfToolsError::InsufficientInputs`] for fewer than two documents.
pub fn merge(documents: Vec<Document>) -> Result<Document, PdfToolsError> {
    if documents.len() < 2 {
        return Err(PdfToolsError::InsufficientInputs {
            got: documents.len(),
        });
    }

    let mut merged = Document::with_version("1.5");
    let pages_id = merged.new_object_id();
    let mut next_id = merged.max_id + 1;
    let mut kids: Vec<Object> = Vec::new();

    for (index, mut doc) in documents.into_iter().enumerate() {
        doc.renumber_objects_with(next_id);
        next_id = doc.max_id + 1;

        // `get_pages` is keyed by page number, so values come out in page order.
        let page_ids: Vec<ObjectId> = doc.get_pages().into_values().collect();
        for &page_id in &page_ids {
            materialise_inherited(&mut doc, page_id);
        }
        debug!("Merging document {} ({} pages)", index, page_ids.len());

        for (id, object) in std::mem::take(&mut doc.objects) {
            match type_name(&object) {
                Some(b"Catalog") | Some(b"Pages") => continue,
                _ => {
                    merged.objects.insert(id, object);
                }
            }
        }

        for page_id in page_ids {
            if let Ok(Object::Dictionary(page)) = merged.get_object_mut(page_id) {
                page.set("Parent", pages_id);
            }
            kids.push(page_id.into());
        }
    }

    merged.max_id = next_id - 1;
    let count = kids.len() as i64;
    merged.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = merged.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    merged.trailer.set("Root", catalog_id);

    Ok(merged)
}

/// Parse and merge raw PDF byte buffers.
///
/// Any unparseable input fails the whole merge before anything is built.
pub fn merge_bytes(inputs: &[Vec<u8>]) -> Result<Document, PdfToolsError> {
    if inputs.len() < 2 {
        return Err(PdfToolsError::InsufficientInputs { got: inputs.len() });
    }
    let documents = inputs
        .iter()
        .enumerate()
        .map(|(index, bytes)| crate::pipeline::load_document(bytes, index))
        .collect::<Result<Vec<_>, _>>()?;
    merge(documents)
}

/// Copy inheritable attributes from ancestors onto the page itself.
fn materialise_inherited(doc: &mut Document, page_id: ObjectId) {
    let missing: Vec<(&[u8], Object)> = INHERITABLE_ATTRIBUTES
        .iter()
        .filter_map(|key| {
            let has_own = doc
                .get_dictionary(page_id)
                .map(|dict| dict.has(key))
                .unwrap_or(true);
            if has_own {
                return None;
            }
            inherited_attribute(doc, page_id, key).map(|value| (*key, value))
        })
        .collect();

    if let Ok(Object::Dictionary(page)) = doc.get_object_mut(page_id) {
        for (key, value) in missing {
            page.set(key.to_vec(), value);
        }
    }
}

fn type_name(object: &Object) -> Option<&[u8]> {
    let dict = match object {
        Object::Dictionary(dict) => dict,
        Object::Stream(stream) => &stream.dict,
        _ => return None,
    };
    match dict.get(b"Type") {
        Ok(Object::Name(name)) => Some(name.as_slice()),
        _ => None,
    }
}
