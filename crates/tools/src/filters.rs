//! Content filter builder: one isolation predicate per generic file.
//!
//! Relational dumps and spreadsheets get dedicated tools and never take part in
//! generic vector retrieval.

use docchat_core::chat::{ChatFile, FileKind};
use docchat_core::vector::Predicate;

/// The isolation predicate for one file, or `None` when the file has its own tool kind.
pub fn file_filter(file: &ChatFile) -> Option<Predicate> {
    match file.kind {
        FileKind::RelationalDump | FileKind::Spreadsheet => None,
        FileKind::GenericDocument | FileKind::WebArtifact => Some(Predicate::file(&file.id)),
    }
}

/// Predicates for every file eligible for generic retrieval, in input order.
pub fn build_filters(files: &[ChatFile]) -> Vec<Predicate> {
    files.iter().filter_map(file_filter).collect()
}
