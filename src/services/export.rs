//! CSV export in the stock marketplace's bulk-upload layout.

use crate::models::batch::{Batch, ImageStatus};
use crate::models::metadata::Metadata;

pub const CSV_HEADER: &str = "Filename,Title,Keywords,Category,Releases";

/// Quote a field when it contains a delimiter, quote or line break.
fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

pub fn to_csv<'a>(rows: impl IntoIterator<Item = &'a Metadata>) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push_str("\r\n");
    for m in rows {
        out.push_str(&escape(&m.filename));
        out.push(',');
        out.push_str(&escape(&m.title));
        out.push(',');
        out.push_str(&escape(&m.keywords));
        out.push(',');
        out.push_str(&m.category.to_string());
        out.push(',');
        out.push_str("\r\n");
    }
    out
}

/// Rows for every completed image of a batch, in batch order.
pub fn batch_to_csv(batch: &Batch) -> String {
    to_csv(
        batch
            .images
            .iter()
            .filter(|i| i.status == ImageStatus::Completed)
            .filter_map(|i| i.metadata.as_ref()),
    )
}
