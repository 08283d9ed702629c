//! Stored filename construction
//!
//! A stored attachment is named `{sender}_{timestamp}_{stem}{ext}`,
//! where every component is reduced to a small ASCII alphabet so the
//! result can never escape the attachments directory.

use regex::Regex;
use std::sync::LazyLock;

/// `chrono` format of the timestamp component (fixed width, sortable).
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

static ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(.+?)>|([^\s<>]+@[^\s<>]+)").expect("address pattern is valid")
});

/// Extract the bare address from a `From` header value.
///
/// An angle-bracketed token wins over a bare `local@domain` token.
/// When neither is present the raw sender is returned unchanged.
#[must_use]
pub fn extract_address(sender: &str) -> &str {
    ADDRESS
        .captures(sender)
        .and_then(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map_or(sender, |m| m.as_str())
}

/// Build the stored filename for an attachment.
#[must_use]
pub fn sanitize_filename(sender: &str, filename: &str, timestamp: &str) -> String {
    let clean_sender: String = extract_address(sender)
        .to_lowercase()
        .chars()
        .map(|c| if matches!(c, '<' | '>' | '@' | '.') { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
        .collect();

    let (stem, ext) = split_extension(filename);
    let clean_stem = replace_disallowed(stem);
    let clean_ext = replace_disallowed(&ext.to_lowercase());

    format!("{clean_sender}_{timestamp}_{clean_stem}{clean_ext}")
}

fn replace_disallowed(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Split off the extension of the last path component, including the dot.
///
/// Leading dots of that component never start an extension, so
/// `.bashrc` has none and `archive.tar.gz` yields `.gz`.
fn split_extension(filename: &str) -> (&str, &str) {
    let base_start = filename.rfind(['/', '\\']).map_or(0, |i| i + 1);
    let base = &filename[base_start..];

    match base.rfind('.') {
        Some(dot) if base[..dot].chars().any(|c| c != '.') => {
            filename.split_at(base_start + dot)
        }
        _ => (filename, ""),
    }
}
