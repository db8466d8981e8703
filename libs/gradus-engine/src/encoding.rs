//! Text decoding for test data and captured program output.
//!
//! Expected outputs are uploaded by instructors and program output comes
//! from arbitrary student code, so neither is reliably UTF-8. Decoding
//! walks the configured encoding list and takes the first lossless
//! match; callers treat a total miss as a test failure, not an engine
//! error.

use encoding_rs::Encoding;
use tracing::warn;

/// Resolve configured encoding labels, dropping the ones encoding_rs
/// does not know.
pub fn resolve_encodings(labels: &[String]) -> Vec<&'static Encoding> {
    let mut encodings = Vec::with_capacity(labels.len());
    for label in labels {
        match Encoding::for_label(label.as_bytes()) {
            Some(encoding) => encodings.push(encoding),
            None => warn!(label = %label, "unknown text encoding label, skipping"),
        }
    }
    encodings
}

/// Decode with the first encoding that round-trips without replacement
/// characters. `None` means every candidate had errors.
pub fn decode_with_fallback(bytes: &[u8], encodings: &[&'static Encoding]) -> Option<String> {
    for encoding in encodings {
        let (text, _, had_errors) = encoding.decode(bytes);
        if !had_errors {
            return Some(text.into_owned());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_utf8_decodes_first() {
        let encodings = resolve_encodings(&labels(&["utf-8", "windows-1252"]));
        assert_eq!(
            decode_with_fallback("héllo".as_bytes(), &encodings).as_deref(),
            Some("héllo")
        );
    }

    #[test]
    fn test_fallback_to_windows_1252() {
        let encodings = resolve_encodings(&labels(&["utf-8", "windows-1252"]));
        // 0xE9 is invalid UTF-8 but decodes as 'é' in windows-1252.
        assert_eq!(
            decode_with_fallback(&[b'c', b'a', b'f', 0xE9], &encodings).as_deref(),
            Some("café")
        );
    }

    #[test]
    fn test_all_candidates_failing_yields_none() {
        let encodings = resolve_encodings(&labels(&["utf-8"]));
        assert_eq!(decode_with_fallback(&[0xFF, 0xFE, 0x00], &encodings), None);
    }

    #[test]
    fn test_unknown_labels_are_skipped() {
        let encodings = resolve_encodings(&labels(&["not-a-charset", "utf-8"]));
        assert_eq!(encodings.len(), 1);
        assert_eq!(encodings[0].name(), "UTF-8");
    }

    #[test]
    fn test_empty_encoding_list_decodes_nothing() {
        assert_eq!(decode_with_fallback(b"plain", &[]), None);
    }
}
