//! Output comparison.
//!
//! Expected and actual output are normalized before comparison so that
//! platform line endings and trailing whitespace at the end of the
//! stream never fail a submission. A pass is exactly "the unified diff
//! of the normalized texts is empty".

use similar::TextDiff;

/// Canonical form used for comparison: every line ending becomes `\n`
/// and trailing whitespace at the end of the text is dropped.
pub fn normalize(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n").trim_end().to_string()
}

/// Unified line diff of the normalized texts, `None` when they match.
pub fn unified_diff(expected: &str, actual: &str) -> Option<String> {
    let expected = normalize(expected);
    let actual = normalize(actual);
    if expected == actual {
        return None;
    }
    // TextDiff::from_lines wants both texts to end in a newline so the
    // last line is not rendered with a "no newline" marker.
    let expected = with_final_newline(expected);
    let actual = with_final_newline(actual);
    let text_diff = TextDiff::from_lines(&expected, &actual);
    let mut unified = text_diff.unified_diff();
    Some(
        unified
            .context_radius(3)
            .header("expected", "actual")
            .to_string(),
    )
}

fn with_final_newline(mut text: String) -> String {
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}
