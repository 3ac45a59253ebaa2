//! Small text helpers shared by adapters, scoring and retrieval.
//!
//! - String truncation for log fields
//! - Whitespace collapsing and HTML-to-text conversion for feed content
//! - Keyword presence checks for regional detection
//! - Parsing of abbreviated traffic counts such as `"20K+"`

use itertools::Itertools;
use scraper::Html;

/// Truncate a string for logging purposes.
///
/// Long strings are cut at a character boundary no later than `max` bytes and
/// suffixed with the number of bytes dropped.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(truncate_for_log("short", 100), "short");
/// assert_eq!(truncate_for_log(&"a".repeat(500), 10), "aaaaaaaaaa…(+490 bytes)");
/// ```
pub fn truncate_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…(+{} bytes)", &s[..cut], s.len() - cut)
}

/// Replace every run of whitespace (newlines included) with one space and trim.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().join(" ")
}

/// Visible text of an HTML fragment, whitespace-collapsed.
///
/// Feed descriptions routinely embed markup; plain text passes through unchanged.
pub fn html_to_text(fragment: &str) -> String {
    if !fragment.contains('<') {
        return collapse_whitespace(fragment);
    }
    let doc = Html::parse_fragment(fragment);
    collapse_whitespace(&doc.root_element().text().join(" "))
}

/// Whether `text` mentions any of the lower-case `needles`.
pub fn mentions_any(text: &str, needles: &[String]) -> bool {
    let haystack = text.to_lowercase();
    needles.iter().any(|n| !n.is_empty() && haystack.contains(n.as_str()))
}

/// Parse an abbreviated count such as `"20K+"`, `"1.5M"` or `"2,000+"`.
///
/// Returns `None` when no number can be read.
pub fn parse_traffic(raw: &str) -> Option<i64> {
    let cleaned: String = raw
        .trim()
        .trim_end_matches('+')
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();
    let (digits, multiplier) = match cleaned.chars().last()? {
        'k' | 'K' => (&cleaned[..cleaned.len() - 1], 1_000.0),
        'm' | 'M' => (&cleaned[..cleaned.len() - 1], 1_000_000.0),
        _ => (cleaned.as_str(), 1.0),
    };
    let value: f64 = digits.parse().ok()?;
    Some((value * multiplier).round() as i64)
}
