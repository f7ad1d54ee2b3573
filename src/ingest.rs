// src/ingest.rs
//! Submission-side text hygiene shared by the HTTP layer and the seed tool.

use once_cell::sync::OnceCell;

/// Hard cap on stored conversation text, in chars.
pub const MAX_TEXT_CHARS: usize = 2000;

/// Normalize submitted text: decode entities, straighten quotes, collapse
/// whitespace, trim, cap length. Returns an empty string for blank input,
/// which the caller rejects.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode (feeds often arrive with &amp; etc.)
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Normalize “ ” ‘ ’ « » to ASCII quotes
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 3) Collapse whitespace
    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").to_string();
    out = out.trim().to_string();

    // 4) Length cap
    if out.chars().count() > MAX_TEXT_CHARS {
        out = out.chars().take(MAX_TEXT_CHARS).collect();
    }

    out
}

/// Short anonymized id for log lines. Never log raw conversation text.
pub fn text_digest(text: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(12);
    for b in digest.iter().take(6) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_entities_and_collapses_whitespace() {
        let s = normalize_text("My order &amp; refund\n\n   still  pending");
        assert_eq!(s, "My order & refund still pending");
    }

    #[test]
    fn straightens_curly_quotes() {
        let s = normalize_text("\u{201C}great\u{201D} service, I\u{2019}m told");
        assert_eq!(s, "\"great\" service, I'm told");
    }

    #[test]
    fn blank_input_normalizes_to_empty() {
        assert_eq!(normalize_text("   \n\t  "), "");
        assert_eq!(normalize_text(""), "");
    }

    #[test]
    fn caps_length_on_char_boundary() {
        let long = "é".repeat(MAX_TEXT_CHARS + 50);
        let s = normalize_text(&long);
        assert_eq!(s.chars().count(), MAX_TEXT_CHARS);
    }

    #[test]
    fn digest_is_stable_and_short() {
        let a = text_digest("hello");
        let b = text_digest("hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert_ne!(text_digest("other"), a);
    }
}
