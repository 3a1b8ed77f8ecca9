//! Text normalization and content fingerprints.
//!
//! Normalization strips formatting noise that should not make two posts look
//! different: zero-width characters, line-ending style, repeated spaces,
//! blank-line runs and the promotional tails channels append to every post.

use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

static ZERO_WIDTH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\u{200B}-\u{200D}\u{FEFF}]").unwrap());
static INLINE_WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]+").unwrap());

// Recurring tail lines. Matched against the last non-empty line only.
static TAIL_STOP_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)^подписывай(тесь|ся)\b.*",
        r"(?i)^subscribe\b.*",
        r"(?i)^реклама\b.*",
        r"(?i)^(advertisement|sponsored)\b.*",
        r"(?i)^источник:?.*",
        r"(?i)^source:.*",
        r"(?i)^читайте также\b.*",
        r"(?i)^read also\b.*",
        r"(?i)^(https?://)?t\.me/\S+$",
        r"(?i)^поддерж(ать|ите) канал\b.*",
        r"(?i)^support the channel\b.*",
        r"(?i).*\bdonate\b.*",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

fn is_tail_stop_line(line: &str) -> bool {
    TAIL_STOP_PATTERNS.iter().any(|re| re.is_match(line))
}

/// Normalize post text for hashing, summarization and embedding.
pub fn normalize_text(text: &str) -> String {
    let without_zero_width = ZERO_WIDTH_RE.replace_all(text, "");
    let unified = without_zero_width.replace("\r\n", "\n").replace('\r', "\n");

    let mut lines: Vec<String> = Vec::new();
    for raw_line in unified.split('\n') {
        let line = INLINE_WHITESPACE_RE.replace_all(raw_line, " ").trim().to_string();
        if line.is_empty() {
            // Collapse blank-line runs to a single paragraph break
            if matches!(lines.last(), Some(last) if last.is_empty()) {
                continue;
            }
        }
        lines.push(line);
    }

    while matches!(lines.last(), Some(last) if last.is_empty()) {
        lines.pop();
    }

    while lines.last().is_some_and(|last| is_tail_stop_line(last)) {
        lines.pop();
        while matches!(lines.last(), Some(last) if last.is_empty()) {
            lines.pop();
        }
    }

    let first_content = lines.iter().position(|l| !l.is_empty()).unwrap_or(lines.len());
    lines[first_content..].join("\n").trim().to_string()
}

/// Fingerprint of an item's content.
///
/// - non-empty text: SHA-256 of the normalized text
/// - media only: SHA-256 of `media-only:{posted_at}:{permalink}`
/// - neither: SHA-256 of `empty:{posted_at}:{permalink}`
pub fn content_hash(
    normalized_text: &str,
    has_media: bool,
    posted_at: DateTime<Utc>,
    permalink: Option<&str>,
) -> String {
    let normalized = normalized_text.trim();
    let payload = if !normalized.is_empty() {
        normalized.to_string()
    } else {
        let marker = if has_media { "media-only" } else { "empty" };
        format!(
            "{}:{}:{}",
            marker,
            posted_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            permalink.unwrap_or("")
        )
    };

    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn posted() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 7, 10, 30, 0).unwrap()
    }

    #[test]
    fn test_whitespace_variants_normalize_equal() {
        let a = "Привет,   мир!\n\nНовая строка.";
        let b = "Привет, мир!\r\n\r\nНовая строка.   ";
        assert_eq!(normalize_text(a), normalize_text(b));

        let hash_a = content_hash(&normalize_text(a), false, posted(), Some("https://t.me/test/1"));
        let hash_b = content_hash(&normalize_text(b), false, posted(), Some("https://t.me/test/1"));
        assert_eq!(hash_a, hash_b);
    }

    #[test]
    fn test_trailing_promo_removed() {
        let base = "Важная новость дня\nПодробности внутри.";
        let with_tail = format!("{base}\n\nПодписывайтесь на канал @example");
        assert_eq!(normalize_text(base), normalize_text(&with_tail));
    }

    #[test]
    fn test_stacked_tails_removed() {
        let text = "Release notes are out.\n\nSource: example.com\nt.me/somechannel";
        assert_eq!(normalize_text(text), "Release notes are out.");
    }

    #[test]
    fn test_zero_width_and_blank_runs() {
        let text = "\n\n\u{200B}Hello\u{FEFF}\n\n\n\n\tworld  \n\n";
        assert_eq!(normalize_text(text), "Hello\n\nworld");
    }

    #[test]
    fn test_hash_is_stable() {
        let h1 = content_hash("same text", false, posted(), None);
        let h2 = content_hash("same text", false, posted(), None);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_text_hash_ignores_time_and_link() {
        let later = posted() + chrono::Duration::hours(3);
        assert_eq!(
            content_hash("same text", false, posted(), Some("a")),
            content_hash("same text", true, later, Some("b"))
        );
    }

    #[test]
    fn test_media_only_hash_uses_marker() {
        let media = content_hash("", true, posted(), Some("https://t.me/c/5"));
        let other_link = content_hash("", true, posted(), Some("https://t.me/c/6"));
        let empty = content_hash("", false, posted(), Some("https://t.me/c/5"));
        assert_ne!(media, other_link);
        assert_ne!(media, empty);

        let mut hasher = Sha256::new();
        hasher.update(b"media-only:2026-02-07T10:30:00Z:https://t.me/c/5");
        assert_eq!(media, format!("{:x}", hasher.finalize()));
    }
}
