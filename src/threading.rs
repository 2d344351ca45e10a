//! Thread-id computation.
//!
//! A thread id groups messages of one conversation across re-syncs. When the
//! message carries References or In-Reply-To, the thread is keyed on the
//! conversation root; otherwise on the normalized subject plus the sorted
//! participant set. Both keys hash to a stable hex id, so the same inputs
//! always produce the same thread regardless of sync order.

use sha2::{Digest, Sha256};

/// Strips reply/forward prefixes, collapses whitespace and case-folds.
///
/// `"Re: Fwd:  Hello  World "` and `"hello world"` normalize identically.
pub(crate) fn normalize_subject(subject: &str) -> String {
    let mut s = subject.trim();
    loop {
        let lower = s.to_lowercase();
        let stripped = ["re:", "fwd:", "fw:", "aw:", "wg:"]
            .iter()
            .find_map(|prefix| lower.starts_with(prefix).then(|| s[prefix.len()..].trim_start()));
        match stripped {
            Some(rest) => s = rest,
            None => break,
        }
    }
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Returns the first message-id of the References header, the conversation
/// root, or falls back to In-Reply-To.
pub(crate) fn conversation_root<'a>(
    references: &'a str,
    in_reply_to: &'a str,
) -> Option<&'a str> {
    references
        .split_whitespace()
        .next()
        .filter(|s| !s.is_empty())
        .or_else(|| {
            in_reply_to
                .split_whitespace()
                .next()
                .filter(|s| !s.is_empty())
        })
}

fn hash_hex(input: &str) -> String {
    let hash = Sha256::digest(input.as_bytes());
    hex::encode(&hash[..16])
}

/// Computes a thread id from the reference chain when present, else from the
/// normalized subject and sorted participant set.
pub(crate) fn thread_id(
    references: &str,
    in_reply_to: &str,
    subject: &str,
    participants: &[String],
) -> String {
    if let Some(root) = conversation_root(references, in_reply_to) {
        return hash_hex(&format!("ref\x00{}", root.trim_matches(['<', '>'])));
    }

    let mut participants: Vec<String> =
        participants.iter().map(|p| p.to_lowercase()).collect();
    participants.sort();
    participants.dedup();
    hash_hex(&format!(
        "subj\x00{}\x00{}",
        normalize_subject(subject),
        participants.join(",")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_subject() {
        // Test vectors pinning the normalization.
        assert_eq!(normalize_subject("Hello World"), "hello world");
        assert_eq!(normalize_subject("Re: Hello World"), "hello world");
        assert_eq!(normalize_subject("RE: re: Fwd: Hello World"), "hello world");
        assert_eq!(normalize_subject("Fw:   Hello   World  "), "hello world");
        assert_eq!(normalize_subject("  Hello\tWorld "), "hello world");
        assert_eq!(normalize_subject(""), "");
        // A lone "Re:" leaves an empty subject.
        assert_eq!(normalize_subject("Re:"), "");
        // Prefix must be at the start.
        assert_eq!(normalize_subject("Compare: results"), "compare: results");
    }

    #[test]
    fn test_conversation_root() {
        assert_eq!(
            conversation_root("<root@x> <mid@x>", "<mid@x>"),
            Some("<root@x>")
        );
        assert_eq!(conversation_root("", "<parent@x>"), Some("<parent@x>"));
        assert_eq!(conversation_root("", ""), None);
    }

    #[test]
    fn test_thread_id_stability() {
        // References dominate the subject.
        let a = thread_id("<root@x>", "", "Re: Hi", &["a@x".into(), "b@x".into()]);
        let b = thread_id("<root@x> <child@x>", "", "Totally different", &[]);
        assert_eq!(a, b);

        // Fallback: normalized subject + participants, order-insensitive.
        let c = thread_id("", "", "Re: Budget", &["a@x".into(), "B@X".into()]);
        let d = thread_id("", "", "budget", &["b@x".into(), "A@X".into()]);
        assert_eq!(c, d);

        // Different participants split the thread.
        let e = thread_id("", "", "budget", &["c@x".into()]);
        assert_ne!(c, e);
    }
}
