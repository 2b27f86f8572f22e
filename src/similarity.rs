//! Textual similarity between finding messages.
//!
//! Messages produced by the same underlying defect drift slightly between runs, so comparisons
//! use a normalized Levenshtein ratio over whitespace-collapsed, lowercased text.

/// Collapse runs of whitespace and lowercase.
pub fn normalize(message: &str) -> String {
    message
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// `1 - distance / max(len)` over normalized messages, in `0.0..=1.0`.
pub fn ratio(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(&normalize(a), &normalize(b))
}

/// Similarity of two message sets.
///
/// Each message is scored by its best match in the other set, and the scores from both
/// directions are averaged. Two empty sets are identical; one empty set against a non-empty
/// one scores zero.
pub fn message_set_similarity(left: &[&str], right: &[&str]) -> f64 {
    match (left.is_empty(), right.is_empty()) {
        (true, true) => return 1.0,
        (true, false) | (false, true) => return 0.0,
        _ => {}
    }

    let left: Vec<String> = left.iter().map(|m| normalize(m)).collect();
    let right: Vec<String> = right.iter().map(|m| normalize(m)).collect();

    let total = best_match_sum(&left, &right) + best_match_sum(&right, &left);
    total / (left.len() + right.len()) as f64
}

fn best_match_sum(from: &[String], to: &[String]) -> f64 {
    from.iter()
        .map(|m| {
            to.iter()
                .map(|other| strsim::normalized_levenshtein(m, other))
                .fold(0.0, f64::max)
        })
        .sum()
}
