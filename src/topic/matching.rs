//! Topic tokenization and wildcard matching
//!
//! Key rules:
//! - `/` is the level separator; empty levels are kept
//! - `+` matches exactly one level
//! - `#` matches the rest of the topic, including zero levels, and only
//!   when it is the last level of the filter
//! - Topics starting with `$` are never matched by a filter whose first
//!   level is a wildcard

use smallvec::SmallVec;

/// Single-level wildcard
pub const SINGLE_LEVEL_WILDCARD: &str = "+";

/// Multi-level wildcard
pub const MULTI_LEVEL_WILDCARD: &str = "#";

/// Split a topic name or filter into levels
///
/// Always yields at least one token: `""` splits into `[""]`.
pub fn tokenize(topic: &str) -> SmallVec<[&str; 8]> {
    topic.split('/').collect()
}

/// Positional comparison of filter levels against published topic levels
pub fn tokens_match<F, T>(filter: &[F], topic: &[T]) -> bool
where
    F: AsRef<str>,
    T: AsRef<str>,
{
    if let (Some(first_filter), Some(first_topic)) = (filter.first(), topic.first()) {
        let first_filter = first_filter.as_ref();
        if first_topic.as_ref().starts_with('$')
            && (first_filter == SINGLE_LEVEL_WILDCARD || first_filter == MULTI_LEVEL_WILDCARD)
        {
            return false;
        }
    }

    let mut ti = 0;
    for (fi, level) in filter.iter().enumerate() {
        match level.as_ref() {
            MULTI_LEVEL_WILDCARD => return fi == filter.len() - 1,
            SINGLE_LEVEL_WILDCARD => {
                if ti >= topic.len() {
                    return false;
                }
            }
            literal => {
                if ti >= topic.len() || topic[ti].as_ref() != literal {
                    return false;
                }
            }
        }
        ti += 1;
    }

    // Published topic must not have levels left over
    ti == topic.len()
}

/// Check if a topic filter matches a topic name, both in string form
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    tokens_match(&tokenize(filter), &tokenize(topic))
}
