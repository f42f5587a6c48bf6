//! Topic filter matching.

/// Whether `topic` matches the subscription `filter`.
///
/// `+` matches exactly one path segment, so a filter and a topic only match
/// when they have the same number of segments. A trailing `#` matches the
/// remaining segments (zero or more). Every other segment must be equal.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return filter_parts.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
