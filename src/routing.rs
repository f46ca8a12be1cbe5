// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Routing Key Matching
//!
//! Topic-exchange matching: routing keys are dot-separated segments, `*`
//! matches exactly one segment and `#` matches zero or more.

/// Returns whether `routing_key` matches the binding `pattern`.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    segments_match(&pattern, &key)
}

fn segments_match(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            segments_match(rest, key) || (!key.is_empty() && segments_match(pattern, &key[1..]))
        }
        (Some((&"*", rest)), Some((_, key_rest))) => segments_match(rest, key_rest),
        (Some((segment, rest)), Some((head, key_rest))) if segment == head => {
            segments_match(rest, key_rest)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_keys_match_themselves_only() {
        assert!(topic_matches("automation.run", "automation.run"));
        assert!(!topic_matches("automation.run", "automation.new"));
        assert!(!topic_matches("automation.run", "automation.run.extra"));
    }

    #[test]
    fn star_matches_exactly_one_segment() {
        assert!(topic_matches("automation.*", "automation.run"));
        assert!(!topic_matches("automation.*", "automation"));
        assert!(!topic_matches("automation.*", "automation.run.extra"));
        assert!(!topic_matches("automation.*.extra", "automation.run"));
        assert!(topic_matches("automation.*.extra", "automation.run.extra"));
    }

    #[test]
    fn hash_matches_zero_or_more_segments() {
        assert!(topic_matches("automation.#", "automation.run"));
        assert!(topic_matches("automation.#", "automation"));
        assert!(topic_matches("automation.#", "automation.run.extra"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("#.run", "automation.run"));
        assert!(!topic_matches("automation.#", "notification.user"));
    }
}
