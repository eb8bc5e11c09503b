//! # Topic Matching
//!
//! MQTT-style wildcard matching used by the topic router.
//!
//! ```text
//!   pattern   a / + / c          a / #
//!   topic     a / b / c   ✓      a / b / c   ✓
//!             a / b / c / d ✗    a           ✓ (walk ends before '#')
//! ```

/// Returns true when `topic` matches `pattern`.
///
/// `+` matches exactly one segment. `#` matches the rest of the topic. When
/// segment counts differ the pattern must end in `#`; the pairwise walk then
/// stops at the shorter side, so `"a/#"` also matches `"a"`.
pub fn topic_matches(topic: &str, pattern: &str) -> bool {
    if topic == pattern {
        return true;
    }

    let topic_parts: Vec<&str> = topic.split('/').collect();
    let pattern_parts: Vec<&str> = pattern.split('/').collect();

    if topic_parts.len() != pattern_parts.len() && !pattern.ends_with('#') {
        return false;
    }

    for (pattern_part, topic_part) in pattern_parts.iter().zip(topic_parts.iter()) {
        match *pattern_part {
            "#" => return true,
            "+" => continue,
            literal if literal != *topic_part => return false,
            _ => {}
        }
    }

    true
}

/// Returns the segment at `index`, if present.
///
/// Topic handlers use this to pull the device id out of
/// `{prefix}/energy/{device_id}/data`.
pub fn segment(topic: &str, index: usize) -> Option<&str> {
    topic.split('/').nth(index).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b/d"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(topic_matches("a/b/c", "a/+/c"));
        assert!(!topic_matches("a/b/c/d", "a/+/c"));
        assert!(!topic_matches("a/b", "a/+/c"));
        assert!(topic_matches("fg/energy/inv-1/data", "+/energy/+/data"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(topic_matches("a/b/c", "a/#"));
        assert!(topic_matches("a/b", "a/#"));
        assert!(!topic_matches("x/b/c", "a/#"));
        assert!(topic_matches("alerts/inv-1/overheat", "alerts/+/#"));
    }

    #[test]
    fn test_hash_against_parent_topic_matches() {
        assert!(topic_matches("a", "a/#"));
    }

    #[test]
    fn test_segment_helpers() {
        assert_eq!(segment("fg/energy/inv-1/data", 2), Some("inv-1"));
        assert_eq!(segment("fg/energy", 5), None);
        assert_eq!(segment("fg/alerts/alerts/alerts", 2), Some("alerts"));
        assert_eq!(segment("fg//x", 1), None);
    }
}
