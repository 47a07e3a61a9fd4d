//! # Topic Routing
//!
//! AMQP-style topic matching over `.`-delimited routing keys. `*` matches
//! exactly one segment and `#` matches zero or more segments.

/// Maximum routing key / pattern length accepted by AMQP brokers
pub const MAX_ROUTING_KEY_LENGTH: usize = 255;

/// Check whether a binding pattern matches a routing key
///
/// # Examples
///
/// ```
/// use agentrunner_core::events::routing::topic_matches;
///
/// assert!(topic_matches("task.*", "task.normal"));
/// assert!(topic_matches("collaboration.step.completed.#", "collaboration.step.completed.p1"));
/// assert!(topic_matches("#", "anything.at.all"));
/// assert!(!topic_matches("task.*", "task.failed.normal"));
/// ```
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    if pattern == "#" {
        return true;
    }

    let pattern_parts: Vec<&str> = pattern.split('.').collect();
    let key_parts: Vec<&str> = routing_key.split('.').collect();
    match_segments(&pattern_parts, &key_parts)
}

fn match_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // Adjacent `#` segments are equivalent to a single one
            if rest.first() == Some(&"#") {
                return match_segments(rest, key);
            }
            (0..=key.len()).any(|skip| match_segments(rest, &key[skip..]))
        }
        Some((&"*", rest)) => !key.is_empty() && match_segments(rest, &key[1..]),
        Some((segment, rest)) => {
            key.first().is_some_and(|part| part == segment) && match_segments(rest, &key[1..])
        }
    }
}

/// Validate binding pattern syntax
///
/// Wildcards must occupy a whole segment and segments must be non-empty.
pub fn validate_pattern(pattern: &str) -> Result<(), String> {
    if pattern.is_empty() {
        return Err("pattern must not be empty".to_string());
    }
    if pattern.len() > MAX_ROUTING_KEY_LENGTH {
        return Err(format!(
            "pattern exceeds {MAX_ROUTING_KEY_LENGTH} bytes ({} bytes)",
            pattern.len()
        ));
    }

    for segment in pattern.split('.') {
        if segment.is_empty() {
            return Err(format!("pattern '{pattern}' contains an empty segment"));
        }
        if segment != "*" && segment != "#" && segment.contains(['*', '#']) {
            return Err(format!(
                "wildcard must be a whole segment in pattern '{pattern}' (found '{segment}')"
            ));
        }
    }

    Ok(())
}

/// Whether a pattern contains any wildcard segment
pub fn is_wildcard(pattern: &str) -> bool {
    pattern.split('.').any(|segment| segment == "*" || segment == "#")
}
