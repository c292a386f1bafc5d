//! MQTT-style topic matching.
//!
//! Topics are `/`-separated UTF-8 strings. In a subscription filter `+`
//! matches exactly one level and `#`, legal only as the last level, matches
//! the remaining suffix including the parent level itself, so `sport/#`
//! matches both `sport` and `sport/tennis/player1`.

/// Returns true when `topic` is covered by the subscription `filter`.
///
/// `topic` may itself be a filter: the routing table records remote
/// subscription patterns and matches concrete publish topics against them.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    // A leading wildcard never captures topics reserved with '$'.
    if (filter.starts_with('+') || filter.starts_with('#')) && topic.starts_with('$') {
        return false;
    }

    let mut pattern = filter.split('/');
    let mut levels = topic.split('/');

    loop {
        match (pattern.next(), levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(expected), Some(level)) if expected == level => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Validates a subscription filter: `#` only in final position, wildcards
/// only as whole levels.
pub fn valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;

    levels.iter().enumerate().all(|(pos, level)| match *level {
        "#" => pos == last,
        "+" => true,
        name => !name.contains('#') && !name.contains('+'),
    })
}

/// Validates a publish topic: non-empty and free of wildcards.
pub fn valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains('#') && !topic.contains('+')
}
