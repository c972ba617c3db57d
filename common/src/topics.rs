pub const DEFAULT_HEARTBEAT_TOPIC: &str = "watchdog/heartbeat";
pub const DEFAULT_HEARTBEAT_ACK_TOPIC: &str = "watchdog/heartbeat/ack";

/// Matches an MQTT topic against a subscription filter, honouring `+` and `#`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_wildcard_filters() {
        assert!(topic_matches("watchdog/heartbeat/ack", "watchdog/heartbeat/ack"));
        assert!(topic_matches("watchdog/+/ack", "watchdog/heartbeat/ack"));
        assert!(topic_matches("watchdog/#", "watchdog/heartbeat/ack"));
        assert!(!topic_matches("watchdog/heartbeat", "watchdog/heartbeat/ack"));
        assert!(!topic_matches("watchdog/heartbeat/ack", "watchdog/heartbeat"));
        assert!(!topic_matches("watchdog/+", "watchdog/heartbeat/ack"));
    }
}
