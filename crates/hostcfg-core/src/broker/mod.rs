// # Broker Implementations
//
// In-process implementation of the ConfigBroker contract plus the topic
// filter matching shared with the MQTT adapter.

pub mod memory;

pub use memory::MemoryBroker;

/// Match a concrete topic against an MQTT-style filter
///
/// `+` matches exactly one level, `#` matches all remaining levels
/// (including none) and must be the last level of the filter.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
