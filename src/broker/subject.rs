//! Topic naming
//!
//! Topic names are `"channels.<channel>"`, extended with `".<subtopic>"` when
//! a subtopic is present. Patterns follow subject-broker grammar: `*` matches
//! exactly one token and `>` (last token only) matches one or more tokens.
//! Drivers whose backend speaks a different grammar translate with the
//! helpers below.

/// Fixed prefix of every channel topic.
pub const CHANNELS_PREFIX: &str = "channels";

/// Pattern matching every channel and every subtopic.
pub const ALL_CHANNELS: &str = "channels.>";

const SEPARATOR: char = '.';
const SINGLE_WILDCARD: &str = "*";
const MULTI_WILDCARD: &str = ">";

pub fn topic_name(channel: &str, subtopic: &str) -> String {
    if subtopic.is_empty() {
        format!("{CHANNELS_PREFIX}.{channel}")
    } else {
        format!("{CHANNELS_PREFIX}.{channel}.{subtopic}")
    }
}

/// Whether the subject-broker pattern `pattern` matches the concrete `subject`.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split(SEPARATOR);
    let mut pattern_tokens = pattern.split(SEPARATOR).peekable();

    while let Some(p) = pattern_tokens.next() {
        if p == MULTI_WILDCARD && pattern_tokens.peek().is_none() {
            // `>` needs at least one remaining token
            return subject_tokens.next().is_some();
        }
        match subject_tokens.next() {
            Some(s) if p == SINGLE_WILDCARD || p == s => {}
            _ => return false,
        }
    }

    subject_tokens.next().is_none()
}

/// Whether `pattern` contains wildcard tokens.
pub fn is_wildcard(pattern: &str) -> bool {
    pattern
        .split(SEPARATOR)
        .any(|t| t == SINGLE_WILDCARD || t == MULTI_WILDCARD)
}

/// Rewrite a subject pattern into an AMQP topic-exchange routing key.
pub fn to_amqp_routing_key(pattern: &str) -> String {
    pattern
        .split(SEPARATOR)
        .map(|t| if t == MULTI_WILDCARD { "#" } else { t })
        .collect::<Vec<_>>()
        .join(".")
}

/// Rewrite a subject pattern into an MQTT topic filter.
pub fn to_mqtt_filter(pattern: &str) -> String {
    pattern
        .split(SEPARATOR)
        .map(|t| match t {
            MULTI_WILDCARD => "#",
            SINGLE_WILDCARD => "+",
            other => other,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Rewrite an inbound MQTT topic back into subject form.
pub fn from_mqtt_topic(topic: &str) -> String {
    topic.replace('/', ".")
}
