//! Topic matching
//!
//! Topics are `/`-delimited token sequences such as
//! `tms/train/departed/origin/12345`. Subscription patterns may use two
//! wildcards:
//! - `*` matches exactly one token at its position
//! - `>` as the final token matches one or more remaining tokens
//!
//! Matching is case-sensitive and allocation-free.

pub mod validation;

pub use validation::{validate_pattern, validate_topic};

/// Single-level wildcard token
pub const SINGLE_WILDCARD: &str = "*";
/// Multi-level wildcard token (only meaningful as the last token)
pub const MULTI_WILDCARD: &str = ">";

/// Check whether `topic` satisfies the subscription `pattern`
///
/// A `>` that is not the last token is compared literally, as is any token
/// that merely contains `*`.
pub fn matches(topic: &str, pattern: &str) -> bool {
    let mut topic_tokens = topic.split('/');
    let mut pattern_tokens = pattern.split('/').peekable();

    while let Some(pattern_token) = pattern_tokens.next() {
        if pattern_token == MULTI_WILDCARD && pattern_tokens.peek().is_none() {
            // Needs at least one more topic token
            return topic_tokens.next().is_some();
        }

        match topic_tokens.next() {
            Some(topic_token) => {
                if pattern_token != SINGLE_WILDCARD && pattern_token != topic_token {
                    return false;
                }
            }
            None => return false,
        }
    }

    topic_tokens.next().is_none()
}

/// Translate a pattern into an MQTT topic filter for broker-side filtering
///
/// `*` becomes `+` and a trailing `>` becomes `#`. MQTT's `#` also matches
/// the parent level (`a/#` matches `a`), so deliveries from a broker using
/// the translated filter must still be checked with [`matches`].
pub fn to_mqtt_filter(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut tokens = pattern.split('/').peekable();
    let mut first = true;

    while let Some(token) = tokens.next() {
        if !first {
            out.push('/');
        }
        first = false;

        if token == SINGLE_WILDCARD {
            out.push('+');
        } else if token == MULTI_WILDCARD && tokens.peek().is_none() {
            out.push('#');
        } else {
            out.push_str(token);
        }
    }

    out
}
