//! Topic and pattern validation
//!
//! Key rules:
//! - Topics are concrete: no `*` or `>` tokens
//! - Patterns may use `*` as a whole token anywhere and `>` as the whole
//!   final token
//! - Neither may contain `+`, `#` or NUL since they travel as MQTT topic
//!   names and filters on the remote backend

const MAX_TOPIC_LEN: usize = 65535;

/// Error texts for the checks shared by topics and patterns
struct Messages {
    empty: &'static str,
    too_long: &'static str,
    null: &'static str,
    mqtt_wildcard: &'static str,
}

const TOPIC: Messages = Messages {
    empty: "topic cannot be empty",
    too_long: "topic exceeds maximum length",
    null: "topic cannot contain null character",
    mqtt_wildcard: "topic cannot contain '+' or '#'",
};

const PATTERN: Messages = Messages {
    empty: "pattern cannot be empty",
    too_long: "pattern exceeds maximum length",
    null: "pattern cannot contain null character",
    mqtt_wildcard: "pattern cannot contain '+' or '#'",
};

fn validate_common(value: &str, messages: &Messages) -> Result<(), &'static str> {
    if value.is_empty() {
        return Err(messages.empty);
    }
    if value.len() > MAX_TOPIC_LEN {
        return Err(messages.too_long);
    }
    if value.contains('\0') {
        return Err(messages.null);
    }
    if value.contains('+') || value.contains('#') {
        return Err(messages.mqtt_wildcard);
    }
    Ok(())
}

/// Validate a concrete topic (used for publish)
pub fn validate_topic(topic: &str) -> Result<(), &'static str> {
    validate_common(topic, &TOPIC)?;

    if topic.split('/').any(|token| token == "*" || token == ">") {
        return Err("topic cannot contain wildcard tokens");
    }

    Ok(())
}

/// Validate a subscription pattern
pub fn validate_pattern(pattern: &str) -> Result<(), &'static str> {
    validate_common(pattern, &PATTERN)?;

    let mut tokens = pattern.split('/').peekable();
    while let Some(token) = tokens.next() {
        let last = tokens.peek().is_none();

        if token.contains('>') {
            if token != ">" {
                return Err("'>' must occupy an entire token");
            }
            if !last {
                return Err("'>' must be the last token");
            }
        }

        if token.contains('*') && token != "*" {
            return Err("'*' must occupy an entire token");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_topic() {
        assert!(validate_topic("tms").is_ok());
        assert!(validate_topic("tms/train/departed/origin/12345").is_ok());
        assert!(validate_topic("/tms/train").is_ok());
        assert!(validate_topic("tms/train/").is_ok());
        assert!(validate_topic("tms/a*b").is_ok());

        assert!(validate_topic("").is_err());
        assert!(validate_topic("tms/*/departed").is_err());
        assert!(validate_topic("tms/>").is_err());
        assert!(validate_topic("tms/+").is_err());
        assert!(validate_topic("tms/#").is_err());
        assert!(validate_topic("tms\0train").is_err());
    }

    #[test]
    fn test_validate_pattern() {
        assert!(validate_pattern("tms").is_ok());
        assert!(validate_pattern(">").is_ok());
        assert!(validate_pattern("*").is_ok());
        assert!(validate_pattern("tms/>").is_ok());
        assert!(validate_pattern("tms/*/departed").is_ok());
        assert!(validate_pattern("*/*/>").is_ok());

        assert!(validate_pattern("").is_err());
        assert!(validate_pattern("tms/>/x").is_err());
        assert!(validate_pattern("tms/a>").is_err());
        assert!(validate_pattern("tms/a*").is_err());
        assert!(validate_pattern("tms/#").is_err());
        assert!(validate_pattern("tms/+/x").is_err());
    }

    #[test]
    fn test_error_messages_name_the_kind() {
        assert_eq!(validate_topic(""), Err("topic cannot be empty"));
        assert_eq!(validate_pattern(""), Err("pattern cannot be empty"));
        let long = "a".repeat(MAX_TOPIC_LEN + 1);
        assert_eq!(validate_topic(&long), Err("topic exceeds maximum length"));
    }
}
