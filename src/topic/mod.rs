//! Topic name/filter validation and matching
//!
//! Key rules:
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - Multi-level wildcard (#) must be the last level and occupy it entirely
//! - Single-level wildcard (+) must occupy an entire level
//! - Topics starting with $ are not matched by filters starting with a wildcard

/// Validate a topic name we publish to
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    check_common(topic)?;
    if topic.contains('+') || topic.contains('#') {
        return Err("topic name cannot contain wildcards");
    }
    Ok(())
}

/// Validate a topic filter we subscribe to
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    check_common(filter)?;

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') {
            if level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if levels.peek().is_some() {
                return Err("multi-level wildcard must be last level");
            }
        }
        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }
    Ok(())
}

fn check_common(s: &str) -> Result<(), &'static str> {
    if s.is_empty() {
        return Err("topic cannot be empty");
    }
    if s.len() > u16::MAX as usize {
        return Err("topic exceeds maximum length");
    }
    if s.contains('\0') {
        return Err("topic cannot contain null character");
    }
    Ok(())
}

/// Check if a topic filter matches a topic name
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    for filter_level in filter.split('/') {
        if filter_level == "#" {
            return true;
        }
        match topic_levels.next() {
            Some(level) if filter_level == "+" || filter_level == level => {}
            _ => return false,
        }
    }
    topic_levels.next().is_none()
}

/// Whether `topic` matches any of `filters`
pub fn matches_any<S: AsRef<str>>(topic: &str, filters: &[S]) -> bool {
    filters
        .iter()
        .any(|filter| topic_matches_filter(topic, filter.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_topic_name() {
        assert!(validate_topic_name("iot/p/d/properties/write").is_ok());
        assert!(validate_topic_name("/p/d/state").is_ok());

        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("meter/+/power").is_err());
        assert!(validate_topic_name("meter/#").is_err());
    }

    #[test]
    fn test_validate_topic_filter() {
        assert!(validate_topic_filter("tele/meter/SENSOR").is_ok());
        assert!(validate_topic_filter("+").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("/p/d/#").is_ok());
        assert!(validate_topic_filter("meter/+/power").is_ok());

        assert!(validate_topic_filter("").is_err());
        assert!(validate_topic_filter("meter+").is_err());
        assert!(validate_topic_filter("meter#").is_err());
        assert!(validate_topic_filter("meter/#/power").is_err());
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches_filter("meter/power", "meter/power"));
        assert!(!topic_matches_filter("meter", "meter/power"));
        assert!(!topic_matches_filter("meter/power", "meter"));

        assert!(topic_matches_filter("meter/power", "meter/+"));
        assert!(topic_matches_filter("a/b/c", "+/b/+"));
        assert!(!topic_matches_filter("meter/power/extra", "meter/+"));

        assert!(topic_matches_filter("meter", "meter/#"));
        assert!(topic_matches_filter("/p/d/state/battery", "/p/d/#"));
        assert!(!topic_matches_filter("/p/x/state", "/p/d/#"));

        assert!(!topic_matches_filter("$SYS/uptime", "#"));
        assert!(topic_matches_filter("$SYS/uptime", "$SYS/+"));
    }

    #[test]
    fn test_matches_any() {
        let filters = vec!["meter/power".to_string(), "inverter/+/grid".to_string()];
        assert!(matches_any("inverter/1/grid", &filters));
        assert!(!matches_any("inverter/1/pv", &filters));
        assert!(!matches_any::<String>("meter/power", &[]));
    }
}
