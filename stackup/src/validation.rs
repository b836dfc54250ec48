//! Validation predicates for the nutype-based vocabulary types.

/// Container and network names: `[a-zA-Z0-9][a-zA-Z0-9_.-]*`, the rule the
/// container engine applies to names it resolves through its embedded DNS.
pub(crate) fn is_container_name(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next().is_some_and(|first| first.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Lowercase SQL identifier starting with a letter.
pub(crate) fn is_sql_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next().is_some_and(|first| first.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Non-empty and made only of RFC 3986 unreserved characters.
pub(crate) fn is_uri_safe(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names_follow_engine_rules() {
        assert!(is_container_name("rabbitmq"));
        assert!(is_container_name("article-service.v2_1"));
        assert!(!is_container_name("-leading-dash"));
        assert!(!is_container_name("has space"));
        assert!(!is_container_name(""));
    }

    #[test]
    fn sql_identifiers_are_lowercase_and_start_with_a_letter() {
        assert!(is_sql_identifier("orders"));
        assert!(is_sql_identifier("tenant_42"));
        assert!(!is_sql_identifier("_orders"));
        assert!(!is_sql_identifier("Orders"));
        assert!(!is_sql_identifier("orders-db"));
    }

    #[test]
    fn uri_safe_strings_exclude_delimiters() {
        assert!(is_uri_safe("testpassword"));
        assert!(is_uri_safe("a.b-c_d~e"));
        assert!(!is_uri_safe(""));
        assert!(!is_uri_safe("user@host"));
        assert!(!is_uri_safe("a/b"));
    }
}
