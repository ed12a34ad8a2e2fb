//! Identifier validation and physical table naming

use regex::Regex;
use std::sync::OnceLock;

use crate::{Error, Result};

/// Columns every record carries regardless of storage mode
pub const SYSTEM_FIELDS: &[&str] = &["id", "created_at", "updated_at", "created_by"];

const MAX_IDENTIFIER_LEN: usize = 63;

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("static regex"))
}

/// Validate an entity, field or relationship name.
///
/// Names end up in SQL identifiers and JSON paths, so only ASCII letters,
/// digits and underscores are allowed.
pub fn validate_identifier(kind: &'static str, name: &str) -> Result<()> {
    let fail = |reason: &str| Error::InvalidIdentifier {
        kind,
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(fail("must not be empty"));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(fail("must be at most 63 characters"));
    }
    if !identifier_pattern().is_match(name) {
        return Err(fail(
            "must start with a letter and contain only letters, digits and underscores",
        ));
    }
    if name.to_lowercase().starts_with("kdb_") {
        return Err(fail("the kdb_ prefix is reserved"));
    }
    Ok(())
}

/// Validate a user field name (system columns are reserved)
pub fn validate_field_name(name: &str) -> Result<()> {
    validate_identifier("field", name)?;
    if SYSTEM_FIELDS.contains(&name) {
        return Err(Error::InvalidIdentifier {
            kind: "field",
            name: name.to_string(),
            reason: "is a reserved system field".to_string(),
        });
    }
    Ok(())
}

/// Convert `PascalCase` or `camelCase` to `snake_case`
pub fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let chars: Vec<char> = name.chars().collect();
    for (i, c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let next = chars.get(i + 1);
            let boundary = match prev {
                Some(p) if p.is_ascii_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_ascii_uppercase() => next.is_some_and(|n| n.is_ascii_lowercase()),
                _ => false,
            };
            if boundary && !out.ends_with('_') {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(*c);
        }
    }
    out
}

/// Table name for an entity's dedicated storage
pub fn dedicated_table_name(entity: &str) -> String {
    format!("ent_{}", snake_case(entity))
}

/// Table name for a many-to-many relationship's pairs
pub fn junction_table_name(source_entity: &str, relationship: &str) -> String {
    format!("jt_{}_{}", snake_case(source_entity), snake_case(relationship))
}

/// Source and target column names of a junction table
pub fn junction_columns(source_entity: &str, target_entity: &str) -> (String, String) {
    let source = snake_case(source_entity);
    let target = snake_case(target_entity);
    if source == target {
        (format!("{}_source_id", source), format!("{}_target_id", target))
    } else {
        (format!("{}_id", source), format!("{}_id", target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snake_case() {
        assert_eq!(snake_case("Customer"), "customer");
        assert_eq!(snake_case("OrderLine"), "order_line");
        assert_eq!(snake_case("HTTPRequest"), "http_request");
        assert_eq!(snake_case("already_snake"), "already_snake");
        assert_eq!(snake_case("camelCase2Go"), "camel_case2_go");
    }

    #[test]
    fn test_identifiers() {
        assert!(validate_identifier("entity", "Customer").is_ok());
        assert!(validate_identifier("entity", "order_line2").is_ok());
        assert!(validate_identifier("entity", "2fast").is_err());
        assert!(validate_identifier("entity", "drop table;").is_err());
        assert!(validate_identifier("entity", "").is_err());
        assert!(validate_identifier("entity", "kdb_records").is_err());
        assert!(validate_identifier("entity", &"a".repeat(64)).is_err());
    }

    #[test]
    fn test_reserved_fields() {
        assert!(validate_field_name("id").is_err());
        assert!(validate_field_name("updated_at").is_err());
        assert!(validate_field_name("customer_id").is_ok());
    }

    #[test]
    fn test_table_names() {
        assert_eq!(dedicated_table_name("OrderLine"), "ent_order_line");
        assert_eq!(junction_table_name("Student", "courses"), "jt_student_courses");
        assert_eq!(
            junction_columns("Student", "Course"),
            ("student_id".to_string(), "course_id".to_string())
        );
        assert_eq!(
            junction_columns("Person", "Person"),
            ("person_source_id".to_string(), "person_target_id".to_string())
        );
    }
}
