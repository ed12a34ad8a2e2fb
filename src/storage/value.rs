//! Record representation and field value coercion
//!
//! Values are carried as `serde_json::Value` in memory. The shared backend
//! stores them inside a JSON document; the dedicated backend maps them onto
//! typed columns. Coercion here keeps both representations comparable.

use rusqlite::types::{Value as SqlValue, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::schema::{EntityDefinition, FieldDefinition, FieldType};
use crate::{Error, Result};

/// Field values keyed by field name
pub type Document = Map<String, Value>;

/// A stored record: system columns plus every declared field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub fields: Document,
    pub created_at: String,
    pub updated_at: String,
    pub created_by: Option<String>,
}

impl Record {
    /// Get a field value (`None` if the field is not declared)
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Get a string field value
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    /// Flatten into a single JSON object with system columns included
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        out.insert("id".into(), Value::from(self.id.clone()));
        for (k, v) in &self.fields {
            out.insert(k.clone(), v.clone());
        }
        out.insert("created_at".into(), Value::from(self.created_at.clone()));
        out.insert("updated_at".into(), Value::from(self.updated_at.clone()));
        out.insert(
            "created_by".into(),
            self.created_by.clone().map(Value::from).unwrap_or(Value::Null),
        );
        Value::Object(out)
    }
}

/// Build a complete field map: every declared field present, `Null` when
/// absent, undeclared keys dropped.
pub(crate) fn complete_fields(entity: &EntityDefinition, mut raw: Document) -> Document {
    let mut out = Map::new();
    for field in &entity.fields {
        let value = raw.remove(&field.name).unwrap_or(Value::Null);
        out.insert(field.name.clone(), value);
    }
    out
}

/// Coerce a caller-supplied value to the field's declared type
pub(crate) fn coerce(entity: &str, field: &FieldDefinition, value: Value) -> Result<Value> {
    let mismatch = |v: &Value| {
        Error::validation(
            entity,
            format!(
                "field '{}' expects {}, got {}",
                field.name,
                field.field_type,
                json_kind(v)
            ),
        )
    };

    if value.is_null() {
        return Ok(Value::Null);
    }

    match field.field_type {
        FieldType::String | FieldType::Text => match value {
            Value::String(_) => Ok(value),
            other => Err(mismatch(&other)),
        },
        FieldType::Int => match &value {
            Value::Number(n) if n.is_i64() || n.is_u64() => {
                n.as_i64().map(Value::from).ok_or_else(|| mismatch(&value))
            }
            Value::Number(n) => match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(Value::from(f as i64)),
                _ => Err(mismatch(&value)),
            },
            _ => Err(mismatch(&value)),
        },
        FieldType::Float => match &value {
            Value::Number(n) => n
                .as_f64()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| mismatch(&value)),
            _ => Err(mismatch(&value)),
        },
        FieldType::Bool => match &value {
            Value::Bool(_) => Ok(value),
            Value::Number(n) if n.as_i64() == Some(0) => Ok(Value::Bool(false)),
            Value::Number(n) if n.as_i64() == Some(1) => Ok(Value::Bool(true)),
            _ => Err(mismatch(&value)),
        },
        FieldType::Datetime => match &value {
            Value::String(s) => {
                let valid = chrono::DateTime::parse_from_rfc3339(s).is_ok()
                    || chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
                    || chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok();
                if valid {
                    Ok(value)
                } else {
                    Err(Error::validation(
                        entity,
                        format!("field '{}' expects an ISO 8601 datetime, got '{}'", field.name, s),
                    ))
                }
            }
            _ => Err(mismatch(&value)),
        },
        FieldType::Uuid => match &value {
            Value::String(s) => uuid::Uuid::parse_str(s)
                .map(|u| Value::from(u.to_string()))
                .map_err(|_| {
                    Error::validation(
                        entity,
                        format!("field '{}' expects a uuid, got '{}'", field.name, s),
                    )
                }),
            _ => Err(mismatch(&value)),
        },
        FieldType::Json => Ok(value),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Map a coerced value onto a SQL parameter for a column of `field_type`
pub(crate) fn to_sql(value: &Value, field_type: FieldType) -> Result<SqlValue> {
    if field_type == FieldType::Json {
        return Ok(match value {
            Value::Null => SqlValue::Null,
            other => SqlValue::Text(serde_json::to_string(other)?),
        });
    }
    Ok(scalar_to_sql(value))
}

/// Map a scalar JSON value onto a SQL parameter, as `json_extract` returns it
pub(crate) fn scalar_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Read a typed column back into a JSON value
pub(crate) fn from_sql(value: ValueRef<'_>, field_type: FieldType) -> Result<Value> {
    let out = match (value, field_type) {
        (ValueRef::Null, _) => Value::Null,
        (ValueRef::Integer(i), FieldType::Bool) => Value::Bool(i != 0),
        (ValueRef::Integer(i), FieldType::Float) => {
            Number::from_f64(i as f64).map(Value::Number).unwrap_or(Value::Null)
        }
        (ValueRef::Integer(i), _) => Value::from(i),
        (ValueRef::Real(f), _) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        (ValueRef::Text(t), FieldType::Json) => serde_json::from_slice(t)?,
        (ValueRef::Text(t), _) => Value::from(String::from_utf8_lossy(t).into_owned()),
        (ValueRef::Blob(b), _) => Value::from(String::from_utf8_lossy(b).into_owned()),
    };
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(name: &str, ty: FieldType) -> FieldDefinition {
        FieldDefinition {
            id: "f".into(),
            name: name.into(),
            field_type: ty,
            required: false,
            unique: false,
            indexed: false,
            default: None,
            description: None,
            position: 0,
        }
    }

    #[test]
    fn test_coerce_numbers() {
        let f = field("total", FieldType::Float);
        assert_eq!(coerce("Order", &f, json!(100)).unwrap(), json!(100.0));

        let i = field("qty", FieldType::Int);
        assert_eq!(coerce("Order", &i, json!(3.0)).unwrap(), json!(3));
        assert!(coerce("Order", &i, json!(3.5)).is_err());
        assert!(coerce("Order", &i, json!("3")).is_err());
    }

    #[test]
    fn test_coerce_bool_and_null() {
        let b = field("active", FieldType::Bool);
        assert_eq!(coerce("User", &b, json!(1)).unwrap(), json!(true));
        assert_eq!(coerce("User", &b, Value::Null).unwrap(), Value::Null);
        assert!(coerce("User", &b, json!("yes")).is_err());
    }

    #[test]
    fn test_coerce_datetime_and_uuid() {
        let d = field("placed_at", FieldType::Datetime);
        assert!(coerce("Order", &d, json!("2024-01-15T10:30:00Z")).is_ok());
        assert!(coerce("Order", &d, json!("2024-01-15")).is_ok());
        assert!(coerce("Order", &d, json!("yesterday")).is_err());

        let u = field("ref", FieldType::Uuid);
        let id = uuid::Uuid::new_v4().to_string();
        assert_eq!(coerce("Order", &u, json!(id.to_uppercase())).unwrap(), json!(id));
        assert!(coerce("Order", &u, json!("not-a-uuid")).is_err());
    }

    #[test]
    fn test_sql_mapping() {
        assert_eq!(scalar_to_sql(&json!(true)), SqlValue::Integer(1));
        assert_eq!(scalar_to_sql(&json!(2.5)), SqlValue::Real(2.5));
        assert_eq!(
            to_sql(&json!({"a": 1}), FieldType::Json).unwrap(),
            SqlValue::Text("{\"a\":1}".into())
        );
        assert_eq!(
            from_sql(ValueRef::Integer(0), FieldType::Bool).unwrap(),
            json!(false)
        );
        assert_eq!(
            from_sql(ValueRef::Integer(7), FieldType::Float).unwrap(),
            json!(7.0)
        );
        assert_eq!(
            from_sql(ValueRef::Text(b"[1,2]"), FieldType::Json).unwrap(),
            json!([1, 2])
        );
    }

    #[test]
    fn test_record_to_json_flattens() {
        let mut fields = Document::new();
        fields.insert("name".into(), json!("Acme"));
        let record = Record {
            id: "r1".into(),
            fields,
            created_at: "t0".into(),
            updated_at: "t1".into(),
            created_by: None,
        };
        let flat = record.to_json();
        assert_eq!(flat["id"], "r1");
        assert_eq!(flat["name"], "Acme");
        assert_eq!(flat["created_by"], Value::Null);
    }
}
