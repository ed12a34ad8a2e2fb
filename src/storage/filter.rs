//! Query filters shared by both storage backends

use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use super::value::{coerce, scalar_to_sql, to_sql};
use crate::schema::{EntityDefinition, FieldType, SYSTEM_FIELDS};
use crate::{Error, Result};

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Substring match on text
    Contains,
    /// Value must be an array
    In,
    /// Value is a bool: `true` matches null, `false` matches non-null
    IsNull,
}

impl FilterOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Ne => "ne",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::Contains => "contains",
            FilterOp::In => "in",
            FilterOp::IsNull => "is_null",
        }
    }
}

impl FromStr for FilterOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "eq" | "=" | "==" => Ok(FilterOp::Eq),
            "ne" | "!=" | "<>" => Ok(FilterOp::Ne),
            "gt" | ">" => Ok(FilterOp::Gt),
            "gte" | ">=" => Ok(FilterOp::Gte),
            "lt" | "<" => Ok(FilterOp::Lt),
            "lte" | "<=" => Ok(FilterOp::Lte),
            "contains" | "like" => Ok(FilterOp::Contains),
            "in" => Ok(FilterOp::In),
            "is_null" | "null" => Ok(FilterOp::IsNull),
            _ => Err(Error::validation("filter", format!("unknown filter operator '{}'", s))),
        }
    }
}

/// One `field <op> value` predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

/// Conjunction of conditions with optional ordering and paging
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub conditions: Vec<Condition>,
    pub order_by: Option<String>,
    #[serde(default)]
    pub descending: bool,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match records whose `field` equals `value`
    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.where_op(field, FilterOp::Eq, value)
    }

    pub fn where_op(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(field.into());
        self.descending = false;
        self
    }

    pub fn order_by_desc(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(field.into());
        self.descending = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

/// Compiled SQL fragment and its positional parameters
#[derive(Debug, Default)]
pub(crate) struct SqlClause {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// Compile the filter into `AND`-joined predicates plus `ORDER BY` and
/// paging. `column` renders the SQL expression for a field name.
pub(crate) fn compile(
    entity: &EntityDefinition,
    filter: &Filter,
    column: &dyn Fn(&str) -> String,
) -> Result<(SqlClause, String)> {
    let mut clause = SqlClause::default();
    let mut predicates = Vec::with_capacity(filter.conditions.len());

    for cond in &filter.conditions {
        let field_type = field_type_of(entity, &cond.field)?;
        let col = column(&cond.field);
        let bind = |v: &Value| -> Result<SqlValue> {
            match entity.field(&cond.field) {
                Some(def) => {
                    let coerced = coerce(&entity.name, def, v.clone())?;
                    to_sql(&coerced, def.field_type)
                }
                None => Ok(scalar_to_sql(v)),
            }
        };

        let predicate = match cond.op {
            FilterOp::IsNull => {
                let want_null = cond.value.as_bool().unwrap_or(true);
                if want_null {
                    format!("{} IS NULL", col)
                } else {
                    format!("{} IS NOT NULL", col)
                }
            }
            FilterOp::Eq | FilterOp::Ne if cond.value.is_null() => {
                if cond.op == FilterOp::Eq {
                    format!("{} IS NULL", col)
                } else {
                    format!("{} IS NOT NULL", col)
                }
            }
            FilterOp::In => {
                let items = cond.value.as_array().ok_or_else(|| {
                    Error::validation(
                        &entity.name,
                        format!("'in' filter on '{}' needs an array value", cond.field),
                    )
                })?;
                if items.is_empty() {
                    "0".to_string()
                } else {
                    for item in items {
                        clause.params.push(bind(item)?);
                    }
                    format!("{} IN ({})", col, super::sqlite::placeholders(items.len()))
                }
            }
            FilterOp::Contains => {
                let needle = cond.value.as_str().ok_or_else(|| {
                    Error::validation(
                        &entity.name,
                        format!("'contains' filter on '{}' needs a string value", cond.field),
                    )
                })?;
                clause.params.push(SqlValue::Text(format!("%{}%", escape_like(needle))));
                format!("{} LIKE ? ESCAPE '\\'", col)
            }
            op => {
                if field_type == FieldType::Json {
                    return Err(Error::validation(
                        &entity.name,
                        format!("json field '{}' only supports is_null filters", cond.field),
                    ));
                }
                clause.params.push(bind(&cond.value)?);
                let sym = match op {
                    FilterOp::Eq => "=",
                    FilterOp::Ne => "!=",
                    FilterOp::Gt => ">",
                    FilterOp::Gte => ">=",
                    FilterOp::Lt => "<",
                    _ => "<=",
                };
                format!("{} {} ?", col, sym)
            }
        };
        predicates.push(predicate);
    }

    clause.sql = predicates.join(" AND ");

    let mut tail = String::new();
    match &filter.order_by {
        Some(field) => {
            field_type_of(entity, field)?;
            let dir = if filter.descending { "DESC" } else { "ASC" };
            tail.push_str(&format!(" ORDER BY {} {}, {} ASC", column(field), dir, column("id")));
        }
        None => tail.push_str(&format!(" ORDER BY {} ASC", column("id"))),
    }
    match (filter.limit, filter.offset) {
        (Some(limit), Some(offset)) => tail.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset)),
        (Some(limit), None) => tail.push_str(&format!(" LIMIT {}", limit)),
        (None, Some(offset)) => tail.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
        (None, None) => {}
    }

    Ok((clause, tail))
}

fn field_type_of(entity: &EntityDefinition, field: &str) -> Result<FieldType> {
    if SYSTEM_FIELDS.contains(&field) {
        return Ok(FieldType::String);
    }
    entity.require_field(field).map(|f| f.field_type)
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDefinition, StorageMode};
    use serde_json::json;

    fn entity() -> EntityDefinition {
        let field = |name: &str, ty: FieldType| FieldDefinition {
            id: name.into(),
            name: name.into(),
            field_type: ty,
            required: false,
            unique: false,
            indexed: false,
            default: None,
            description: None,
            position: 0,
        };
        EntityDefinition {
            id: "e".into(),
            name: "Order".into(),
            storage_mode: StorageMode::Dedicated,
            dedicated_table_name: Some("ent_order".into()),
            description: None,
            fields: vec![
                field("status", FieldType::String),
                field("total", FieldType::Float),
                field("meta", FieldType::Json),
            ],
            created_at: "t".into(),
            created_by: None,
        }
    }

    fn plain(name: &str) -> String {
        format!("\"{}\"", name)
    }

    #[test]
    fn test_compile_conditions() {
        let filter = Filter::new()
            .eq("status", "open")
            .where_op("total", FilterOp::Gt, 10)
            .where_op("status", FilterOp::In, json!(["a", "b"]));
        let (clause, tail) = compile(&entity(), &filter, &plain).unwrap();
        assert_eq!(
            clause.sql,
            "\"status\" = ? AND \"total\" > ? AND \"status\" IN (?, ?)"
        );
        assert_eq!(clause.params.len(), 4);
        assert_eq!(clause.params[1], SqlValue::Real(10.0));
        assert_eq!(tail, " ORDER BY \"id\" ASC");
    }

    #[test]
    fn test_null_and_paging() {
        let filter = Filter::new()
            .eq("status", Value::Null)
            .order_by_desc("total")
            .limit(5)
            .offset(10);
        let (clause, tail) = compile(&entity(), &filter, &plain).unwrap();
        assert_eq!(clause.sql, "\"status\" IS NULL");
        assert!(clause.params.is_empty());
        assert_eq!(tail, " ORDER BY \"total\" DESC, \"id\" ASC LIMIT 5 OFFSET 10");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let filter = Filter::new().eq("colour", "red");
        let err = compile(&entity(), &filter, &plain).unwrap_err();
        assert!(matches!(err, Error::FieldNotFound { .. }));
    }

    #[test]
    fn test_json_comparison_rejected() {
        let filter = Filter::new().eq("meta", json!({"a": 1}));
        assert!(compile(&entity(), &filter, &plain).is_err());
    }

    #[test]
    fn test_contains_escapes_wildcards() {
        let filter = Filter::new().where_op("status", FilterOp::Contains, "50%");
        let (clause, _) = compile(&entity(), &filter, &plain).unwrap();
        assert_eq!(clause.params[0], SqlValue::Text("%50\\%%".into()));
    }
}
