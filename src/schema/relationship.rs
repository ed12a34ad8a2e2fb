//! Relationship definitions between entities

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::{Error, Result};

/// Cardinality of a relationship, read from the source entity's side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    /// Source holds a foreign key to one target
    ManyToOne,
    /// Each target holds a foreign key back to one source
    OneToMany,
    /// Pairs are stored in a junction table
    ManyToMany,
    /// Source holds a foreign key to at most one target
    OneToOne,
}

impl RelationshipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::ManyToOne => "many_to_one",
            RelationshipType::OneToMany => "one_to_many",
            RelationshipType::ManyToMany => "many_to_many",
            RelationshipType::OneToOne => "one_to_one",
        }
    }

    pub fn all() -> &'static [RelationshipType] {
        &[
            RelationshipType::ManyToOne,
            RelationshipType::OneToMany,
            RelationshipType::ManyToMany,
            RelationshipType::OneToOne,
        ]
    }

    /// Whether a foreign key field exists on one of the two entities
    pub fn uses_foreign_key(&self) -> bool {
        !matches!(self, RelationshipType::ManyToMany)
    }

    /// Whether the foreign key lives on the source entity (otherwise the target)
    pub fn foreign_key_on_source(&self) -> bool {
        matches!(self, RelationshipType::ManyToOne | RelationshipType::OneToOne)
    }
}

impl FromStr for RelationshipType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "many_to_one" => Ok(RelationshipType::ManyToOne),
            "one_to_many" => Ok(RelationshipType::OneToMany),
            "many_to_many" => Ok(RelationshipType::ManyToMany),
            "one_to_one" => Ok(RelationshipType::OneToOne),
            _ => Err(Error::InvalidRelationshipType(s.to_string())),
        }
    }
}

impl std::fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What happens to dependents when a referenced record is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnDeleteAction {
    /// Delete dependents recursively
    Cascade,
    /// Clear the dependents' foreign key
    #[default]
    SetNull,
    /// Refuse the delete while dependents exist
    Restrict,
    /// Take no engine action
    NoAction,
}

impl OnDeleteAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnDeleteAction::Cascade => "CASCADE",
            OnDeleteAction::SetNull => "SET_NULL",
            OnDeleteAction::Restrict => "RESTRICT",
            OnDeleteAction::NoAction => "NO_ACTION",
        }
    }

    /// Clause used in native `FOREIGN KEY ... ON DELETE` constraints
    pub fn sql_clause(&self) -> &'static str {
        match self {
            OnDeleteAction::Cascade => "CASCADE",
            OnDeleteAction::SetNull => "SET NULL",
            OnDeleteAction::Restrict => "RESTRICT",
            OnDeleteAction::NoAction => "NO ACTION",
        }
    }
}

impl FromStr for OnDeleteAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().replace([' ', '-'], "_").as_str() {
            "CASCADE" => Ok(OnDeleteAction::Cascade),
            "SET_NULL" => Ok(OnDeleteAction::SetNull),
            "RESTRICT" => Ok(OnDeleteAction::Restrict),
            "NO_ACTION" => Ok(OnDeleteAction::NoAction),
            _ => Err(Error::InvalidOnDeleteAction(s.to_string())),
        }
    }
}

impl std::fmt::Display for OnDeleteAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Requested shape of a new relationship
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipSpec {
    pub name: String,
    pub source_entity: String,
    pub target_entity: String,
    pub relationship_type: RelationshipType,
    /// Defaults to `{name}_id` on the source, or `{source}_id` on the
    /// target for one-to-many
    pub foreign_key_field: Option<String>,
    pub inverse_name: Option<String>,
    pub on_delete: OnDeleteAction,
    /// Recorded but not enforced; ids are immutable
    pub on_update: OnDeleteAction,
    pub description: Option<String>,
}

impl RelationshipSpec {
    pub fn new(
        name: impl Into<String>,
        source_entity: impl Into<String>,
        target_entity: impl Into<String>,
        relationship_type: RelationshipType,
    ) -> Self {
        Self {
            name: name.into(),
            source_entity: source_entity.into(),
            target_entity: target_entity.into(),
            relationship_type,
            foreign_key_field: None,
            inverse_name: None,
            on_delete: OnDeleteAction::SetNull,
            on_update: OnDeleteAction::Cascade,
            description: None,
        }
    }

    pub fn many_to_one(
        name: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self::new(name, source, target, RelationshipType::ManyToOne)
    }

    pub fn many_to_many(
        name: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self::new(name, source, target, RelationshipType::ManyToMany)
    }

    pub fn on_delete(mut self, action: OnDeleteAction) -> Self {
        self.on_delete = action;
        self
    }

    pub fn foreign_key(mut self, field: impl Into<String>) -> Self {
        self.foreign_key_field = Some(field.into());
        self
    }

    pub fn inverse(mut self, name: impl Into<String>) -> Self {
        self.inverse_name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Physical table holding many-to-many pairs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JunctionTable {
    pub table_name: String,
    pub source_fk_column: String,
    pub target_fk_column: String,
}

/// A persisted relationship definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipDefinition {
    pub id: String,
    pub name: String,
    pub source_entity: String,
    pub target_entity: String,
    pub relationship_type: RelationshipType,
    pub foreign_key_field: Option<String>,
    pub inverse_name: Option<String>,
    pub on_delete: OnDeleteAction,
    pub on_update: OnDeleteAction,
    pub description: Option<String>,
    pub is_active: bool,
    /// Present iff the relationship is many-to-many
    pub junction: Option<JunctionTable>,
}

impl RelationshipDefinition {
    /// Entity that physically holds the foreign key field
    pub fn foreign_key_holder(&self) -> Option<&str> {
        match self.relationship_type {
            RelationshipType::ManyToOne | RelationshipType::OneToOne => Some(&self.source_entity),
            RelationshipType::OneToMany => Some(&self.target_entity),
            RelationshipType::ManyToMany => None,
        }
    }

    /// Entity whose rows the foreign key points at
    pub fn referenced_entity(&self) -> Option<&str> {
        match self.relationship_type {
            RelationshipType::ManyToOne | RelationshipType::OneToOne => Some(&self.target_entity),
            RelationshipType::OneToMany => Some(&self.source_entity),
            RelationshipType::ManyToMany => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relationship_type_parse() {
        assert_eq!(
            "many-to-one".parse::<RelationshipType>().unwrap(),
            RelationshipType::ManyToOne
        );
        assert!(matches!(
            "one_to_few".parse::<RelationshipType>(),
            Err(Error::InvalidRelationshipType(_))
        ));
    }

    #[test]
    fn test_on_delete_parse() {
        assert_eq!("set null".parse::<OnDeleteAction>().unwrap(), OnDeleteAction::SetNull);
        assert_eq!("cascade".parse::<OnDeleteAction>().unwrap(), OnDeleteAction::Cascade);
        assert!(matches!(
            "DESTROY".parse::<OnDeleteAction>(),
            Err(Error::InvalidOnDeleteAction(_))
        ));
        assert_eq!(OnDeleteAction::default(), OnDeleteAction::SetNull);
        assert_eq!(OnDeleteAction::NoAction.sql_clause(), "NO ACTION");
    }

    #[test]
    fn test_foreign_key_placement() {
        assert!(RelationshipType::ManyToOne.foreign_key_on_source());
        assert!(!RelationshipType::OneToMany.foreign_key_on_source());
        assert!(!RelationshipType::ManyToMany.uses_foreign_key());
    }

    #[test]
    fn test_spec_defaults() {
        let spec = RelationshipSpec::many_to_one("customer", "Order", "Customer");
        assert_eq!(spec.on_delete, OnDeleteAction::SetNull);
        assert_eq!(spec.on_update, OnDeleteAction::Cascade);
        assert!(spec.foreign_key_field.is_none());
    }
}
