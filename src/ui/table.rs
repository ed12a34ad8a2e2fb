use owo_colors::OwoColorize;
use tabled::{settings::Style, Table, Tabled};

use crate::metrics::MaterializationSuggestion;
use crate::schema::{EntityDefinition, RelationshipDefinition};
use crate::storage::Record;
use crate::ui::theme;

#[derive(Tabled)]
pub struct TableRow {
    #[tabled(rename = "Metric")]
    pub metric: String,
    #[tabled(rename = "Value")]
    pub value: String,
}

pub struct TableBuilder {
    rows: Vec<TableRow>,
}

impl Default for TableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TableBuilder {
    pub fn new() -> Self {
        Self { rows: Vec::new() }
    }

    pub fn add_row(&mut self, label: &str, value: &str) {
        self.rows.push(TableRow {
            metric: label.to_string(),
            value: value.to_string(),
        });
    }

    pub fn build(&self) -> String {
        if self.rows.is_empty() {
            return String::new();
        }

        Table::new(&self.rows).with(Style::rounded()).to_string()
    }
}

pub fn stats_table(stats: &[(&str, &str)]) -> String {
    let mut builder = TableBuilder::new();
    for (label, value) in stats {
        builder.add_row(label, value);
    }
    builder.build()
}

#[derive(Tabled)]
struct FieldRow {
    #[tabled(rename = "Field")]
    name: String,
    #[tabled(rename = "Type")]
    field_type: String,
    #[tabled(rename = "Flags")]
    flags: String,
    #[tabled(rename = "Default")]
    default: String,
}

pub fn fields_table(entity: &EntityDefinition) -> String {
    let rows: Vec<FieldRow> = entity
        .fields
        .iter()
        .map(|f| {
            let mut flags = Vec::new();
            if f.required {
                flags.push("required");
            }
            if f.unique {
                flags.push("unique");
            }
            if f.indexed {
                flags.push("indexed");
            }
            FieldRow {
                name: f.name.clone(),
                field_type: f.field_type.to_string(),
                flags: flags.join(", "),
                default: f.default.as_ref().map(|v| v.to_string()).unwrap_or_default(),
            }
        })
        .collect();
    if rows.is_empty() {
        return String::new();
    }
    Table::new(rows).with(Style::rounded()).to_string()
}

#[derive(Tabled)]
struct EntityRow {
    #[tabled(rename = "Entity")]
    name: String,
    #[tabled(rename = "Storage")]
    mode: String,
    #[tabled(rename = "Table")]
    table: String,
    #[tabled(rename = "Fields")]
    fields: usize,
}

pub fn entities_table(entities: &[EntityDefinition]) -> String {
    let rows: Vec<EntityRow> = entities
        .iter()
        .map(|e| EntityRow {
            name: e.name.clone(),
            mode: e.storage_mode.style(theme().mode(e.storage_mode)).to_string(),
            table: e.dedicated_table_name.clone().unwrap_or_else(|| "-".to_string()),
            fields: e.fields.len(),
        })
        .collect();
    Table::new(rows).with(Style::rounded()).to_string()
}

#[derive(Tabled)]
struct RelationshipRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Target")]
    target: String,
    #[tabled(rename = "Type")]
    relationship_type: String,
    #[tabled(rename = "FK / Junction")]
    link: String,
    #[tabled(rename = "On Delete")]
    on_delete: String,
}

pub fn relationships_table(relationships: &[RelationshipDefinition]) -> String {
    let rows: Vec<RelationshipRow> = relationships
        .iter()
        .map(|r| RelationshipRow {
            name: r.name.clone(),
            source: r.source_entity.clone(),
            target: r.target_entity.clone(),
            relationship_type: r.relationship_type.to_string(),
            link: r
                .foreign_key_field
                .clone()
                .or_else(|| r.junction.as_ref().map(|j| j.table_name.clone()))
                .unwrap_or_default(),
            on_delete: r.on_delete.to_string(),
        })
        .collect();
    Table::new(rows).with(Style::rounded()).to_string()
}

#[derive(Tabled)]
struct SuggestionRow {
    #[tabled(rename = "Entity")]
    entity: String,
    #[tabled(rename = "Priority")]
    priority: String,
    #[tabled(rename = "Reason")]
    reason: String,
    #[tabled(rename = "Detail")]
    message: String,
    #[tabled(rename = "Action")]
    action: String,
}

pub fn suggestions_table(suggestions: &[MaterializationSuggestion]) -> String {
    let rows: Vec<SuggestionRow> = suggestions
        .iter()
        .map(|s| SuggestionRow {
            entity: s.entity_name.clone(),
            priority: s.priority.style(theme().priority(s.priority)).to_string(),
            reason: s.reason.to_string(),
            message: s.message.clone(),
            action: s.action.to_string(),
        })
        .collect();
    Table::new(rows).with(Style::rounded()).to_string()
}

/// Records as rows, one column per system and declared field
pub fn records_table(entity: &EntityDefinition, records: &[Record]) -> String {
    let mut header = vec!["id".to_string()];
    header.extend(entity.field_names());

    let mut builder = tabled::builder::Builder::default();
    builder.push_record(header.clone());
    for record in records {
        let row = header.iter().map(|column| {
            if column == "id" {
                return record.id.clone();
            }
            match record.get(column) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(serde_json::Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            }
        });
        builder.push_record(row);
    }
    builder.build().with(Style::rounded()).to_string()
}
