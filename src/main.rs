//! Hybridb CLI - schema, records and storage lifecycle for a hybrid store

mod commands;

use clap::{Args, Parser, Subcommand};
use hybridb::config;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "hybridb")]
#[command(version)]
#[command(about = "Hybrid shared/dedicated record store with relationship enforcement")]
#[command(long_about = r#"
Hybridb keeps every entity in one shared document table until it earns its
own typed table, enabling:
  • Schema changes without migrations
  • Cascade / set-null / restrict deletes across storage modes
  • Batched materialize and dematerialize with progress
  • Query metrics and materialization suggestions

Example usage:
  hybridb init
  hybridb entity define Customer --field name:string:required --field email:string:unique
  hybridb insert Customer --data '{"name": "Ada"}'
  hybridb materialize Customer --batch-size 500
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ./hybridb.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database file, overriding the config
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    /// Actor recorded in changelog and record metadata
    #[arg(long, global = true)]
    actor: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file and create the database
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Define, inspect and disable entities
    #[command(subcommand)]
    Entity(EntityCommand),

    /// Add fields to entities
    #[command(subcommand)]
    Field(FieldCommand),

    /// Define and remove relationships
    #[command(subcommand)]
    Rel(RelCommand),

    /// Insert a record
    Insert {
        entity: String,
        /// Field values as a JSON object
        #[arg(long)]
        data: String,
    },

    /// Fetch one record by id
    Get { entity: String, id: String },

    /// Query records
    Find {
        entity: String,
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Count records
    Count {
        entity: String,
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Patch a record
    Update {
        entity: String,
        id: String,
        /// Changed field values as a JSON object
        #[arg(long)]
        data: String,
    },

    /// Delete a record, applying on_delete actions
    Delete {
        entity: String,
        id: String,
        /// Apply no on_delete action; any dependent blocks the delete
        #[arg(long)]
        no_cascade: bool,
        /// Detach blocking dependents by clearing their foreign key
        #[arg(long)]
        force: bool,
    },

    /// Link a record to targets of a many-to-many relationship
    Link {
        entity: String,
        relationship: String,
        source_id: String,
        #[arg(required = true)]
        target_ids: Vec<String>,
    },

    /// Remove many-to-many links
    Unlink {
        entity: String,
        relationship: String,
        source_id: String,
        #[arg(required = true)]
        target_ids: Vec<String>,
    },

    /// Show records linked through a many-to-many relationship
    Linked {
        entity: String,
        relationship: String,
        source_id: String,
    },

    /// Move an entity into its own table
    Materialize {
        entity: String,
        #[arg(short, long)]
        batch_size: Option<usize>,
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Move an entity back into shared storage
    Dematerialize {
        entity: String,
        #[arg(short, long)]
        batch_size: Option<usize>,
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Inspect, resume or abort migration jobs
    #[command(subcommand)]
    Migration(MigrationCommand),

    /// Show database or entity statistics
    Stats { entity: Option<String> },

    /// Show materialization suggestions
    Suggest { entity: Option<String> },

    /// Manage stored query metrics
    #[command(subcommand)]
    Metrics(MetricsCommand),

    /// Show schema changes, newest first
    Changelog {
        #[arg(short, long)]
        entity: Option<String>,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum EntityCommand {
    /// Define a new shared entity
    Define {
        name: String,
        /// name:type[:required][:unique][:indexed], repeatable
        #[arg(short, long = "field")]
        fields: Vec<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// List active entities
    List,
    /// Show fields, relationships and record count
    Describe { name: String },
    /// Soft-disable an entity
    Disable {
        name: String,
        #[arg(short, long)]
        reason: Option<String>,
    },
}

#[derive(Subcommand)]
enum FieldCommand {
    /// Add a field: name:type[:required][:unique][:indexed]
    Add {
        entity: String,
        spec: String,
        /// Default value as JSON
        #[arg(long)]
        default: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(short, long)]
        reason: Option<String>,
    },
}

#[derive(Subcommand)]
enum RelCommand {
    /// Add a relationship from SOURCE to TARGET
    Add {
        name: String,
        source: String,
        target: String,
        /// many_to_one, one_to_many, one_to_one or many_to_many
        #[arg(short = 't', long = "type", default_value = "many_to_one")]
        relationship_type: String,
        /// CASCADE, SET_NULL, RESTRICT or NO_ACTION
        #[arg(long, default_value = "SET_NULL")]
        on_delete: String,
        /// Foreign key field (created when missing)
        #[arg(long)]
        foreign_key: Option<String>,
        #[arg(long)]
        inverse: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(short, long)]
        reason: Option<String>,
    },
    /// Remove a relationship
    Remove {
        source: String,
        name: String,
        #[arg(short, long)]
        reason: Option<String>,
    },
    /// List active relationships
    List {
        #[arg(short, long)]
        entity: Option<String>,
    },
}

#[derive(Subcommand)]
enum MigrationCommand {
    /// Show persisted migration jobs
    Status { entity: Option<String> },
    /// Continue a failed migration from its last committed batch
    Resume { entity: String },
    /// Discard a migration's copied rows
    Abort {
        entity: String,
        #[arg(short, long)]
        reason: Option<String>,
    },
}

#[derive(Subcommand)]
enum MetricsCommand {
    /// Delete metrics older than the retention window
    Cleanup {
        #[arg(long)]
        retention_days: Option<u32>,
    },
}

#[derive(Args)]
struct FilterArgs {
    /// Condition such as `status=open`, `total>=10`, `name~ada`, repeatable
    #[arg(short = 'w', long = "where")]
    conditions: Vec<String>,
    /// Fields that must be null, repeatable
    #[arg(long = "null")]
    null_fields: Vec<String>,
    #[arg(long)]
    order_by: Option<String>,
    #[arg(long)]
    desc: bool,
    #[arg(short, long)]
    limit: Option<usize>,
    #[arg(long)]
    offset: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OutputMode {
    Human,
    Json,
}

impl OutputMode {
    pub fn is_human(&self) -> bool {
        *self == OutputMode::Human
    }
}

pub fn emit_success(mode: OutputMode, command: &str, data: serde_json::Value) -> anyhow::Result<()> {
    if mode == OutputMode::Json {
        let envelope = serde_json::json!({ "ok": true, "command": command, "data": data });
        println!("{}", serde_json::to_string_pretty(&envelope)?);
    }
    Ok(())
}

fn emit_error(mode: OutputMode, err: &anyhow::Error) {
    match mode {
        OutputMode::Json => {
            let error = match err.downcast_ref::<hybridb::Error>() {
                Some(e) => e.to_json(),
                None => serde_json::json!({ "error": "Error", "message": err.to_string() }),
            };
            println!("{}", serde_json::json!({ "ok": false, "error": error }));
        }
        OutputMode::Human => hybridb::ui::error(&format!("{:#}", err)),
    }
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    if let Err(e) = run(cli, mode) {
        emit_error(mode, &e);
        std::process::exit(1);
    }
}

fn run(cli: Cli, mode: OutputMode) -> anyhow::Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);
    let mut cfg = config::load_config(Some(&config_path))?.unwrap_or_default();
    if let Some(database) = &cli.database {
        cfg.database = Some(database.to_string_lossy().to_string());
    }

    if let Commands::Init { force } = cli.command {
        return commands::run_init(mode, &config_path, cfg, force);
    }

    config::ensure_db_dir(&cfg.database_path())?;
    let db = hybridb::Hybridb::open(&cfg)?;
    let actor = cli.actor.as_deref();

    match cli.command {
        Commands::Init { .. } => unreachable!("handled above"),
        Commands::Entity(cmd) => match cmd {
            EntityCommand::Define {
                name,
                fields,
                description,
            } => commands::run_define_entity(mode, &db, &name, &fields, description, actor),
            EntityCommand::List => commands::run_list_entities(mode, &db),
            EntityCommand::Describe { name } => commands::run_describe_entity(mode, &db, &name),
            EntityCommand::Disable { name, reason } => {
                commands::run_disable_entity(mode, &db, &name, actor, reason.as_deref())
            }
        },
        Commands::Field(FieldCommand::Add {
            entity,
            spec,
            default,
            description,
            reason,
        }) => commands::run_add_field(
            mode,
            &db,
            &entity,
            &spec,
            default.as_deref(),
            description,
            actor,
            reason.as_deref(),
        ),
        Commands::Rel(cmd) => match cmd {
            RelCommand::Add {
                name,
                source,
                target,
                relationship_type,
                on_delete,
                foreign_key,
                inverse,
                description,
                reason,
            } => {
                let spec = commands::relationship_spec(
                    &name,
                    &source,
                    &target,
                    &relationship_type,
                    &on_delete,
                    foreign_key,
                    inverse,
                    description,
                )?;
                commands::run_add_relationship(mode, &db, spec, actor, reason.as_deref())
            }
            RelCommand::Remove {
                source,
                name,
                reason,
            } => commands::run_remove_relationship(mode, &db, &source, &name, actor, reason.as_deref()),
            RelCommand::List { entity } => commands::run_list_relationships(mode, &db, entity.as_deref()),
        },
        Commands::Insert { entity, data } => commands::run_insert(mode, &db, &entity, &data, actor),
        Commands::Get { entity, id } => commands::run_get(mode, &db, &entity, &id),
        Commands::Find { entity, filter } => {
            let filter = filter.into_filter()?;
            commands::run_find(mode, &db, &entity, &filter)
        }
        Commands::Count { entity, filter } => {
            let filter = filter.into_filter()?;
            commands::run_count(mode, &db, &entity, &filter)
        }
        Commands::Update { entity, id, data } => commands::run_update(mode, &db, &entity, &id, &data),
        Commands::Delete {
            entity,
            id,
            no_cascade,
            force,
        } => {
            let options = hybridb::DeleteOptions {
                cascade: !no_cascade,
                force,
            };
            commands::run_delete(mode, &db, &entity, &id, options)
        }
        Commands::Link {
            entity,
            relationship,
            source_id,
            target_ids,
        } => commands::run_link(mode, &db, &entity, &relationship, &source_id, &target_ids),
        Commands::Unlink {
            entity,
            relationship,
            source_id,
            target_ids,
        } => commands::run_unlink(mode, &db, &entity, &relationship, &source_id, &target_ids),
        Commands::Linked {
            entity,
            relationship,
            source_id,
        } => commands::run_linked(mode, &db, &entity, &relationship, &source_id),
        Commands::Materialize {
            entity,
            batch_size,
            reason,
        } => commands::run_migrate(
            mode,
            &db,
            &entity,
            hybridb::MigrationDirection::ToDedicated,
            batch_size,
            reason.as_deref(),
            actor,
        ),
        Commands::Dematerialize {
            entity,
            batch_size,
            reason,
        } => commands::run_migrate(
            mode,
            &db,
            &entity,
            hybridb::MigrationDirection::ToShared,
            batch_size,
            reason.as_deref(),
            actor,
        ),
        Commands::Migration(cmd) => match cmd {
            MigrationCommand::Status { entity } => commands::run_migration_status(mode, &db, entity.as_deref()),
            MigrationCommand::Resume { entity } => commands::run_migration_resume(mode, &db, &entity),
            MigrationCommand::Abort { entity, reason } => {
                commands::run_migration_abort(mode, &db, &entity, actor, reason.as_deref())
            }
        },
        Commands::Stats { entity } => commands::run_stats(mode, &db, entity.as_deref()),
        Commands::Suggest { entity } => commands::run_suggest(mode, &db, entity.as_deref()),
        Commands::Metrics(MetricsCommand::Cleanup { retention_days }) => {
            commands::run_metrics_cleanup(mode, &db, retention_days)
        }
        Commands::Changelog { entity, limit } => commands::run_changelog(mode, &db, entity.as_deref(), limit),
    }
}

impl FilterArgs {
    fn into_filter(self) -> anyhow::Result<hybridb::Filter> {
        let mut filter = hybridb::Filter::new();
        for condition in &self.conditions {
            let (field, op, value) = commands::parse_condition(condition)?;
            filter = filter.where_op(&field, op, value);
        }
        for field in &self.null_fields {
            filter = filter.where_op(field, hybridb::FilterOp::IsNull, true);
        }
        if let Some(field) = &self.order_by {
            filter = if self.desc {
                filter.order_by_desc(field)
            } else {
                filter.order_by(field)
            };
        }
        if let Some(limit) = self.limit {
            filter = filter.limit(limit);
        }
        if let Some(offset) = self.offset {
            filter = filter.offset(offset);
        }
        Ok(filter)
    }
}
