use crate::migration::{MigrationDirection, MigrationProgress};

#[derive(Clone, Debug)]
pub enum ProgressMessage {
    Started {
        entity: String,
        direction: MigrationDirection,
        total: usize,
    },
    Batch(MigrationProgress),
    Finished,
    Error(String),
}
