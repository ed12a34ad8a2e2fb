pub mod icons;
pub mod output;
pub mod progress;
pub mod progress_message;
pub mod table;
pub mod theme;

pub use icons::Icons;
pub use output::{
    dim, error, header, info, muted, phase, record_created, record_deleted, record_updated,
    section, status, success, summary_row, timing, warn,
};
pub use progress::{ProgressManager, Spinner};
pub use progress_message::ProgressMessage;
pub use table::{
    entities_table, fields_table, records_table, relationships_table, stats_table,
    suggestions_table, TableBuilder,
};
pub use theme::{theme, Theme};
