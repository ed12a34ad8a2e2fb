use crate::migration::MigrationDirection;
use crate::ui::progress_message::ProgressMessage;
use crate::ui::theme;
use crate::ui::Icons;
use indicatif::{HumanDuration, ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use std::thread;
use std::time::Duration;

/// Migration progress bar fed by a channel of [`ProgressMessage`]s.
///
/// The engine's progress callback only sends; rendering happens on a
/// separate thread.
pub struct ProgressManager {
    bar: ProgressBar,
    handle: thread::JoinHandle<()>,
}

impl ProgressManager {
    pub fn new(total_records: usize) -> (Self, crossbeam::channel::Sender<ProgressMessage>) {
        let (tx, rx) = crossbeam::channel::unbounded::<ProgressMessage>();

        let bar = if console::Term::stdout().is_term() {
            let bar = ProgressBar::new(total_records as u64);
            if let Ok(style) =
                ProgressStyle::with_template("{spinner} {msg} [{bar:30}] {pos}/{len} ({percent}%)")
            {
                bar.set_style(style.progress_chars("=> "));
            }
            bar
        } else {
            ProgressBar::hidden()
        };

        let bar_clone = bar.clone();
        let handle = thread::spawn(move || {
            for msg in rx {
                match msg {
                    ProgressMessage::Started {
                        entity,
                        direction,
                        total,
                    } => {
                        let verb = match direction {
                            MigrationDirection::ToDedicated => "Materializing",
                            MigrationDirection::ToShared => "Dematerializing",
                        };
                        bar_clone.set_length(total as u64);
                        bar_clone.set_message(format!("{} {}", verb, entity));
                        bar_clone.enable_steady_tick(Duration::from_millis(100));
                    }
                    ProgressMessage::Batch(progress) => {
                        bar_clone.set_length(progress.total as u64);
                        bar_clone.set_position(progress.processed as u64);
                    }
                    ProgressMessage::Finished => {
                        bar_clone.finish_with_message("Done");
                        break;
                    }
                    ProgressMessage::Error(message) => {
                        bar_clone.abandon_with_message(message);
                        break;
                    }
                }
            }
        });

        (Self { bar, handle }, tx)
    }

    /// Wait for the render thread to drain its channel
    pub fn join(self) {
        if self.handle.join().is_err() {
            self.bar.abandon();
        }
    }

    pub fn finish_with_summary(self, duration: Duration, records: usize, batches: usize) {
        self.join();
        println!();
        println!(
            "{} {}",
            Icons::CHECK.style(theme().success.clone()),
            format!("Complete in {}", HumanDuration(duration)).style(theme().success.clone())
        );
        println!(
            "  {} {}  {} {}",
            Icons::PACKAGE.style(theme().info.clone()),
            records,
            Icons::STATS.style(theme().info.clone()),
            batches
        );
    }
}

pub struct Spinner {
    pb: ProgressBar,
}

impl Spinner {
    pub fn new(message: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_message(message.to_string());
        if console::Term::stdout().is_term() {
            pb.enable_steady_tick(Duration::from_millis(100));
        }
        Self { pb }
    }

    pub fn finish_with_message(&self, msg: &str) {
        self.pb.finish_with_message(msg.to_string());
    }
}
