use owo_colors::Style;
use std::sync::OnceLock;

use crate::schema::StorageMode;
use crate::metrics::Priority;

static THEME: OnceLock<Theme> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct Theme {
    pub header: Style,
    pub success: Style,
    pub error: Style,
    pub warn: Style,
    pub info: Style,
    pub dim: Style,
    pub muted: Style,
    pub shared: Style,
    pub dedicated: Style,
}

impl Theme {
    pub fn detect() -> Self {
        if !console::Term::stdout().is_term() {
            return Self::plain();
        }
        Self::colored()
    }

    pub fn colored() -> Self {
        Self {
            header: Style::new().cyan().bold(),
            success: Style::new().green().bold(),
            error: Style::new().red().bold(),
            warn: Style::new().yellow().bold(),
            info: Style::new().magenta(),
            dim: Style::new().white().dimmed(),
            muted: Style::new().bright_black(),
            shared: Style::new().blue(),
            dedicated: Style::new().green(),
        }
    }

    pub fn plain() -> Self {
        Self {
            header: Style::new(),
            success: Style::new(),
            error: Style::new(),
            warn: Style::new(),
            info: Style::new(),
            dim: Style::new(),
            muted: Style::new(),
            shared: Style::new(),
            dedicated: Style::new(),
        }
    }

    pub fn mode(&self, mode: StorageMode) -> Style {
        match mode {
            StorageMode::Shared => self.shared.clone(),
            StorageMode::Dedicated => self.dedicated.clone(),
        }
    }

    pub fn priority(&self, priority: Priority) -> Style {
        match priority {
            Priority::High => self.error.clone(),
            Priority::Medium => self.warn.clone(),
            Priority::Low => self.dim.clone(),
        }
    }
}

pub fn theme() -> &'static Theme {
    THEME.get_or_init(Theme::detect)
}
