//! Color mode for CLI output.
//!
//! `auto` honors `NO_COLOR` (https://no-color.org/) and only colors a
//! terminal stdout; pipes and hosts reading JSON always get plain text.

use std::io::IsTerminal;

use clap::ValueEnum;

/// Value of `--color` / `WARD_COLOR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ColorMode {
    Always,
    Never,
    #[default]
    Auto,
}

impl ColorMode {
    pub fn is_enabled(self) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::Auto => std::env::var_os("NO_COLOR").is_none() && std::io::stdout().is_terminal(),
        }
    }
}

/// Usable width for tables: the terminal's, or 100 columns off a terminal.
pub fn terminal_width() -> u16 {
    terminal_size::terminal_size()
        .map(|(width, _)| width.0)
        .unwrap_or(100)
}
