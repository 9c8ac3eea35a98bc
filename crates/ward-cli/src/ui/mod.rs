//! # CLI UI Module
//!
//! Consistent styling and formatting for ward CLI output.
//!
//! Output must stay scannable without colors (`NO_COLOR`, pipes), and every
//! command that reports state also supports `--json` for hosts and scripts.
//!
//! ## Module Structure
//!
//! - `color`: Color mode detection and terminal capability checks
//! - `style`: Message types, prefixes, and styling functions
//! - `format`: Utility formatters (time, truncation)
//! - `table`: Table rendering with comfy-table
//! - `progress`: Spinner shown while a step is being verified

pub mod color;
pub mod format;
pub mod progress;
pub mod style;
pub mod table;

pub use color::ColorMode;
pub use progress::{Progress, ProgressMode};
pub use style::{MessageType, Style};
