//! Message styling for CLI output.
//!
//! Every line a command prints to a human goes through [`Style`], which
//! decides once (at construction) whether ANSI colors are emitted.
//!
//! | Prefix | Meaning | Tone |
//! |--------|---------|------|
//! | `[ok]` | Success | green |
//! | `[err]` | Error | red |
//! | `[warn]` | Warning | yellow |
//! | `[info]` | Information | blue |
//! | `[hint]` | Suggested next command | cyan |
//! | `[block]` | Refused by preflight or the write gate | magenta |

use owo_colors::OwoColorize;

use ward_core::{Freshness, StepStatus};

use super::color::ColorMode;

/// Kind of a prefixed message line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Ok,
    Err,
    Warn,
    Info,
    Hint,
    Block,
}

impl MessageType {
    fn label(self) -> &'static str {
        match self {
            Self::Ok => "[ok]",
            Self::Err => "[err]",
            Self::Warn => "[warn]",
            Self::Info => "[info]",
            Self::Hint => "[hint]",
            Self::Block => "[block]",
        }
    }

    fn tone(self) -> Tone {
        match self {
            Self::Ok => Tone::Green,
            Self::Err => Tone::Red,
            Self::Warn => Tone::Yellow,
            Self::Info => Tone::Blue,
            Self::Hint => Tone::Cyan,
            Self::Block => Tone::Magenta,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Tone {
    Green,
    Red,
    Yellow,
    Blue,
    Cyan,
    Magenta,
    Dim,
    Bold,
    Plain,
}

/// Styling for terminal output.
#[derive(Debug, Clone)]
pub struct Style {
    colors: bool,
}

impl Style {
    pub fn new(color_mode: ColorMode) -> Self {
        Self {
            colors: color_mode.is_enabled(),
        }
    }

    fn paint(&self, text: &str, tone: Tone) -> String {
        if !self.colors {
            return text.to_string();
        }
        match tone {
            Tone::Green => text.green().to_string(),
            Tone::Red => text.red().to_string(),
            Tone::Yellow => text.yellow().to_string(),
            Tone::Blue => text.blue().to_string(),
            Tone::Cyan => text.cyan().to_string(),
            Tone::Magenta => text.magenta().to_string(),
            Tone::Dim => text.dimmed().to_string(),
            Tone::Bold => text.bold().to_string(),
            Tone::Plain => text.to_string(),
        }
    }

    /// `[ok] text`, `[err] text`, ...
    pub fn message(&self, msg_type: MessageType, text: &str) -> String {
        format!("{} {}", self.paint(msg_type.label(), msg_type.tone()), text)
    }

    /// Indented `label: value` line under a message.
    pub fn message_detail(&self, label: &str, value: &str) -> String {
        format!("     {}: {}", self.paint(label, Tone::Dim), value)
    }

    pub fn section(&self, title: &str) -> String {
        self.paint(title, Tone::Bold)
    }

    /// Error line followed by optional `Cause:` and `Hint:` lines.
    pub fn error_with_context(&self, msg: &str, cause: Option<&str>, hint: Option<&str>) -> String {
        let mut lines = vec![self.message(MessageType::Err, msg)];
        lines.extend(cause.map(|c| format!("      Cause: {}", c)));
        lines.extend(hint.map(|h| format!("      Hint: {}", h)));
        lines.join("\n")
    }

    /// `  - text`; `+` is green, `-` red and `!` yellow.
    pub fn list_item(&self, bullet: &str, text: &str) -> String {
        let tone = match bullet {
            "+" => Tone::Green,
            "-" => Tone::Red,
            "!" => Tone::Yellow,
            _ => Tone::Plain,
        };
        format!("  {} {}", self.paint(bullet, tone), text)
    }

    pub fn key_value(&self, key: &str, value: &str) -> String {
        format!("{}: {}", self.paint(key, Tone::Dim), value)
    }

    /// First 8 chars of an id.
    pub fn short_id(&self, id: &str) -> String {
        self.paint(id.get(..8).unwrap_or(id), Tone::Yellow)
    }

    pub fn file_path(&self, path: &str) -> String {
        self.paint(path, Tone::Cyan)
    }

    pub fn step_status(&self, status: StepStatus) -> String {
        let tone = match status {
            StepStatus::Pending => Tone::Dim,
            StepStatus::InProgress => Tone::Blue,
            StepStatus::Done => Tone::Green,
            StepStatus::Failed => Tone::Red,
        };
        self.paint(&status.to_string(), tone)
    }

    pub fn freshness(&self, freshness: Freshness) -> String {
        let tone = match freshness {
            Freshness::Fresh => Tone::Green,
            Freshness::Stale => Tone::Yellow,
            Freshness::Missing => Tone::Red,
        };
        self.paint(&freshness.to_string(), tone)
    }
}
