//! Table rendering for CLI output using comfy-table.
//!
//! | Command | Table Function |
//! |---------|----------------|
//! | `ward run show` | `render_steps_table()` |
//! | `ward knowledge` | `render_knowledge_table()` |
//! | `ward projects` | `render_projects_table()` |

use comfy_table::presets::NOTHING;
use comfy_table::{Cell, CellAlignment, ColumnConstraint, ContentArrangement, Table, Width};

use ward_core::{Freshness, KnowledgeRecord, ProjectEntry, Step};

use super::color::terminal_width;
use super::format::{format_relative_time, truncate_str};
use super::style::Style;

fn base_table() -> Table {
    let mut table = Table::new();
    table.load_preset(NOTHING);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_width(terminal_width());
    table
}

/// Steps of a run.
///
/// ```text
/// #   STATUS        TRIES   DESCRIPTION          FILES
/// 1   done              0   extract helper       src/util.rs
/// 2   in-progress       1   use helper           src/a.rs, src/b.rs
/// ```
pub fn render_steps_table(style: &Style, steps: &[Step]) -> String {
    if steps.is_empty() {
        return String::new();
    }

    let mut table = base_table();
    table.set_header(vec![
        Cell::new("#"),
        Cell::new("STATUS"),
        Cell::new("TRIES").set_alignment(CellAlignment::Right),
        Cell::new("DESCRIPTION"),
        Cell::new("FILES"),
    ]);
    table.set_constraints(vec![
        ColumnConstraint::LowerBoundary(Width::Fixed(3)),
        ColumnConstraint::LowerBoundary(Width::Fixed(12)),
        ColumnConstraint::LowerBoundary(Width::Fixed(5)),
        ColumnConstraint::LowerBoundary(Width::Fixed(16)),
        ColumnConstraint::LowerBoundary(Width::Fixed(16)),
    ]);

    for (idx, step) in steps.iter().enumerate() {
        table.add_row(vec![
            Cell::new(idx + 1),
            Cell::new(style.step_status(step.status)),
            Cell::new(step.attempts).set_alignment(CellAlignment::Right),
            Cell::new(truncate_str(&step.description, 48)),
            Cell::new(step.files.join(", ")),
        ]);
    }

    table.to_string()
}

/// Learned files with freshness.
pub fn render_knowledge_table(style: &Style, records: &[(KnowledgeRecord, Freshness)]) -> String {
    if records.is_empty() {
        return String::new();
    }

    let mut table = base_table();
    table.set_header(vec![
        Cell::new("PATH"),
        Cell::new("VER").set_alignment(CellAlignment::Right),
        Cell::new("STATE"),
        Cell::new("UPDATED"),
        Cell::new("SUMMARY"),
    ]);

    for (record, freshness) in records {
        table.add_row(vec![
            Cell::new(&record.path),
            Cell::new(record.current_version()).set_alignment(CellAlignment::Right),
            Cell::new(style.freshness(*freshness)),
            Cell::new(format_relative_time(record.updated_at)),
            Cell::new(if record.facts.summary.is_empty() {
                "-".to_string()
            } else {
                truncate_str(&record.facts.summary, 40)
            }),
        ]);
    }

    table.to_string()
}

/// Registered projects.
pub fn render_projects_table(projects: &[(String, ProjectEntry)]) -> String {
    if projects.is_empty() {
        return String::new();
    }

    let mut table = base_table();
    table.set_header(vec![Cell::new("NAME"), Cell::new("LANGUAGE"), Cell::new("ROOT")]);
    for (name, entry) in projects {
        table.add_row(vec![
            Cell::new(name),
            Cell::new(entry.language.as_deref().unwrap_or("-")),
            Cell::new(entry.root.display()),
        ]);
    }
    table.to_string()
}
