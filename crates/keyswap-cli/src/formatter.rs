//! Output formatters for plans, apply results, and status reports.

use clap::ValueEnum;
use comfy_table::{Cell, Table};
use keyswap_core::{ApplyResult, PhasePlan, StatusReport};

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Trait for formatting output.
pub trait Formatter: Send + Sync {
    /// Format a phase plan.
    fn format_plan(&self, plan: &PhasePlan) -> String;

    /// Format the outcome of an apply run.
    fn format_apply(&self, result: &ApplyResult) -> String;

    /// Format an entity status report.
    fn format_status(&self, status: &StatusReport) -> String;
}

/// Create a formatter for the given output format.
pub fn create_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Table => Box::new(TableFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
    }
}

/// Table formatter using comfy-table.
pub struct TableFormatter;

impl Formatter for TableFormatter {
    fn format_plan(&self, plan: &PhasePlan) -> String {
        let mut table = Table::new();
        table.set_header(vec!["#", "Kind", "Target", "Action", "Reversible"]);

        for phase in &plan.phases {
            table.add_row(vec![
                Cell::new(phase.ordinal),
                Cell::new(phase.kind),
                Cell::new(&phase.target),
                Cell::new(phase.summary()),
                Cell::new(if phase.reversible { "yes" } else { "no" }),
            ]);
        }

        format!(
            "{}\n{} phase(s) for {} -> {}",
            table,
            plan.len(),
            plan.entity_name(),
            plan.entity.new_key.column
        )
    }

    fn format_apply(&self, result: &ApplyResult) -> String {
        let mut output = format!(
            "{}: {} through phase {}/{}",
            result.entity, result.status, result.applied_through, result.total_phases
        );

        if !result.phases_run.is_empty() {
            let ran: Vec<String> = result.phases_run.iter().map(|o| o.to_string()).collect();
            output.push_str(&format!("\nphases run: {}", ran.join(", ")));
        }

        if !result.backfill.is_empty() {
            let mut table = Table::new();
            table.set_header(vec!["Scanned", "Written", "Batches", "Cursor"]);
            for progress in &result.backfill {
                table.add_row(vec![
                    Cell::new(progress.rows_scanned),
                    Cell::new(progress.rows_written),
                    Cell::new(progress.batches),
                    Cell::new(format_cursor(progress.cursor)),
                ]);
            }
            output.push('\n');
            output.push_str(&table.to_string());
        }

        output
    }

    fn format_status(&self, status: &StatusReport) -> String {
        let mut table = Table::new();
        table.set_header(vec!["Entity", "State", "Applied", "Pending"]);
        table.add_row(vec![
            Cell::new(&status.entity),
            Cell::new(&status.state),
            Cell::new(format_progress(status)),
            Cell::new(status.pending.len()),
        ]);
        table.to_string()
    }
}

/// JSON formatter.
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn format_plan(&self, plan: &PhasePlan) -> String {
        plan.to_json().unwrap_or_else(|e| error_json(&e.to_string()))
    }

    fn format_apply(&self, result: &ApplyResult) -> String {
        let backfill: Vec<serde_json::Value> = result
            .backfill
            .iter()
            .map(|p| {
                serde_json::json!({
                    "rows_scanned": p.rows_scanned,
                    "rows_written": p.rows_written,
                    "batches": p.batches,
                    "cursor": p.cursor,
                })
            })
            .collect();

        serde_json::json!({
            "entity": result.entity,
            "status": result.status.to_string(),
            "applied_through": result.applied_through,
            "total_phases": result.total_phases,
            "phases_run": result.phases_run,
            "backfill": backfill,
        })
        .to_string()
    }

    fn format_status(&self, status: &StatusReport) -> String {
        serde_json::json!({
            "entity": status.entity,
            "state": status.state.to_string(),
            "last_applied": status.last_applied,
            "total_phases": status.total_phases,
            "pending": status.pending,
        })
        .to_string()
    }
}

fn format_cursor(cursor: Option<u64>) -> String {
    cursor.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string())
}

fn format_progress(status: &StatusReport) -> String {
    match (status.last_applied, status.total_phases) {
        (Some(done), Some(total)) => format!("{}/{}", done, total),
        (None, Some(total)) => format!("0/{}", total),
        _ => "-".to_string(),
    }
}

fn error_json(error: &str) -> String {
    serde_json::json!({ "error": error }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyswap_core::{ApplyStatus, BackfillProgress, MigrationState};

    fn apply_result() -> ApplyResult {
        ApplyResult {
            entity: "author".to_string(),
            applied_through: 3,
            total_phases: 19,
            status: ApplyStatus::Partial,
            phases_run: vec![1, 2, 3],
            backfill: vec![BackfillProgress {
                rows_scanned: 2,
                rows_written: 2,
                batches: 1,
                cursor: Some(2),
                completed: true,
            }],
        }
    }

    #[test]
    fn test_table_apply() {
        let output = TableFormatter.format_apply(&apply_result());
        assert!(output.starts_with("author: partial through phase 3/19"));
        assert!(output.contains("phases run: 1, 2, 3"));
        assert!(output.contains("Scanned"));
    }

    #[test]
    fn test_json_apply() {
        let output = JsonFormatter.format_apply(&apply_result());
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["status"], "partial");
        assert_eq!(value["phases_run"], serde_json::json!([1, 2, 3]));
        assert_eq!(value["backfill"][0]["cursor"], 2);
    }

    #[test]
    fn test_status_progress() {
        let status = StatusReport {
            entity: "author".to_string(),
            last_applied: None,
            total_phases: Some(19),
            pending: (1..=19).collect(),
            state: MigrationState::InProgress,
            plan: None,
        };
        assert_eq!(format_progress(&status), "0/19");

        let value: serde_json::Value =
            serde_json::from_str(&JsonFormatter.format_status(&status)).unwrap();
        assert_eq!(value["state"], "in progress");
        assert_eq!(value["pending"].as_array().map(|a| a.len()), Some(19));
    }

    #[test]
    fn test_format_cursor() {
        assert_eq!(format_cursor(None), "-");
        assert_eq!(format_cursor(Some(42)), "42");
    }
}
