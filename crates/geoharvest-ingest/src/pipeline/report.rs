//! Table rendering for run reports and status

use crate::checkpoint::StageSummary;
use crate::stage::StageReport;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use geoharvest_common::Stage;

const DETAIL_WIDTH: usize = 80;

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS);
    table
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

/// Per-stage counts of one run
pub fn stage_table(reports: &[StageReport]) -> Table {
    let mut table = new_table();
    table.set_header(vec![
        "Stage",
        "Succeeded",
        "Failed",
        "Skipped",
        "Unrecorded",
        "Not started",
    ]);
    for r in reports {
        table.add_row(vec![
            r.stage.to_string(),
            r.succeeded.to_string(),
            r.failed.to_string(),
            r.skipped.to_string(),
            r.checkpoint_errors.to_string(),
            r.cancelled.to_string(),
        ]);
    }
    table
}

/// Failed units, plus merge groups whose detail lists failed sources
///
/// Returns `None` when there is nothing to show.
pub fn problem_table(reports: &[StageReport]) -> Option<Table> {
    let mut table = new_table();
    table.set_header(vec!["Stage", "Unit", "Detail"]);
    let mut rows = 0;

    for r in reports {
        for unit in &r.units {
            let interesting = unit.unrecorded
                || unit.status == geoharvest_common::CheckpointStatus::Failed
                || (r.stage == Stage::Merge && unit.detail.as_deref().is_some_and(|d| d.contains("failed")));
            if !interesting {
                continue;
            }
            let mut detail = unit.detail.clone().unwrap_or_default();
            if unit.unrecorded {
                detail = format!("not checkpointed, will re-run; {}", detail);
            }
            table.add_row(vec![
                r.stage.to_string(),
                unit.unit_key.to_string(),
                truncate(&detail, DETAIL_WIDTH),
            ]);
            rows += 1;
        }
    }

    (rows > 0).then_some(table)
}

/// Checkpoint counts per stage
pub fn status_table(rows: &[(Stage, StageSummary)]) -> Table {
    let mut table = new_table();
    table.set_header(vec!["Stage", "Succeeded", "Failed"]);
    for (stage, summary) in rows {
        table.add_row(vec![
            stage.to_string(),
            summary.succeeded.to_string(),
            summary.failed.to_string(),
        ]);
    }
    table
}
