//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying plans, apply
//! results, drift reports and state to the user as text or JSON.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ConfigHasher;
use crate::drift::DriftReport;
use crate::planner::{
    ChangeOp, ChangeSetEntry, ChangeSummary, ExecutionPlan, PlannedValue, StepStatus,
};
use crate::reconciler::ApplyReport;
use crate::state::{LockInfo, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan change row for table display.
#[derive(Tabled)]
struct ChangeRow {
    #[tabled(rename = "Op")]
    op: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Changes")]
    changes: String,
}

/// Step outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Step")]
    step: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Detail")]
    detail: String,
}

/// Recorded resource row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Provider ID")]
    provider_id: String,
    #[tabled(rename = "Last reconciled")]
    last_reconciled: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &ExecutionPlan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&PlanJson::from(plan)),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &ExecutionPlan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - stack is up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nExecution plan");
        let _ = writeln!(output, "   Fingerprint: {}\n", plan.fingerprint);

        let rows: Vec<ChangeRow> = plan
            .change_set
            .actionable()
            .map(|e| ChangeRow {
                op: Self::format_op(e.op),
                resource: e.logical_id.clone(),
                kind: e.kind.to_string(),
                changes: Self::truncate(&e.changed_attributes.join(", "), 48),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            output.push_str("\nDetailed changes:\n");
            for entry in plan.change_set.actionable() {
                Self::write_entry_detail(&mut output, entry);
            }
        }

        output.push_str("\nWaves:\n");
        for (i, wave) in plan.wave_steps().enumerate() {
            let labels: Vec<String> = wave.iter().map(|s| s.label()).collect();
            let _ = writeln!(output, "   {}. {}", i + 1, labels.join(", "));
        }

        let _ = writeln!(
            output,
            "\n{}",
            Self::format_summary(&plan.change_set.summary())
        );
        output
    }

    fn write_entry_detail(output: &mut String, entry: &ChangeSetEntry) {
        let _ = writeln!(
            output,
            "   {} {} ({})",
            entry.op.symbol(),
            entry.logical_id.bold(),
            entry.kind
        );
        for name in &entry.changed_attributes {
            let before = entry
                .before
                .as_ref()
                .and_then(|b| b.attributes.get(name))
                .map(ToString::to_string);
            let after = entry
                .after
                .as_ref()
                .and_then(|a| a.get(name))
                .map(PlannedValue::to_string);
            let forces = entry.op == ChangeOp::Replace && entry.kind.requires_replacement(name);
            let _ = writeln!(
                output,
                "       {name}: {} -> {}{}",
                before.as_deref().unwrap_or("(unset)").dimmed(),
                after.as_deref().unwrap_or("(unset)"),
                if forces { " (forces replacement)".red().to_string() } else { String::new() }
            );
        }
    }

    /// Formats the result of an apply.
    #[must_use]
    pub fn format_apply(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => Self::format_apply_text(report),
        }
    }

    fn format_apply_text(report: &ApplyReport) -> String {
        let execution = &report.execution;
        let mut output = if report.is_success() {
            format!("{} Apply complete\n\n", "✓".green())
        } else if execution.cancelled {
            format!("{} Apply cancelled\n\n", "⚠".yellow())
        } else {
            format!("{} Apply finished with failures\n\n", "✗".red())
        };
        let _ = writeln!(
            output,
            "   Plan: {}\n",
            ConfigHasher::new().short_hash(&report.fingerprint)
        );

        if !execution.outcomes.is_empty() {
            let rows: Vec<OutcomeRow> = execution
                .outcomes
                .iter()
                .map(|o| OutcomeRow {
                    step: format!("{} {}", o.action, o.logical_id),
                    status: Self::format_status(o.status),
                    attempts: o.attempts,
                    detail: o
                        .blocked_by
                        .as_ref()
                        .map(|b| format!("blocked by {b}"))
                        .or_else(|| o.error.clone())
                        .or_else(|| o.provider_id.clone())
                        .map(|d| Self::truncate(&d, 60))
                        .unwrap_or_default(),
                })
                .collect();
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        let _ = writeln!(
            output,
            "\n{} succeeded, {} failed, {} skipped",
            execution.succeeded.to_string().green(),
            execution.failed.to_string().red(),
            execution.skipped.to_string().yellow()
        );

        if let Some(drift) = &report.drift
            && !drift.is_clean()
        {
            output.push('\n');
            output.push_str(&Self::format_drift_text(drift));
        }

        if !report.outputs.is_empty() {
            output.push_str("\nOutputs:\n");
            for (name, value) in &report.outputs {
                let value = value.as_str().map_or_else(|| value.to_string(), str::to_string);
                let _ = writeln!(output, "   {name} = {value}");
            }
        }

        output
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => Self::format_drift_text(report),
        }
    }

    fn format_drift_text(report: &DriftReport) -> String {
        if report.is_clean() {
            return format!(
                "{} No drift detected across {} resources.\n",
                "✓".green(),
                report.checked
            );
        }

        let mut output = String::new();
        if !report.drifted.is_empty() {
            let _ = writeln!(output, "{} Drift detected:\n", "⚠".yellow());
            for drift in &report.drifted {
                if drift.missing {
                    let _ = writeln!(output, "   - {} ({}): {}", drift.logical_id, drift.kind, "missing".red());
                } else {
                    let _ = writeln!(
                        output,
                        "   - {} ({}): {}",
                        drift.logical_id,
                        drift.kind,
                        drift.changed_attributes.join(", ")
                    );
                }
            }
            let _ = writeln!(
                output,
                "\n{}/{} resources have drifted.",
                report.drifted.len(),
                report.checked
            );
        }
        if !report.errors.is_empty() {
            let _ = writeln!(output, "\n{} Could not read:", "✗".red());
            for (id, error) in &report.errors {
                let _ = writeln!(output, "   - {id}: {error}");
            }
        }
        output
    }

    /// Formats recorded state and the current lock.
    #[must_use]
    pub fn format_state(
        &self,
        backend: &str,
        snapshot: &StateSnapshot,
        lock: Option<&LockInfo>,
    ) -> String {
        match self.format {
            OutputFormat::Json => to_json(&StateJson {
                backend,
                lock,
                resources: snapshot,
            }),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(output, "\nState ({backend})\n");

                if snapshot.is_empty() {
                    output.push_str("   No resources recorded.\n");
                } else {
                    let rows: Vec<RecordRow> = snapshot
                        .iter()
                        .map(|(id, r)| RecordRow {
                            resource: if r.retain_on_delete {
                                format!("{id} (retained)")
                            } else {
                                id.clone()
                            },
                            kind: r.kind.to_string(),
                            provider_id: Self::truncate(&r.provider_id, 40),
                            last_reconciled: r.last_reconciled.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                match lock {
                    Some(lock) => {
                        let _ = writeln!(
                            output,
                            "\n   Locked by {} ({}), expires in {}s",
                            lock.holder,
                            lock.lock_id,
                            lock.remaining_secs()
                        );
                    }
                    None => output.push_str("\n   Not locked.\n"),
                }
                output
            }
        }
    }

    /// Formats the plan summary line.
    fn format_summary(summary: &ChangeSummary) -> String {
        format!(
            "Plan: {} to create, {} to update, {} to replace, {} to delete",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.replace.to_string().magenta(),
            summary.delete.to_string().red()
        )
    }

    /// Formats an operation with color.
    fn format_op(op: ChangeOp) -> String {
        let label = format!("{}{}", op.symbol(), op);
        match op {
            ChangeOp::Create => label.green().to_string(),
            ChangeOp::Update => label.yellow().to_string(),
            ChangeOp::Replace => label.magenta().to_string(),
            ChangeOp::Delete => label.red().to_string(),
            ChangeOp::NoOp => label.dimmed().to_string(),
        }
    }

    /// Formats a step status with color.
    fn format_status(status: StepStatus) -> String {
        match status {
            StepStatus::Succeeded => "succeeded".green().to_string(),
            StepStatus::Failed => "failed".red().to_string(),
            StepStatus::Skipped => "skipped".yellow().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{cut}...")
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

// JSON serialization helpers

#[derive(Serialize)]
struct PlanJson<'a> {
    fingerprint: &'a str,
    summary: ChangeSummary,
    waves: Vec<Vec<String>>,
    changes: Vec<&'a ChangeSetEntry>,
}

impl<'a> From<&'a ExecutionPlan> for PlanJson<'a> {
    fn from(plan: &'a ExecutionPlan) -> Self {
        Self {
            fingerprint: &plan.fingerprint,
            summary: plan.change_set.summary(),
            waves: plan
                .wave_steps()
                .map(|wave| wave.iter().map(|s| s.label()).collect())
                .collect(),
            changes: plan.change_set.actionable().collect(),
        }
    }
}

#[derive(Serialize)]
struct StateJson<'a> {
    backend: &'a str,
    lock: Option<&'a LockInfo>,
    resources: &'a StateSnapshot,
}
