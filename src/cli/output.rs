//! Output formatting utilities for the CLI.

use serde::Serialize;

use crate::domain::models::{Run, StepInstance};

pub trait CommandOutput: Serialize {
    fn to_human(&self) -> String;

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

pub fn output<T: CommandOutput>(result: &T, json_mode: bool) {
    if json_mode {
        println!("{}", serde_json::to_string_pretty(&result.to_json()).unwrap_or_default());
    } else {
        println!("{}", result.to_human());
    }
}

/// Truncate a string to a maximum number of characters, appending "..." if truncated.
pub fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

/// One line per run for listings.
pub fn run_line(run: &Run) -> String {
    format!(
        "{}  {:<11}  {:<24}  {:<16}  step {}/{}",
        run.id,
        run.status.as_str(),
        truncate(&run.definition_id, 24),
        truncate(&run.organization_id, 16),
        run.current_step.min(run.total_steps),
        run.total_steps
    )
}

/// One line per step for run details.
pub fn step_line(step: &StepInstance) -> String {
    let mut line = format!(
        "  {:>3}. {:<24} {:<8} {:<11} retries {}/{}",
        step.sequence,
        truncate(&step.name, 24),
        step.worker_type.as_str(),
        step.status.as_str(),
        step.retry_count,
        step.max_retries
    );
    if let Some(error) = &step.last_error {
        line.push_str(&format!("  error: {}", truncate(error, 60)));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_keeps_short_strings() {
        assert_eq!(truncate("short", 10), "short");
    }

    #[test]
    fn test_truncate_counts_characters() {
        assert_eq!(truncate("ééééééééééé", 6), "ééé...");
    }
}
