//! Pretty console reporting of a workflow run: task start/complete/skip/fail
//! and cache hit/miss lines. Purely an opt-in convenience for callers; the
//! scheduler itself never calls into this module.

use console::style;
use serde_json::Value;

/// Format a workflow start banner.
pub fn format_workflow_start(workflow_name: &str, task_count: usize) {
    println!("\n{}", "═".repeat(80));
    println!(
        "{} {} {}",
        style("▶").cyan().bold(),
        style("Workflow:").bold(),
        style(workflow_name).cyan().bold()
    );
    println!(
        "  {} {}",
        style("Tasks:").dim(),
        style(task_count.to_string()).dim()
    );
    println!("{}", "─".repeat(80));
}

/// Format a workflow completion banner.
pub fn format_workflow_complete(success_count: usize, failure_count: usize, skipped_count: usize) {
    println!("\n{}", "═".repeat(80));
    println!("{}", style("Workflow Completed").green().bold());
    println!(
        "  {} {}  {} {}  {} {}",
        style("succeeded:").dim(),
        style(success_count.to_string()).green(),
        style("failed:").dim(),
        style(failure_count.to_string()).red(),
        style("skipped:").dim(),
        style(skipped_count.to_string()).yellow(),
    );
    println!("{}", "═".repeat(80));
}

/// Format task execution start.
pub fn format_task_start(instance_id: &str, task_type: &str) {
    println!(
        "{} {} {} {}",
        style("▸").cyan(),
        style("Task:").bold(),
        style(instance_id).cyan(),
        style(format!("[{task_type}]")).dim()
    );
}

/// Format task completion with its output.
pub fn format_task_complete(instance_id: &str, output: &Value) {
    println!(
        "  {} {}",
        style("✓").green(),
        style(format!("Completed '{instance_id}'")).green()
    );
    println!("{}", indent_json(output, 4));
}

/// Format a task skipped because its condition was false, or because an
/// upstream dependency failed.
pub fn format_task_skipped(instance_id: &str, upstream_origin: Option<&str>) {
    match upstream_origin {
        Some(origin) => println!(
            "  {} {}",
            style("⤼").yellow(),
            style(format!("Skipped '{instance_id}' (upstream '{origin}' failed)")).yellow()
        ),
        None => println!(
            "  {} {}",
            style("⤼").yellow(),
            style(format!("Skipped '{instance_id}' (condition false)")).yellow()
        ),
    }
}

/// Format a task failure.
pub fn format_task_failed(instance_id: &str, message: &str) {
    println!(
        "  {} {}",
        style("✗").red().bold(),
        style(format!("Failed '{instance_id}'")).red().bold()
    );
    println!("    {} {}", style("Error:").red(), style(message).red());
}

/// Format a cache hit for a task.
pub fn format_cache_hit(instance_id: &str, key: &str) {
    println!(
        "  {} {} {}",
        style("Cache Hit").yellow().bold(),
        style(instance_id).yellow(),
        style(format!("({key})")).dim()
    );
}

/// Format a cache miss for a task.
pub fn format_cache_miss(instance_id: &str, key: &str) {
    println!(
        "  {} {} {}",
        style("Cache Miss").yellow(),
        style(instance_id).yellow(),
        style(format!("({key})")).dim()
    );
}

/// Format a fan-out group's dispatch, before its children run.
pub fn format_fan_out_start(instance_id: &str, item_count: usize, max_concurrent: usize) {
    println!(
        "{} {} {} {}",
        style("⋔").cyan(),
        style("Fan-out:").bold(),
        style(instance_id).cyan(),
        style(format!("[{item_count} items, max {max_concurrent} concurrent]")).dim()
    );
}

fn indent_json(value: &Value, indent: usize) -> String {
    let json_str = serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string());
    let indent_str = " ".repeat(indent);
    json_str
        .lines()
        .map(|line| format!("{indent_str}{line}"))
        .collect::<Vec<_>>()
        .join("\n")
}
