//! Terminal output helpers. `main.rs` calls these and stays free of layout code.

use colored::*;

use leadflow_core::agent::Agent;
use leadflow_core::scoring::ScoreBreakdown;
use leadflow_core::workload::AgentWorkload;

/// Startup banner for the server.
pub fn print_banner() {
    println!();
    println!("  {} {}", "LeadFlow".cyan().bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  {}", "Lead scoring and weighted agent assignment".dimmed());
    println!();
}

/// Opening line of a `┌─ Title` section.
pub fn section(title: &str) {
    let dashes = 32usize.saturating_sub(title.chars().count());
    println!("  {}", format!("┌─ {} {}", title, "─".repeat(dashes)).dimmed());
}

pub fn section_end() {
    println!("  {}", "└────────────────────────────────".dimmed());
}

/// One `│ key = value` line inside a section.
pub fn kv(key: &str, value: impl std::fmt::Display) {
    println!("  {} {} = {}", "│".dimmed(), key.cyan(), value.to_string().green());
}

pub fn success(message: &str) {
    println!("  {} {}", "✔".green(), message);
}

pub fn print_breakdown(breakdown: &ScoreBreakdown) {
    section("Score");
    for c in &breakdown.contributions {
        let delta = format!("{:+}", c.delta);
        let delta = if c.delta >= 0 { delta.green() } else { delta.red() };
        println!("  {} {:<36} {}", "│".dimmed(), c.factor, delta);
    }
    println!("  {} {:<36} {}", "│".dimmed(), "raw".dimmed(), breakdown.raw);
    println!(
        "  {} {:<36} {}",
        "│".dimmed(),
        "score".bold(),
        breakdown.score.to_string().cyan().bold()
    );
    section_end();
}

pub fn print_agents(agents: &[Agent]) {
    if agents.is_empty() {
        println!("  {}", "No agents registered. Add one with `leadflow agents add`.".yellow());
        return;
    }
    for agent in agents {
        let state = if agent.is_active {
            "active".green()
        } else {
            "inactive".red()
        };
        println!(
            "  {} {} {} [{}]",
            agent.agent_id.to_string().dimmed(),
            agent.full_name.bold(),
            agent.language.as_deref().unwrap_or("-").cyan(),
            state
        );
        if !agent.specialization.is_empty() {
            println!("      {} {}", "covers:".dimmed(), agent.specialization.join(", "));
        }
    }
}

pub fn print_workload(workload: &AgentWorkload) {
    section("Workload");
    kv("active_leads", workload.active_leads);
    kv("capacity", workload.capacity);
    kv("remaining", workload.remaining);
    kv("weight", format!("{:.2}", workload.weight));
    section_end();
}
