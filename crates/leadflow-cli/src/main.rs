//! LeadFlow CLI: run the API server and operate the assignment engine.
//!
//! Run `leadflow config init` once, then `leadflow serve`.

mod ui;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::*;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use leadflow_core::agent::{Agent, AgentFilter, PerformanceMetric};
use leadflow_core::config::LeadFlowConfig;
use leadflow_core::repository::LeadRepository;
use leadflow_core::service::{CaptureRequest, LeadService};
use leadflow_hub::api;
use leadflow_hub::store::{SqliteRepository, parse_metric_date};

// ─── CLI Definition ────────────────────────────────────────

/// LeadFlow: lead scoring and weighted agent assignment
#[derive(Parser)]
#[command(name = "leadflow", version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to the user config dir)
    #[arg(short, long, global = true, env = "LEADFLOW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 🌐 Start the REST API server
    Serve {
        /// Bind host (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Bind port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// 🧮 Explain the score a capture request would get
    Score {
        /// Capture request as JSON, or @path to a JSON file
        request: String,
    },

    /// 👥 Manage agents
    Agents {
        #[command(subcommand)]
        action: AgentAction,
    },

    /// 📈 Agent performance snapshots
    Performance {
        #[command(subcommand)]
        action: PerformanceAction,
    },

    /// 🔁 Reassign a lead, to a given agent or through normal selection
    Reassign {
        /// Lead id
        lead_id: Uuid,

        /// Why the lead is moving
        #[arg(short, long)]
        reason: String,

        /// Target agent id (omit for automatic selection)
        #[arg(short, long)]
        agent: Option<Uuid>,
    },

    /// ⚙️  Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum AgentAction {
    /// List agents
    List {
        /// Include inactive agents
        #[arg(short, long)]
        all: bool,

        /// Only agents speaking this language
        #[arg(short, long)]
        language: Option<String>,
    },

    /// Register an agent
    Add {
        #[arg(long)]
        name: String,

        #[arg(long)]
        email: String,

        #[arg(long)]
        phone: String,

        #[arg(long)]
        language: Option<String>,

        /// Comma-separated property types and areas
        #[arg(long)]
        specialization: Option<String>,

        /// Comma-separated preferred areas
        #[arg(long)]
        areas: Option<String>,
    },

    /// Show an agent's active leads against capacity
    Workload { agent_id: Uuid },
}

#[derive(Subcommand)]
enum PerformanceAction {
    /// Record (or overwrite) an agent's snapshot for a date
    Record {
        agent_id: Uuid,

        /// Round-robin weight for the agent
        #[arg(long)]
        conversion_rate: f64,

        #[arg(long, default_value_t = 0)]
        conversions: u32,

        #[arg(long, default_value_t = 0)]
        active_leads: u32,

        /// YYYY-MM-DD, defaults to today
        #[arg(long)]
        date: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Show current configuration
    Show,
    /// Show config file path
    Path,
}

// ─── Helpers ───────────────────────────────────────────────

fn config_path(cli_path: Option<PathBuf>) -> PathBuf {
    cli_path.unwrap_or_else(LeadFlowConfig::default_path)
}

fn load_config(path: &Path) -> anyhow::Result<LeadFlowConfig> {
    LeadFlowConfig::load(path).with_context(|| format!("loading config {}", path.display()))
}

fn open_repository(config: &LeadFlowConfig) -> anyhow::Result<Arc<SqliteRepository>> {
    let db_path = config.database_path();
    let repo = SqliteRepository::open(&db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;
    Ok(Arc::new(repo))
}

fn open_service(config: &LeadFlowConfig) -> anyhow::Result<LeadService> {
    Ok(LeadService::from_config(open_repository(config)?, config))
}

/// Inline JSON, or the contents of a file when prefixed with `@`.
fn read_json_arg(arg: &str) -> anyhow::Result<String> {
    match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading {}", path)),
        None => Ok(arg.to_string()),
    }
}

fn split_list(value: Option<String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

// ─── Commands ──────────────────────────────────────────────

async fn run_serve(
    mut config: LeadFlowConfig,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    ui::print_banner();
    println!("  {} http://{}", "Listening:".dimmed(), config.bind_addr().cyan());
    println!("  {} {}", "Database:".dimmed(), config.database_path().display());
    if std::env::var(leadflow_hub::middleware::API_KEY_ENV).is_err() {
        println!(
            "  {}",
            format!(
                "{} not set, the API is open",
                leadflow_hub::middleware::API_KEY_ENV
            )
            .yellow()
        );
    }
    println!();

    api::start_server(&config).await
}

async fn run_score(config: &LeadFlowConfig, request: &str) -> anyhow::Result<()> {
    let json = read_json_arg(request)?;
    let request: CaptureRequest =
        serde_json::from_str(&json).context("parsing capture request")?;
    request.lead_data.validate()?;

    let service = open_service(config)?;
    let breakdown = service.preview_score(&request).await?;
    debug!("Preview for {}: raw {} → {}", request.source_type, breakdown.raw, breakdown.score);
    ui::print_breakdown(&breakdown);
    Ok(())
}

async fn run_agents(config: &LeadFlowConfig, action: AgentAction) -> anyhow::Result<()> {
    let repo = open_repository(config)?;

    match action {
        AgentAction::List { all, language } => {
            let filter = AgentFilter {
                active_only: !all,
                language,
            };
            ui::print_agents(&repo.list_agents(&filter).await?);
        }
        AgentAction::Add {
            name,
            email,
            phone,
            language,
            specialization,
            areas,
        } => {
            let mut agent = Agent::new(&name, &email, &phone);
            agent.language = language;
            agent.specialization = split_list(specialization);
            agent.preferred_areas = split_list(areas);
            repo.upsert_agent(&agent).await?;
            info!("Registered agent {} ({})", agent.full_name, agent.agent_id);
            ui::success(&format!("Added {} ({})", agent.full_name, agent.agent_id));
        }
        AgentAction::Workload { agent_id } => {
            let service = LeadService::from_config(repo, config);
            let workload = service.manager().tracker().workload(agent_id).await?;
            ui::print_workload(&workload);
        }
    }
    Ok(())
}

async fn run_performance(config: &LeadFlowConfig, action: PerformanceAction) -> anyhow::Result<()> {
    let PerformanceAction::Record {
        agent_id,
        conversion_rate,
        conversions,
        active_leads,
        date,
    } = action;

    if !conversion_rate.is_finite() || conversion_rate < 0.0 {
        anyhow::bail!("conversion rate must be a non-negative number");
    }
    let date = match date {
        Some(d) => parse_metric_date(&d)?,
        None => chrono::Utc::now().date_naive(),
    };

    let repo = open_repository(config)?;
    if repo.get_agent(agent_id).await?.is_none() {
        anyhow::bail!("agent {} not found", agent_id);
    }
    repo.record_performance(&PerformanceMetric {
        agent_id,
        date,
        total_active_leads: active_leads,
        conversions,
        conversion_rate: Some(conversion_rate),
    })
    .await?;

    ui::success(&format!(
        "Recorded conversion rate {:.2} for {} on {}",
        conversion_rate, agent_id, date
    ));
    Ok(())
}

async fn run_reassign(
    config: &LeadFlowConfig,
    lead_id: Uuid,
    reason: &str,
    agent: Option<Uuid>,
) -> anyhow::Result<()> {
    let service = open_service(config)?;
    let assigned = service.reassign(lead_id, reason, agent).await?;
    info!("Reassigned lead {} to {}: {}", lead_id, assigned.agent_id, reason);
    ui::success(&format!(
        "Lead {} now with {} ({})",
        lead_id,
        assigned.name.bold(),
        assigned.phone
    ));
    Ok(())
}

fn run_config(path: &Path, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                println!(
                    "  {} {} (use --force to overwrite)",
                    "Config already exists:".yellow(),
                    path.display()
                );
                return Ok(());
            }
            LeadFlowConfig::default().save(path)?;
            info!("Wrote default config to {}", path.display());
            ui::success(&format!("Wrote {}", path.display()));
        }
        ConfigAction::Show => {
            println!();
            println!("  {} {}", "Config file:".dimmed(), path.display());
            if !path.exists() {
                println!("  {}", "No config file, showing defaults.".yellow());
            }
            println!();

            let config = LeadFlowConfig::load(path)?;
            ui::section("Server");
            ui::kv("host", &config.server.host);
            ui::kv("port", config.server.port);
            ui::section("Database");
            ui::kv("path", config.database_path().display());
            ui::section("Cache");
            ui::kv("enabled", config.cache.enabled);
            ui::kv("duplicate_ttl_secs", config.cache.duplicate_ttl_secs);
            ui::section("Capture");
            ui::kv("allow_unassigned", config.capture.allow_unassigned);
            ui::kv("duplicate_window_hours", config.capture.duplicate_window_hours);
            ui::kv("follow_up_delay_hours", config.capture.follow_up_delay_hours);
            ui::section_end();
        }
        ConfigAction::Path => println!("{}", path.display()),
    }
    Ok(())
}

// ─── Main ──────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let path = config_path(cli.config);

    match cli.command {
        Commands::Config { action } => run_config(&path, action)?,
        Commands::Serve { host, port } => run_serve(load_config(&path)?, host, port).await?,
        Commands::Score { request } => run_score(&load_config(&path)?, &request).await?,
        Commands::Agents { action } => run_agents(&load_config(&path)?, action).await?,
        Commands::Performance { action } => {
            run_performance(&load_config(&path)?, action).await?
        }
        Commands::Reassign {
            lead_id,
            reason,
            agent,
        } => run_reassign(&load_config(&path)?, lead_id, &reason, agent).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_split_list_trims_and_skips_empty() {
        assert_eq!(
            split_list(Some("villa, Marina ,,JVC".to_string())),
            vec!["villa", "Marina", "JVC"]
        );
        assert!(split_list(None).is_empty());
    }

    #[test]
    fn test_read_json_arg_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{\"source_type\":\"bayut\"}}").unwrap();

        let arg = format!("@{}", file.path().display());
        assert_eq!(read_json_arg(&arg).unwrap(), "{\"source_type\":\"bayut\"}");
        assert_eq!(read_json_arg("{}").unwrap(), "{}");
    }

    #[test]
    fn test_cli_parses_reassign() {
        let lead = Uuid::new_v4();
        let cli = Cli::try_parse_from([
            "leadflow",
            "reassign",
            &lead.to_string(),
            "--reason",
            "client request",
        ])
        .unwrap();
        match cli.command {
            Commands::Reassign { lead_id, agent, .. } => {
                assert_eq!(lead_id, lead);
                assert!(agent.is_none());
            }
            _ => panic!("expected reassign"),
        }
    }
}
