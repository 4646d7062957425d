mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// foreman -- run autonomous delivery workflows with planner, dev, QA and
/// devops agents.
#[derive(Parser)]
#[command(name = "foreman", version, about)]
struct Cli {
    /// Config file (default: ~/.foreman/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured log level.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one delivery task and print the workflow outcome as JSON.
    Run(commands::run::RunArgs),

    /// Inspect or modify stored agent context.
    Context {
        #[command(subcommand)]
        command: ContextCommand,
    },

    /// Show or validate configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum ContextCommand {
    /// Save a JSON payload as the agent's context.
    Save {
        #[arg(long)]
        agent: Uuid,
        #[arg(long)]
        tenant: String,
        /// Inline JSON payload.
        #[arg(long, conflicts_with = "file")]
        data: Option<String>,
        /// Read the payload from a file.
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Print the newest context for an agent.
    Recover {
        #[arg(long)]
        agent: Uuid,
        #[arg(long)]
        tenant: String,
    },
    /// Report per-tier availability for an agent.
    Health {
        #[arg(long)]
        agent: Uuid,
        #[arg(long)]
        tenant: String,
    },
    /// Remove an agent's context from every tier.
    Delete {
        #[arg(long)]
        agent: Uuid,
        #[arg(long)]
        tenant: String,
    },
    /// Move Recent-tier snapshots older than the cutoff to the archive.
    Archive {
        /// Age in seconds (default: context.archive_after_secs).
        #[arg(long)]
        older_than_secs: Option<u64>,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration as TOML.
    Show,
    /// Validate a config file without running anything.
    Check {
        /// File to check (default: the --config file or ~/.foreman/config.toml).
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // `config check` reports on broken files instead of failing to start.
    if let Commands::Config {
        command: ConfigCommand::Check { path },
    } = &cli.command
    {
        return commands::config::check(path.as_deref().or(cli.config.as_deref()));
    }

    let config = commands::load_config(cli.config.as_deref())?;
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.general.log_level.clone());
    fm_telemetry::logging::init("foreman", &level, cli.json_logs || config.general.json_logs);

    match cli.command {
        Commands::Run(args) => commands::run::run(config, args).await,
        Commands::Context { command } => match command {
            ContextCommand::Save {
                agent,
                tenant,
                data,
                file,
            } => commands::context::save(&config, agent, &tenant, data, file).await,
            ContextCommand::Recover { agent, tenant } => {
                commands::context::recover(&config, agent, &tenant).await
            }
            ContextCommand::Health { agent, tenant } => {
                commands::context::health(&config, agent, &tenant).await
            }
            ContextCommand::Delete { agent, tenant } => {
                commands::context::delete(&config, agent, &tenant).await
            }
            ContextCommand::Archive { older_than_secs } => {
                commands::context::archive(&config, older_than_secs).await
            }
        },
        Commands::Config { command } => match command {
            ConfigCommand::Show => commands::config::show(&config),
            ConfigCommand::Check { .. } => Ok(()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_inline_task() {
        let cli = Cli::try_parse_from([
            "foreman",
            "run",
            "--kind",
            "fix-bug",
            "--tenant",
            "acme",
            "--max-retries",
            "2",
            "--metrics",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let task = args.task().unwrap();
        assert_eq!(task.tenant_id, "acme");
        assert_eq!(task.max_retries, Some(2));
        assert!(args.metrics);
    }

    #[test]
    fn context_save_rejects_data_and_file_together() {
        let agent = Uuid::new_v4().to_string();
        let parsed = Cli::try_parse_from([
            "foreman", "context", "save", "--agent", &agent, "--tenant", "acme", "--data", "{}",
            "--file", "ctx.json",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::try_parse_from(["foreman", "config", "show", "--json-logs"]).unwrap();
        assert!(cli.json_logs);
        assert!(matches!(
            cli.command,
            Commands::Config {
                command: ConfigCommand::Show
            }
        ));
    }
}
