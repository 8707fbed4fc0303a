//! # ydev2db CLI
//!
//! ## Usage
//!
//! ```bash
//! ydev2db --config ./config/ydev2db.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ydev2db configure` | Write a configuration template |
//! | `ydev2db check` | Validate the configuration |
//! | `ydev2db collect` | Collect device data until interrupted |
//! | `ydev2db read` | Print the most recent rows of a table |
//! | `ydev2db sql "<statement>"` | Run a SQL statement |
//! | `ydev2db show databases\|tables\|schema <t>` | Inspect the server |
//! | `ydev2db db create\|drop <name>` | Manage the database |
//! | `ydev2db table create\|drop <name>` | Manage tables |
//! | `ydev2db autostart enable\|disable` | Start on boot via systemd |

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use ydev2db::ingest::IngestSettings;
use ydev2db::progress::ProgressMode;
use ydev2db::{admin, autostart, config, ingest, logging, scaffold};

/// ydev2db: store device telemetry from a remote MQTT broker in MySQL.
#[derive(Parser)]
#[command(
    name = "ydev2db",
    about = "Store device telemetry from a remote MQTT broker in MySQL",
    version,
    long_about = "ydev2db reaches an MQTT broker through an SSH tunnel, subscribes to a \
    device's topics and stores every message as a row in MySQL, reconnecting whenever the \
    tunnel, the broker or the database fails."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ydev2db.toml")]
    config: PathBuf,

    /// Table to use instead of one table per unit name.
    #[arg(long, global = true)]
    table: Option<String>,

    /// Debug logging. Collect errors stop the program instead of retrying.
    #[arg(long, global = true)]
    debug: bool,

    /// Also write logs to this file.
    #[arg(long, global = true)]
    log: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration template to the `--config` path.
    Configure,

    /// Load and validate the configuration, then print the table schema.
    Check,

    /// Collect device data until interrupted.
    Collect {
        /// Display each device message before storing it.
        #[arg(long)]
        show: bool,
        /// Display every message on the broker without storing anything.
        #[arg(long)]
        show_all: bool,
        /// Progress output on stderr.
        #[arg(long, value_enum, default_value = "human")]
        progress: ProgressMode,
    },

    /// Print the most recent rows of a table, newest first.
    ///
    /// Reads the `--table` table, or the one named after the device.
    Read {
        /// Number of rows.
        #[arg(long, default_value_t = admin::DEFAULT_READ_COUNT)]
        count: u64,
    },

    /// Execute a SQL statement and print the rows it returns.
    Sql {
        statement: String,
    },

    /// Inspect the database server.
    Show {
        #[command(subcommand)]
        what: ShowAction,
    },

    /// Create or delete a database.
    Db {
        #[command(subcommand)]
        action: DbAction,
    },

    /// Create or delete a table using the configured schema.
    Table {
        #[command(subcommand)]
        action: TableAction,
    },

    /// Start collecting when the computer boots.
    Autostart {
        #[command(subcommand)]
        action: AutostartAction,
    },
}

#[derive(Subcommand)]
enum ShowAction {
    /// List databases on the server.
    Databases,
    /// List tables in the configured database.
    Tables,
    /// Describe a table's columns.
    Schema { table: String },
}

#[derive(Subcommand)]
enum DbAction {
    Create {
        name: String,
    },
    Drop {
        name: String,
        /// Confirm the deletion.
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum TableAction {
    Create {
        name: String,
    },
    Drop {
        name: String,
        /// Confirm the deletion.
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum AutostartAction {
    /// Install and enable a systemd unit.
    Enable {
        /// Install a system unit running as this user instead of a user unit.
        #[arg(long)]
        user: Option<String>,
    },
    /// Disable and remove the systemd unit.
    Disable,
}

/// Device messages are displayed through the progress reporter.
fn check_display_mode(show: bool, show_all: bool, progress: ProgressMode) -> anyhow::Result<()> {
    if (show || show_all) && progress == ProgressMode::Off {
        let flag = if show_all { "--show-all" } else { "--show" };
        anyhow::bail!("{} needs progress output; use --progress human or json", flag);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _flusher = logging::init_tracing(cli.debug, cli.log.as_deref())?;

    // Commands that don't require config
    match &cli.command {
        Commands::Configure => {
            scaffold::write_config_template(&cli.config)?;
            return Ok(());
        }
        Commands::Autostart {
            action: AutostartAction::Disable,
        } => {
            autostart::disable()?;
            return Ok(());
        }
        _ => {}
    }

    let cfg = config::load_config(&cli.config)?;
    let table = cli.table.clone().unwrap_or_else(|| cfg.device.name.clone());

    match cli.command {
        Commands::Check => {
            let schema = cfg.table_schema()?;
            println!("Configuration OK: {}", cli.config.display());
            println!("Topic: {}", cfg.device.topic());
            println!("{:<24} TYPE", "COLUMN");
            for column in schema.columns() {
                println!("{:<24} {}", column.name, column.sql_type);
            }
        }
        Commands::Collect {
            show,
            show_all,
            progress,
        } => {
            check_display_mode(show, show_all, progress)?;
            let mut settings = IngestSettings::from_config(&cfg);
            settings.table_override = cli.table;
            settings.show = show;
            settings.show_all = show_all;
            settings.debug = cli.debug;
            ingest::run_collect(&cfg, settings, progress.reporter()).await?;
        }
        Commands::Read { count } => {
            admin::run_read(&cfg, &table, count).await?;
        }
        Commands::Sql { statement } => {
            admin::run_sql(&cfg, &statement).await?;
        }
        Commands::Show { what } => match what {
            ShowAction::Databases => admin::show_databases(&cfg).await?,
            ShowAction::Tables => admin::show_tables(&cfg).await?,
            ShowAction::Schema { table } => admin::show_schema(&cfg, &table).await?,
        },
        Commands::Db { action } => match action {
            DbAction::Create { name } => admin::create_database(&cfg, &name).await?,
            DbAction::Drop { name, yes } => admin::drop_database(&cfg, &name, yes).await?,
        },
        Commands::Table { action } => match action {
            TableAction::Create { name } => {
                admin::create_table(&cfg, &name, &cfg.table_schema()?).await?
            }
            TableAction::Drop { name, yes } => admin::drop_table(&cfg, &name, yes).await?,
        },
        Commands::Autostart { action } => match action {
            AutostartAction::Enable { user } => {
                autostart::enable(&cli.config, cli.log.as_deref(), user.as_deref())?;
            }
            AutostartAction::Disable => {
                // Handled above (before config loading)
                unreachable!()
            }
        },
        Commands::Configure => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_needs_progress_output() {
        assert!(check_display_mode(true, false, ProgressMode::Off).is_err());
        assert!(check_display_mode(false, true, ProgressMode::Off).is_err());
        assert!(check_display_mode(true, false, ProgressMode::Json).is_ok());
        assert!(check_display_mode(false, false, ProgressMode::Off).is_ok());
    }
}
