use clap::{Parser, Subcommand};
use node_plugin::LogLevel;
use rtdb_flow::{
    flow_commands::{check_path_arg, migrate_flow_file},
    logger::init_tracing,
    schema::write_schema,
};
use std::{path::PathBuf, process};
use tracing::error;

#[derive(Parser, Debug)]
#[command(
    name = "rtdb-flow",
    about = "Realtime database nodes for flow runtimes",
    version
)]
struct Cli {
    /// Log level or filter directive (e.g. error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Directory for the rolling log file
    #[arg(long, global = true, default_value = "logs")]
    log_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upgrade legacy node configs in a flow export
    Migrate {
        file: PathBuf,

        /// Report what would change without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Validate a database path
    CheckPath { path: String },

    /// Emit JSON-Schema for the node configs
    Schema {
        #[arg(long, default_value = "schemas")]
        out_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let logger = init_tracing(cli.log_dir.clone(), "rtdb-flow.log".to_string(), cli.log_level.clone())?;

    match cli.command {
        Commands::Migrate { file, dry_run } => {
            let changed = migrate_flow_file(&file, dry_run)?;
            let verb = if dry_run { "would change" } else { "changed" };
            logger.log(LogLevel::Info, "migrate", &format!("{changed} node(s) {verb} in {}", file.display()));
            println!("✅ {changed} node(s) {verb}.");
            Ok(())
        }
        Commands::CheckPath { path } => match check_path_arg(&path) {
            Ok(()) => {
                println!("✅ `{path}` is a valid path.");
                Ok(())
            }
            Err(err) => {
                error!(%path, %err, "invalid path");
                eprintln!("❌ {err}");
                process::exit(1);
            }
        },
        Commands::Schema { out_dir } => {
            let written = write_schema(&out_dir)?;
            println!("Schemas written to {}: {}", out_dir.display(), written.join(", "));
            Ok(())
        }
    }
}
