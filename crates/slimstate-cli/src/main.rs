use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use anyhow::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use slimstate_catalog::{PostgresWarehouse, Warehouse};
use slimstate_core::{Config, NodeStatus, WarehouseConfig};
use slimstate_engine::{Command, Invocation, InvocationError, InvocationResult, Runner};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// slimstate - stateful dbt invocations with deferral to prior state
#[derive(Parser)]
#[command(name = "slimstate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: slimstate.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load seed files into the target
    Seed(InvocationArgs),

    /// Build models
    Run(InvocationArgs),

    /// Run data tests
    Test(InvocationArgs),

    /// Build snapshots
    Snapshot(InvocationArgs),

    /// Render SQL without executing it
    Compile(InvocationArgs),

    /// Documentation artifacts
    Docs {
        #[command(subcommand)]
        command: DocsCommands,
    },
}

#[derive(Subcommand)]
enum DocsCommands {
    /// Write catalog.json for the selected nodes
    Generate(InvocationArgs),
}

#[derive(Args, Debug, Clone, Default)]
struct InvocationArgs {
    /// Nodes to include (e.g. `view_model+`, `resource_type:seed`)
    #[arg(short = 'm', long = "select", alias = "models", short_alias = 's')]
    select: Option<String>,

    /// Target profile to build into
    #[arg(short, long)]
    target: Option<String>,

    /// Directory containing the prior-state manifest.json
    #[arg(long)]
    state: Option<PathBuf>,

    /// Resolve unselected upstream nodes from --state when they are missing here
    #[arg(long)]
    defer: bool,

    /// With --defer, always prefer the prior-state definition
    #[arg(long)]
    favor_state: bool,

    /// Project variables as a JSON object
    #[arg(long)]
    vars: Option<String>,
}

impl InvocationArgs {
    fn into_invocation(self, command: Command) -> Result<Invocation> {
        let mut invocation = Invocation::new(command);
        invocation.select = self.select;
        invocation.target = self.target;
        invocation.state_path = self.state;
        invocation.defer = self.defer;
        invocation.favor_state = self.favor_state;

        if let Some(vars) = self.vars {
            invocation.vars = parse_vars(&vars)?;
        }

        Ok(invocation)
    }
}

fn parse_vars(raw: &str) -> Result<HashMap<String, serde_json::Value>> {
    serde_json::from_str(raw).map_err(|e| {
        InvocationError::Usage(format!("--vars must be a JSON object: {}", e)).into()
    })
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let (command, args) = match cli.command {
        Commands::Seed(args) => (Command::Seed, args),
        Commands::Run(args) => (Command::Run, args),
        Commands::Test(args) => (Command::Test, args),
        Commands::Snapshot(args) => (Command::Snapshot, args),
        Commands::Compile(args) => (Command::Compile, args),
        Commands::Docs { command: DocsCommands::Generate(args) } => (Command::DocsGenerate, args),
    };

    match invoke(cli.config.as_deref(), command, args, cli.verbose).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            std::process::exit(exit_code(&e));
        }
    }
}

/// Usage errors exit with 2, everything else with 1
fn exit_code(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<InvocationError>() {
        Some(e) if e.is_usage() => 2,
        _ => 1,
    }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_config(path: Option<&Path>, verbose: bool) -> Result<Config> {
    let config = if let Some(config_path) = path {
        Config::from_file(config_path)?
    } else if Path::new("slimstate.toml").exists() {
        Config::from_file(Path::new("slimstate.toml"))?
    } else {
        if verbose {
            eprintln!("{}", "No config file found, using defaults".yellow());
        }
        Config::default()
    };

    Ok(config)
}

async fn invoke(config_path: Option<&Path>, command: Command, args: InvocationArgs, verbose: bool) -> Result<bool> {
    let config = load_config(config_path, verbose)?;
    let invocation = args.into_invocation(command)?;

    // Reject bad flag combinations before touching the warehouse
    invocation.policy()?;

    let warehouse_config = config.warehouse.as_ref().ok_or_else(|| {
        anyhow::anyhow!(
            "No warehouse configuration found in slimstate.toml. \
             Add a [warehouse] section with type and connection settings."
        )
    })?;

    match warehouse_config.warehouse_type.to_lowercase().as_str() {
        "postgres" | "postgresql" | "redshift" => {
            if verbose {
                eprintln!("{} {}...", "Connecting to".cyan(), warehouse_config.warehouse_type);
            }
            let warehouse = connect_postgres(warehouse_config).await?;
            execute(&config, &warehouse, &invocation, verbose).await
        }
        _ => Err(anyhow::anyhow!(
            "Unsupported warehouse type '{}'. Supported: postgres",
            warehouse_config.warehouse_type
        )),
    }
}

async fn connect_postgres(warehouse_config: &WarehouseConfig) -> Result<PostgresWarehouse> {
    let settings = &warehouse_config.settings;
    let setting = |key: &str, env: &str| settings.get(key).cloned().or_else(|| std::env::var(env).ok());

    let host = setting("host", "PGHOST").unwrap_or_else(|| "localhost".to_string());
    let port = setting("port", "PGPORT").unwrap_or_else(|| "5432".to_string());
    let database = settings
        .get("dbname")
        .cloned()
        .or_else(|| setting("database", "PGDATABASE"))
        .ok_or_else(|| anyhow::anyhow!("PostgreSQL requires 'dbname' in warehouse settings"))?;
    let user = setting("user", "PGUSER")
        .ok_or_else(|| anyhow::anyhow!("PostgreSQL requires 'user' in warehouse settings"))?;

    let mut conn_str = format!("host={} port={} dbname={} user={}", host, port, database, user);
    if let Some(password) = setting("password", "PGPASSWORD") {
        conn_str.push_str(&format!(" password={}", password));
    }

    let tls = settings
        .get("sslmode")
        .is_some_and(|mode| mode != "disable" && mode != "prefer");

    let warehouse = if tls {
        PostgresWarehouse::from_connection_string_with_tls(&conn_str).await
    } else {
        PostgresWarehouse::from_connection_string(&conn_str).await
    };

    warehouse.map_err(|e| anyhow::anyhow!("Failed to connect to warehouse: {}", e))
}

async fn execute<W: Warehouse>(config: &Config, warehouse: &W, invocation: &Invocation, verbose: bool) -> Result<bool> {
    warehouse
        .test_connection()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to warehouse: {}", e))?;

    if verbose {
        eprintln!("{}", "✓ Connection successful".green());
        eprintln!("{} {}", "Running".cyan(), invocation.command);
    }

    let result = Runner::new(config, warehouse).run(invocation).await?;
    print_summary(&result, &config.resolve_path(&config.target_path));

    Ok(result.success())
}

fn print_summary(result: &InvocationResult, target_dir: &Path) {
    let report = &result.report;

    println!("{}", "=".repeat(60).bright_blue());
    println!(
        "{} {} (target: {})",
        "slimstate".bold(),
        report.invocation.command.bold(),
        report.invocation.target
    );
    println!("{}", "=".repeat(60).bright_blue());

    for node in &report.results {
        let label = format!("{:<9}", node.status.to_string().to_uppercase());
        let status = match node.status {
            NodeStatus::Success | NodeStatus::Pass => label.green(),
            NodeStatus::Compiled => label.cyan(),
            NodeStatus::Fail | NodeStatus::Error => label.red().bold(),
            NodeStatus::Skipped => label.yellow(),
        };

        match &node.relation {
            Some(relation) => println!("  {} {} {}", status, node.name, relation.dimmed()),
            None => println!("  {} {}", status, node.name),
        }

        if let Some(message) = &node.message {
            if node.status.is_failure() || node.status == NodeStatus::Skipped {
                println!("            {}", message.red());
            }
        }
    }

    if !result.resolution.deferred.is_empty() {
        println!();
        println!("{} {} upstream node(s) from state:", "Deferred".cyan(), result.resolution.deferred.len());
        for id in &result.resolution.deferred {
            let relation = result
                .manifest
                .nodes
                .get(id)
                .and_then(|node| node.relation())
                .map(|r| r.render())
                .unwrap_or_default();
            println!("  {} {}", id, relation.dimmed());
        }
    }

    for warning in &report.warnings {
        println!("{} {}", "Warning:".yellow().bold(), warning);
    }

    println!();
    let summary = &report.summary;
    let line = format!(
        "Done. {} total, {} succeeded, {} failed, {} skipped",
        summary.total, summary.succeeded, summary.failed, summary.skipped
    );
    if report.success() {
        println!("{}", line.green().bold());
    } else {
        println!("{}", line.red().bold());
    }

    if let Some(catalog) = &result.catalog {
        println!("{} {} catalog entries", "Documented".cyan(), catalog.nodes.len());
    }
    println!("{} {}", "Artifacts written to".cyan(), target_dir.display());
}
