//! `fi-mcp`: command-line host for the MCP client.
//!
//! Discovers tools, dispatches single calls (optionally walking through the
//! login flow interactively) and probes configured servers. Output is JSON on
//! stdout; logs go to stderr or, with `--log-file`, to the rotating log in the
//! data directory.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use fi_mcp_client::mcp_client::config::{find_config_path, load_config, CONFIG_PATH_ENV};
use fi_mcp_client::{data_dir, init_tracing, LogTarget, McpClient, ToolCallResult};

#[derive(Parser)]
#[command(name = "fi-mcp", version, about = "MCP client for the Fi financial-advisor tool servers")]
struct Cli {
    /// Server registry file (JSON or YAML)
    #[arg(long, global = true, env = CONFIG_PATH_ENV)]
    config: Option<PathBuf>,

    /// Write logs to the rotating log file in the data directory
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Discover tools and print their function declarations
    ListTools,
    /// Call one tool by its prefixed name
    Call(CallArgs),
    /// Check reachability of every configured server
    Probe,
}

#[derive(Args)]
struct CallArgs {
    /// Prefixed tool name, e.g. `fi_mcp_fetch_net_worth`
    name: String,
    /// Tool arguments as a JSON object
    #[arg(long, default_value = "{}")]
    args: String,
    /// On a login prompt, wait for the login to finish and retry once
    #[arg(long)]
    interactive_login: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let target = if cli.log_file {
        LogTarget::File(data_dir())
    } else {
        LogTarget::Stderr
    };
    init_tracing(target).context("failed to initialize logging")?;

    let config_path = match cli.config {
        Some(path) => path,
        None => {
            let cwd = std::env::current_dir().context("failed to read current directory")?;
            find_config_path(&cwd)?
        }
    };
    let config = load_config(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let client = McpClient::from_config(config)?;

    let outcome = run(&client, cli.command).await;
    client.shutdown().await;
    outcome
}

async fn run(client: &McpClient, command: Command) -> Result<()> {
    match command {
        Command::ListTools => {
            let tools = client.get_tools().await;
            print_json(&tools)
        }
        Command::Call(args) => call(client, args).await,
        Command::Probe => {
            let mut report = serde_json::Map::new();
            for server in client.configured_servers() {
                let reachable = client.probe(&server).await;
                report.insert(server, serde_json::Value::Bool(reachable));
            }
            print_json(&report)
        }
    }
}

async fn call(client: &McpClient, args: CallArgs) -> Result<()> {
    let arguments: serde_json::Value =
        serde_json::from_str(&args.args).context("--args must be valid JSON")?;

    // Discovery fills the catalog used for argument validation.
    client.list_tools().await;

    let result = client.call_tool(&args.name, arguments.clone()).await;
    let result = match (&result, args.interactive_login) {
        (ToolCallResult::AuthRequired(auth), true) => {
            eprintln!("Login required for '{}'. Open:\n\n  {}\n", auth.server, auth.login_url);
            eprintln!("Press Enter once the login has completed.");
            wait_for_enter().await?;

            let callback = client
                .mark_session_authenticated(&auth.server, &auth.session_id)
                .await;
            if !callback.success {
                anyhow::bail!(
                    "authentication failed: {}",
                    callback.error.unwrap_or_default()
                );
            }
            client.call_tool(&args.name, arguments).await
        }
        _ => result,
    };

    print_json(&result)
}

async fn wait_for_enter() -> Result<()> {
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("failed to read stdin")?;
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
