//! CLI commands for Switchboard using clap.

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::{load_settings_or_default, Settings};
use crate::mcp::{http::run_server, stdio::run_stdio, McpServer, ToolRegistry};
use crate::storage::Store;
use crate::system::System;

/// Switchboard - multi-agent customer service over A2A and MCP.
#[derive(Parser)]
#[command(name = "switchboard")]
#[command(version)]
#[command(about = "Switchboard - multi-agent customer service", long_about = None)]
pub struct Commands {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Serve the MCP tool server over HTTP, or stdio with --stdio
    Serve {
        /// Bind address (defaults to settings)
        #[arg(long)]
        host: Option<String>,

        /// Port (defaults to settings)
        #[arg(short, long)]
        port: Option<u16>,

        /// Speak newline-delimited JSON-RPC on stdin/stdout instead of HTTP
        #[arg(long, conflicts_with_all = ["host", "port"])]
        stdio: bool,
    },

    /// Ask the agent system a question
    Ask {
        /// The customer's query
        query: String,

        /// Caller's customer id, used when the query names none
        #[arg(short, long)]
        customer: Option<i64>,

        /// Call tools on a running server instead of in-process
        #[arg(long)]
        remote: Option<String>,

        /// Print the full answer as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create the database and load sample data
    Seed,

    /// Print the tool catalog
    Tools,
}

impl Commands {
    /// Run the command.
    pub async fn run(&self) -> Result<()> {
        let settings = load_settings_or_default();
        match &self.command {
            Command::Serve { host, port, stdio } => {
                cmd_serve(&settings, host.as_deref(), *port, *stdio).await
            }
            Command::Ask {
                query,
                customer,
                remote,
                json,
            } => cmd_ask(settings, query, *customer, remote.clone(), *json).await,
            Command::Seed => cmd_seed(&settings),
            Command::Tools => cmd_tools(&settings),
        }
    }
}

// Command implementations

async fn cmd_serve(
    settings: &Settings,
    host: Option<&str>,
    port: Option<u16>,
    stdio: bool,
) -> Result<()> {
    let path = settings.storage.database_path()?;
    let store = Store::open(&path)?;
    tracing::info!("Serving customer database {}", path.display());

    let server = McpServer::new(store, ToolRegistry::catalog(settings.mcp.premium_min_tickets)?);
    if stdio {
        // stdout belongs to the protocol
        return run_stdio(server).await;
    }
    let host = host.unwrap_or(&settings.mcp.bind);
    let port = port.unwrap_or(settings.mcp.port);
    println!("MCP server listening on http://{}:{}/mcp", host, port);
    run_server(server, host, port).await
}

async fn cmd_ask(
    mut settings: Settings,
    query: &str,
    customer: Option<i64>,
    remote: Option<String>,
    json: bool,
) -> Result<()> {
    if remote.is_some() {
        settings.mcp.remote_url = remote;
    }
    // A remote server owns its own store.
    let store = match settings.mcp.remote_url {
        Some(_) => Store::open_in_memory()?,
        None => Store::open(&settings.storage.database_path()?)?,
    };

    let system = System::start(&settings, store)?;
    let answer = system.ask(query, customer).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&answer)?);
        return Ok(());
    }

    println!("{}", answer.text);
    if !answer.manifest.is_empty() {
        println!();
        for entry in &answer.manifest {
            println!(
                "  {} {} [{}] {}",
                entry.sub_intent,
                entry.intent,
                entry.status.as_str(),
                entry.reason
            );
        }
    }
    Ok(())
}

fn cmd_seed(settings: &Settings) -> Result<()> {
    let path = settings.storage.database_path()?;
    let store = Store::open(&path)?;
    if store.seed_sample_data()? {
        println!("Seeded sample data into {}", path.display());
    } else {
        println!("{} already has customers; nothing to do", path.display());
    }
    Ok(())
}

fn cmd_tools(settings: &Settings) -> Result<()> {
    let catalog = ToolRegistry::catalog(settings.mcp.premium_min_tickets)?;
    let tools: Vec<serde_json::Value> = catalog.iter().map(|tool| tool.describe()).collect();
    println!("{}", serde_json::to_string_pretty(&tools)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ask() {
        let args = Commands::try_parse_from([
            "switchboard",
            "ask",
            "Show my ticket history",
            "--customer",
            "5",
            "--json",
        ])
        .unwrap();
        match args.command {
            Command::Ask {
                query,
                customer,
                remote,
                json,
            } => {
                assert_eq!(query, "Show my ticket history");
                assert_eq!(customer, Some(5));
                assert!(remote.is_none());
                assert!(json);
            }
            _ => panic!("expected ask"),
        }
    }

    #[test]
    fn test_parse_serve_overrides() {
        let args = Commands::try_parse_from(["switchboard", "serve", "--port", "9000"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Serve {
                host: None,
                port: Some(9000),
                stdio: false
            }
        ));
    }

    #[test]
    fn test_parse_serve_stdio() {
        let args = Commands::try_parse_from(["switchboard", "serve", "--stdio"]).unwrap();
        assert!(matches!(args.command, Command::Serve { stdio: true, .. }));
        assert!(Commands::try_parse_from(["switchboard", "serve", "--stdio", "--port", "9000"]).is_err());
    }

    #[test]
    fn test_ask_requires_query() {
        assert!(Commands::try_parse_from(["switchboard", "ask"]).is_err());
    }
}
