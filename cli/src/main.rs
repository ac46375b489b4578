//! PortBridge CLI - Manage Kubernetes port-forward tunnels
//!
//! A command-line tool for configuring port-forward connections,
//! running them in the foreground, and browsing cluster services.

mod commands;
mod deps;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "portbridge")]
#[command(author, version, about = "Manage Kubernetes port-forward tunnels")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured connections
    #[command(alias = "ls")]
    List,

    /// Add a connection
    Add {
        /// Display name
        name: String,
        /// Kubernetes namespace
        namespace: String,
        /// Service name
        service: String,
        /// Local port to bind
        local_port: u16,
        /// Service-side port
        remote_port: u16,

        /// Extra relay port (for loopback-only or busy local ports)
        #[arg(long)]
        proxy_port: Option<u16>,

        /// Exclude from "start all"
        #[arg(long)]
        disabled: bool,

        /// Do not restart automatically after failures
        #[arg(long)]
        no_reconnect: bool,

        /// Fixed local port instead of the ephemeral direct-exec strategy
        #[arg(long)]
        simple: bool,
    },

    /// Remove a connection
    #[command(alias = "rm")]
    Remove {
        /// Connection name or id
        connection: String,
    },

    /// Run connections in the foreground until Ctrl-C
    #[command(alias = "up")]
    Start {
        /// Connection names or ids; all enabled connections when empty
        connections: Vec<String>,
    },

    /// Show which configured ports are currently reachable
    Status,

    /// List cluster namespaces
    Namespaces,

    /// List services in a namespace
    Services {
        /// Namespace to list
        namespace: String,
    },

    /// Show or change settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current settings
    Show,
    /// Change a setting
    Set {
        /// auto-start | notifications | refresh-interval
        key: String,
        /// New value
        value: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::List => commands::list::run(cli.json).await,
        Commands::Add {
            name,
            namespace,
            service,
            local_port,
            remote_port,
            proxy_port,
            disabled,
            no_reconnect,
            simple,
        } => {
            commands::add::run(commands::add::AddArgs {
                name,
                namespace,
                service,
                local_port,
                remote_port,
                proxy_port,
                disabled,
                no_reconnect,
                simple,
            })
            .await
        }
        Commands::Remove { connection } => commands::remove::run(&connection).await,
        Commands::Start { connections } => commands::start::run(connections).await,
        Commands::Status => commands::status::run(cli.json).await,
        Commands::Namespaces => commands::discover::namespaces(cli.json).await,
        Commands::Services { namespace } => commands::discover::services(&namespace, cli.json).await,
        Commands::Config { action } => match action {
            None | Some(ConfigAction::Show) => commands::config::show().await,
            Some(ConfigAction::Set { key, value }) => commands::config::set(&key, &value).await,
        },
    }
}
