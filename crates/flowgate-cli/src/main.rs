//! Flowgate CLI — manage tool servers and run workflows from the shell.

use clap::{Parser, Subcommand};

use flowgate_cli::commands;
use flowgate_cli::commands::server::AddServerArgs;
use flowgate_cli::commands::workflow::RunArgs;

/// Flowgate — tool-server connections and durable workflows
#[derive(Parser)]
#[command(name = "flowgate", version, about = "Flowgate — tool-server connections and durable workflows")]
pub struct Cli {
    /// Engine configuration file (YAML)
    #[arg(long, env = "FLOWGATE_CONFIG")]
    config: Option<String>,

    /// Path to the SQLite database file (overrides the config file)
    #[arg(long, env = "FLOWGATE_DB_PATH")]
    db: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage tool servers
    Server {
        #[command(subcommand)]
        action: ServerAction,
    },

    /// Publish and run workflows
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },
}

#[derive(Subcommand)]
enum ServerAction {
    /// Register a tool server
    Add {
        /// Server name
        #[arg(long)]
        name: String,
        /// Transport: local-process or remote-endpoint
        #[arg(long, default_value = "local-process")]
        transport: String,
        /// Launch command (local-process)
        #[arg(long)]
        command: Option<String>,
        /// Launch argument, repeatable (local-process)
        #[arg(long = "arg", allow_hyphen_values = true)]
        args: Vec<String>,
        /// Environment variable KEY=VALUE, repeatable (local-process)
        #[arg(long)]
        env: Vec<String>,
        /// Working directory (local-process)
        #[arg(long)]
        cwd: Option<String>,
        /// Endpoint URL (remote-endpoint)
        #[arg(long)]
        url: Option<String>,
        /// HTTP header KEY=VALUE, repeatable (remote-endpoint)
        #[arg(long = "header")]
        headers: Vec<String>,
    },
    /// List registered servers with their connection state
    List,
    /// Show one server
    Status {
        server_id: String,
    },
    /// Connect a server and list its tools
    Connect {
        server_id: String,
    },
    /// Disconnect a server
    Disconnect {
        server_id: String,
    },
    /// Unregister a server
    Remove {
        server_id: String,
    },
    /// List discovered tools
    Tools {
        /// Only this server's tools
        #[arg(long)]
        server: Option<String>,
        /// Include tools of servers that are no longer connected
        #[arg(long)]
        include_stale: bool,
    },
    /// Call a tool on a server
    Call {
        server_id: String,
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
        /// Request timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Validate and publish a workflow definition (YAML or JSON)
    Import {
        file: String,
    },
    /// List published workflows
    List,
    /// Run a published workflow and wait for it to finish
    Run {
        workflow_id: String,
        /// Execution input as JSON
        #[arg(long)]
        input: Option<String>,
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long)]
        user_id: Option<String>,
        /// Idempotency key; repeating it returns the first execution
        #[arg(long)]
        request_key: Option<String>,
    },
    /// List executions
    Executions {
        #[arg(long)]
        workflow_id: Option<String>,
        /// pending, running, completed, failed or cancelled
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show every step attempt of an execution
    History {
        execution_id: String,
    },
    /// Cancel a running execution
    Cancel {
        execution_id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowgate_core=info,flowgate_cli=info".into()),
        )
        .init();

    let Some(command) = cli.command else {
        use clap::CommandFactory;
        Cli::command().print_help().ok();
        println!();
        return;
    };

    let state = match commands::load_config(cli.config.as_deref(), cli.db.as_deref()) {
        Ok(config) => commands::init_state(config).await,
        Err(e) => Err(e),
    };
    let state = match state {
        Ok(state) => state,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let result = match command {
        Commands::Server { action } => match action {
            ServerAction::Add {
                name,
                transport,
                command,
                args,
                env,
                cwd,
                url,
                headers,
            } => commands::server::add(
                &state,
                AddServerArgs {
                    name,
                    transport,
                    command,
                    args,
                    env,
                    cwd,
                    url,
                    headers,
                },
            )
            .await
            .map(|_| ()),
            ServerAction::List => commands::server::list(&state).await,
            ServerAction::Status { server_id } => commands::server::status(&state, &server_id).await,
            ServerAction::Connect { server_id } => {
                commands::server::connect(&state, &server_id).await
            }
            ServerAction::Disconnect { server_id } => {
                commands::server::disconnect(&state, &server_id).await
            }
            ServerAction::Remove { server_id } => commands::server::remove(&state, &server_id).await,
            ServerAction::Tools {
                server,
                include_stale,
            } => commands::server::tools(&state, server.as_deref(), include_stale).await,
            ServerAction::Call {
                server_id,
                tool,
                args,
                timeout_ms,
            } => commands::server::call(&state, &server_id, &tool, &args, timeout_ms).await,
        },

        Commands::Workflow { action } => match action {
            WorkflowAction::Import { file } => {
                commands::workflow::import(&state, &file).await.map(|_| ())
            }
            WorkflowAction::List => commands::workflow::list(&state).await,
            WorkflowAction::Run {
                workflow_id,
                input,
                session_id,
                user_id,
                request_key,
            } => commands::workflow::run(
                &state,
                RunArgs {
                    workflow_id,
                    input,
                    session_id,
                    user_id,
                    request_key,
                },
            )
            .await
            .map(|_| ()),
            WorkflowAction::Executions {
                workflow_id,
                status,
                limit,
            } => {
                commands::workflow::executions(&state, workflow_id.as_deref(), status.as_deref(), limit)
                    .await
            }
            WorkflowAction::History { execution_id } => {
                commands::workflow::history(&state, &execution_id).await
            }
            WorkflowAction::Cancel { execution_id } => {
                commands::workflow::cancel(&state, &execution_id).await
            }
        },
    };

    state.shutdown().await;

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
