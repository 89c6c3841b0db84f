//! CLI argument parsing definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mcpproxy", author, version, about = "Security-enforcing MCP proxy", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the proxy daemon
    Serve {
        /// TCP listen address
        #[arg(long, value_name = "ADDR")]
        listen: Option<String>,

        /// Data directory
        #[arg(long, value_name = "PATH")]
        data_dir: Option<PathBuf>,

        /// API key required on the TCP listener
        #[arg(long, value_name = "KEY")]
        api_key: Option<String>,

        /// Local IPC endpoint (unix:///path)
        #[arg(long, value_name = "ENDPOINT")]
        tray_endpoint: Option<String>,
    },

    /// Manage upstream servers
    Upstream {
        #[command(subcommand)]
        upstream_cmd: UpstreamCommands,
    },

    /// Manage OAuth authorization for upstream servers
    Auth {
        #[command(subcommand)]
        auth_cmd: AuthCommands,
    },

    /// Search the tool retrieval index
    Tools {
        #[command(subcommand)]
        tools_cmd: ToolsCommands,
    },

    /// Call an upstream tool through the proxy
    Call {
        #[command(subcommand)]
        call_cmd: CallCommands,
    },

    /// Inspect the activity log
    Activity {
        #[command(subcommand)]
        activity_cmd: ActivityCommands,
    },

    /// Agent hook integration
    Hook {
        #[command(subcommand)]
        hook_cmd: HookCommands,
    },

    /// Print diagnostics including the security coverage mode
    Doctor,
}

#[derive(Subcommand)]
pub enum UpstreamCommands {
    /// List configured upstream servers
    List,

    /// Add an upstream server
    Add {
        /// Server name
        #[arg(long, value_name = "NAME")]
        name: String,

        /// Transport protocol: stdio, http, sse
        #[arg(long, value_name = "PROTO", default_value = "stdio")]
        protocol: String,

        /// Endpoint URL (http/sse)
        #[arg(long, value_name = "URL")]
        url: Option<String>,

        /// Command to execute (stdio)
        #[arg(long, value_name = "CMD")]
        command: Option<String>,

        /// Command arguments (repeatable)
        #[arg(long = "arg", value_name = "ARG")]
        args: Vec<String>,
    },

    /// Remove an upstream server
    Remove {
        #[arg(value_name = "NAME")]
        name: String,
    },

    /// Enable an upstream server
    Enable {
        #[arg(value_name = "NAME")]
        name: String,
    },

    /// Disable an upstream server
    Disable {
        #[arg(value_name = "NAME")]
        name: String,
    },

    /// Restart an upstream server
    Restart {
        #[arg(value_name = "NAME")]
        name: String,
    },

    /// Quarantine or unquarantine an upstream server
    Quarantine {
        #[arg(value_name = "NAME")]
        name: String,

        /// Lift the quarantine instead of imposing it
        #[arg(long)]
        lift: bool,
    },
}

#[derive(Subcommand)]
pub enum AuthCommands {
    /// Start an interactive authorization flow
    Login {
        #[arg(long, value_name = "NAME")]
        server: String,
    },

    /// Drop stored tokens for a server
    Logout {
        #[arg(long, value_name = "NAME")]
        server: String,
    },

    /// Show authorization status for a server
    Status {
        #[arg(long, value_name = "NAME")]
        server: String,
    },
}

#[derive(Subcommand)]
pub enum ToolsCommands {
    /// BM25 search over all visible tools
    Search {
        /// Query text
        #[arg(value_name = "QUERY")]
        query: String,

        /// Maximum results
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Subcommand)]
pub enum CallCommands {
    /// Call one tool
    Tool {
        /// Namespaced tool name (server:tool)
        #[arg(long = "tool-name", value_name = "S:T")]
        tool_name: String,

        /// JSON arguments
        #[arg(long = "json_args", value_name = "JSON", default_value = "{}")]
        json_args: String,
    },
}

#[derive(Subcommand)]
pub enum ActivityCommands {
    /// List activity records
    List {
        /// Record type filter
        #[arg(long, value_name = "TYPE")]
        r#type: Option<String>,

        /// Server filter
        #[arg(long, value_name = "NAME")]
        server: Option<String>,

        /// Status filter: success, error, blocked
        #[arg(long, value_name = "STATUS")]
        status: Option<String>,

        /// Session filter
        #[arg(long, value_name = "ID")]
        session_id: Option<String>,

        /// Flow direction filter, e.g. internal→external
        #[arg(long, value_name = "FLOW")]
        flow_type: Option<String>,

        /// Risk level filter: none, low, medium, critical
        #[arg(long, value_name = "RISK")]
        risk_level: Option<String>,

        /// Maximum records
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Export activity records
    Export {
        /// Output format: json or csv
        #[arg(value_name = "FORMAT", default_value = "json")]
        format: String,

        /// Server filter
        #[arg(long, value_name = "NAME")]
        server: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum HookCommands {
    /// Evaluate a hook event from stdin (agent fast path)
    Evaluate,

    /// Install PreToolUse/PostToolUse hooks into the agent settings
    Install {
        /// Agent settings file (defaults to ~/.claude/settings.json)
        #[arg(long, value_name = "PATH")]
        settings: Option<std::path::PathBuf>,
    },

    /// Remove the installed hooks
    Uninstall {
        /// Agent settings file (defaults to ~/.claude/settings.json)
        #[arg(long, value_name = "PATH")]
        settings: Option<std::path::PathBuf>,
    },

    /// Show whether hooks are installed and the daemon reachable
    Status,
}
