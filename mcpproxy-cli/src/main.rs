//! mcpproxy binary entry point

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use mcpproxy_config::{ConfigLoader, ProxyConfig};
use mcpproxy_server::{ExitCode, Server};

mod cli;
mod client;
mod hook;

use cli::{
    ActivityCommands, AuthCommands, CallCommands, Cli, Commands, HookCommands, ToolsCommands,
    UpstreamCommands,
};
use client::DaemonClient;

fn main() {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            std::process::exit(ExitCode::General.code());
        }
    };

    // The hook fast path skips config load and logger init entirely
    if let Commands::Hook {
        hook_cmd: HookCommands::Evaluate,
    } = &cli.command
    {
        let socket = std::env::var_os("MCPPROXY_SOCKET")
            .map(PathBuf::from)
            .or_else(default_socket_path);
        let code = runtime.block_on(hook::evaluate(socket));
        std::process::exit(code);
    }

    init_logging(cli.log_level.as_deref());

    let code = match runtime.block_on(dispatch(cli)) {
        Ok(()) => ExitCode::Ok,
        Err(e) => {
            let code = ExitCode::from_error(&e);
            eprintln!("error: {:#}", e);
            code
        }
    };
    std::process::exit(code.code());
}

/// Default IPC socket path without loading any config
fn default_socket_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".mcpproxy/mcpproxy.sock"))
}

fn init_logging(level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(cli_config: &Option<PathBuf>) -> Result<ProxyConfig> {
    let loader = ConfigLoader::new();
    Ok(loader.load(cli_config.as_ref())?)
}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve {
            listen,
            data_dir,
            api_key,
            tray_endpoint,
        } => {
            let mut config = load_config(&cli.config)?;
            if let Some(listen) = listen {
                config.listen = listen;
            }
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            if let Some(api_key) = api_key {
                config.api_key = Some(api_key);
            }
            if let Some(tray_endpoint) = tray_endpoint {
                config.tray_endpoint = Some(tray_endpoint);
            }
            if let Some(level) = cli.log_level {
                if let Ok(parsed) = level.parse() {
                    config.logging.level = parsed;
                }
            }

            let server = Server::start(config, cli.config.clone()).await?;
            server.run_until_shutdown().await
        }

        Commands::Upstream { upstream_cmd } => {
            let config = load_config(&cli.config)?;
            let client = DaemonClient::from_config(&config)?;
            upstream(&client, upstream_cmd).await
        }

        Commands::Auth { auth_cmd } => {
            let config = load_config(&cli.config)?;
            let client = DaemonClient::from_config(&config)?;
            auth(&client, auth_cmd).await
        }

        Commands::Tools { tools_cmd } => {
            let config = load_config(&cli.config)?;
            let client = DaemonClient::from_config(&config)?;
            match tools_cmd {
                ToolsCommands::Search { query, limit } => {
                    let data = client
                        .get(&format!(
                            "/api/v1/tools/search?q={}&limit={}",
                            urlencode(&query),
                            limit
                        ))
                        .await?;
                    print_json(&data);
                    Ok(())
                }
            }
        }

        Commands::Call { call_cmd } => {
            let config = load_config(&cli.config)?;
            let client = DaemonClient::from_config(&config)?;
            match call_cmd {
                CallCommands::Tool {
                    tool_name,
                    json_args,
                } => {
                    let arguments: Value = serde_json::from_str(&json_args)
                        .context("--json_args is not valid JSON")?;
                    let request = json!({
                        "jsonrpc": "2.0",
                        "method": "tools/call",
                        "params": { "name": tool_name, "arguments": arguments },
                        "id": "cli",
                    });
                    let response = client.post("/mcp", &request).await?;
                    print_json(&response);
                    Ok(())
                }
            }
        }

        Commands::Activity { activity_cmd } => {
            let config = load_config(&cli.config)?;
            let client = DaemonClient::from_config(&config)?;
            activity(&client, activity_cmd).await
        }

        Commands::Hook { hook_cmd } => {
            match hook_cmd {
                // Handled on the fast path before dispatch
                HookCommands::Evaluate => Ok(()),
                HookCommands::Install { settings } => {
                    let path = settings
                        .or_else(hook::default_settings_path)
                        .context("could not determine the agent settings path")?;
                    hook::install(&path)?;
                    println!("hooks installed in {}", path.display());
                    Ok(())
                }
                HookCommands::Uninstall { settings } => {
                    let path = settings
                        .or_else(hook::default_settings_path)
                        .context("could not determine the agent settings path")?;
                    hook::uninstall(&path)?;
                    println!("hooks removed from {}", path.display());
                    Ok(())
                }
                HookCommands::Status => {
                    let config = load_config(&cli.config)?;
                    let installed = hook::default_settings_path()
                        .map(|p| hook::is_installed(&p))
                        .unwrap_or(false);
                    println!("hooks installed: {}", installed);

                    match DaemonClient::from_config(&config)?.get("/api/v1/status").await {
                        Ok(status) => {
                            println!(
                                "daemon: running, coverage mode: {}",
                                status
                                    .get("coverage_mode")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or("unknown")
                            );
                        }
                        Err(_) => println!("daemon: not reachable"),
                    }
                    Ok(())
                }
            }
        }

        Commands::Doctor => {
            let config = load_config(&cli.config)?;
            doctor(&config).await
        }
    }
}

async fn upstream(client: &DaemonClient, command: UpstreamCommands) -> Result<()> {
    match command {
        UpstreamCommands::List => {
            let data = client.get("/api/v1/servers").await?;
            print_json(&data);
        }
        UpstreamCommands::Add {
            name,
            protocol,
            url,
            command,
            args,
        } => {
            let body = json!({
                "name": name,
                "protocol": protocol,
                "url": url,
                "command": command,
                "args": args,
            });
            let data = client.post("/api/v1/servers", &body).await?;
            print_json(&data);
        }
        UpstreamCommands::Remove { name } => {
            let data = client.delete(&format!("/api/v1/servers/{}", name)).await?;
            print_json(&data);
        }
        UpstreamCommands::Enable { name } => {
            let data = client
                .post(&format!("/api/v1/servers/{}/enable", name), &json!({}))
                .await?;
            print_json(&data);
        }
        UpstreamCommands::Disable { name } => {
            let data = client
                .post(&format!("/api/v1/servers/{}/disable", name), &json!({}))
                .await?;
            print_json(&data);
        }
        UpstreamCommands::Restart { name } => {
            let data = client
                .post(&format!("/api/v1/servers/{}/restart", name), &json!({}))
                .await?;
            print_json(&data);
        }
        UpstreamCommands::Quarantine { name, lift } => {
            let data = client
                .post(
                    &format!("/api/v1/servers/{}/quarantine", name),
                    &json!({ "quarantined": !lift }),
                )
                .await?;
            print_json(&data);
        }
    }
    Ok(())
}

async fn auth(client: &DaemonClient, command: AuthCommands) -> Result<()> {
    match command {
        AuthCommands::Login { server } => {
            let data = client
                .post(&format!("/api/v1/servers/{}/oauth/login", server), &json!({}))
                .await?;
            let url = data
                .get("auth_url")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            println!("Open this URL in a browser to authorize '{}':\n\n  {}\n", server, url);
            println!("The daemon completes the flow when the callback arrives.");
        }
        AuthCommands::Logout { server } => {
            let data = client
                .post(&format!("/api/v1/servers/{}/oauth/logout", server), &json!({}))
                .await?;
            print_json(&data);
        }
        AuthCommands::Status { server } => {
            let data = client.get(&format!("/api/v1/servers/{}", server)).await?;
            print_json(&data);
        }
    }
    Ok(())
}

async fn activity(client: &DaemonClient, command: ActivityCommands) -> Result<()> {
    match command {
        ActivityCommands::List {
            r#type,
            server,
            status,
            session_id,
            flow_type,
            risk_level,
            limit,
        } => {
            let mut query = vec![format!("limit={}", limit)];
            if let Some(t) = r#type {
                query.push(format!("type={}", urlencode(&t)));
            }
            if let Some(s) = server {
                query.push(format!("server={}", urlencode(&s)));
            }
            if let Some(s) = status {
                query.push(format!("status={}", urlencode(&s)));
            }
            if let Some(s) = session_id {
                query.push(format!("session_id={}", urlencode(&s)));
            }
            if let Some(s) = flow_type {
                query.push(format!("flow_type={}", urlencode(&s)));
            }
            if let Some(s) = risk_level {
                query.push(format!("risk_level={}", urlencode(&s)));
            }
            let data = client
                .get(&format!("/api/v1/activity?{}", query.join("&")))
                .await?;
            print_json(&data);
        }
        ActivityCommands::Export { format, server } => {
            let mut query = vec![format!("format={}", urlencode(&format))];
            if let Some(s) = server {
                query.push(format!("server={}", urlencode(&s)));
            }
            let body = client
                .get_raw(&format!("/api/v1/activity/export?{}", query.join("&")))
                .await?;
            println!("{}", body);
        }
    }
    Ok(())
}

async fn doctor(config: &ProxyConfig) -> Result<()> {
    println!("mcpproxy {}", env!("CARGO_PKG_VERSION"));
    println!("listen:        {}", config.listen);
    println!("data dir:      {}", config.data_dir.display());
    println!(
        "api key:       {}",
        if config.api_key.is_some() { "configured" } else { "not configured" }
    );

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(&config.data_dir) {
            Ok(metadata) => {
                let mode = metadata.permissions().mode() & 0o777;
                let verdict = if mode & 0o077 == 0 { "ok" } else { "INSECURE (chmod 0700)" };
                println!("data dir mode: {:o} ({})", mode, verdict);
            }
            Err(_) => println!("data dir:      not created yet"),
        }
    }

    let socket = mcpproxy_server::startup::client_socket_path(config);
    match &socket {
        Some(path) if mcpproxy_server::startup::socket_is_live(path) => {
            println!("ipc socket:    {} (live)", path.display());
        }
        Some(path) => println!("ipc socket:    {} (not running)", path.display()),
        None => println!("ipc socket:    unavailable on this platform"),
    }

    match DaemonClient::from_config(config)?.get("/api/v1/status").await {
        Ok(status) => {
            println!(
                "daemon:        running (coverage: {}, hooks active: {})",
                status.get("coverage_mode").and_then(|v| v.as_str()).unwrap_or("?"),
                status.get("hooks_active").and_then(|v| v.as_bool()).unwrap_or(false),
            );
        }
        Err(_) => println!("daemon:        not reachable"),
    }

    let hooks_installed = hook::default_settings_path()
        .map(|p| hook::is_installed(&p))
        .unwrap_or(false);
    println!("agent hooks:   {}", if hooks_installed { "installed" } else { "not installed" });

    Ok(())
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{}", value),
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push_str("%20"),
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}
