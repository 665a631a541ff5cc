use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use syftbox_rs::config::{Config, ConfigOverrides};
use syftbox_rs::daemon::{self, DaemonOptions};
use syftbox_rs::message::Method;
use syftbox_rs::rpc;
use syftbox_rs::url::SyftUrl;

#[derive(Parser, Debug)]
#[command(name = "syftbox", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Email override (takes precedence over env/config)
    #[arg(long = "email")]
    email: Option<String>,

    /// Data directory override (takes precedence over env/config)
    #[arg(long = "datadir")]
    datadir: Option<PathBuf>,

    /// Server URL override (takes precedence over env/config)
    #[arg(long = "server")]
    server: Option<String>,

    /// Gateway URL override (takes precedence over env/config)
    #[arg(long = "client-url")]
    client_url: Option<String>,

    /// Gateway token override (takes precedence over env/config)
    #[arg(long = "client-token")]
    client_token: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write out a config file for this datasite (OAuth is out of scope; this only bootstraps config.json)
    #[command(alias = "init")]
    Login {
        /// Disable output
        #[arg(short = 'q', long = "quiet", default_value_t = false)]
        quiet: bool,
    },

    /// Run the client daemon (sync loop + event dispatcher + gateway)
    Daemon {
        /// Address to bind the local http gateway
        #[arg(short = 'a', long = "http-addr", default_value = "localhost:7938")]
        http_addr: String,

        /// Bearer token for the local http gateway
        #[arg(short = 't', long = "http-token", default_value = "")]
        http_token: String,
    },

    /// Print the resolved config file path
    ConfigPath,

    /// Print version information
    Version,

    /// Send an RPC request to a syft:// URL and print the future id
    Send {
        /// Destination syft:// URL
        url: String,

        /// Request body, read as raw bytes
        #[arg(long)]
        body: Option<String>,

        /// HTTP-style method
        #[arg(long, default_value = "post")]
        method: String,

        /// Expiry, e.g. 30s, 5m, 1h, 1d
        #[arg(long, default_value = rpc::DEFAULT_EXPIRY)]
        expiry: String,

        /// Block until the future resolves and print the response body
        #[arg(long, default_value_t = false)]
        wait: bool,

        /// Poll timeout when --wait is set
        #[arg(long, default_value = "30s")]
        timeout: String,
    },

    /// Send an empty GET to `syft://<user>/api_data/<app>/rpc/ping` and wait for a reply
    Ping {
        /// Destination user email
        user: String,

        /// App name to address
        #[arg(long, default_value = "pingpong")]
        app: String,

        /// Poll timeout
        #[arg(long, default_value = "30s")]
        timeout: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli {
        config,
        email,
        datadir,
        server,
        client_url,
        client_token,
        command,
    } = Cli::parse();
    let resolved_config = Config::resolve_config_path(config.as_deref());

    match command {
        Some(Commands::Login { quiet }) => {
            run_login(
                resolved_config,
                email,
                datadir,
                server.unwrap_or_else(|| Config::default_server_url().to_string()),
                quiet,
            )
        }
        Some(Commands::ConfigPath) => {
            println!("{}", resolved_config.display());
            Ok(())
        }
        Some(Commands::Version) => {
            println!("{}", detailed_version());
            Ok(())
        }
        Some(Commands::Daemon {
            http_addr,
            http_token,
        }) => {
            let overrides = ConfigOverrides {
                email,
                data_dir: datadir,
                server_url: server,
                client_url,
                client_token,
            };
            let cfg = Config::load_with_overrides(&resolved_config, overrides)?;
            run_daemon(cfg, http_addr, http_token).await
        }
        Some(Commands::Send {
            url,
            body,
            method,
            expiry,
            wait,
            timeout,
        }) => {
            let overrides = ConfigOverrides {
                email,
                data_dir: datadir,
                server_url: server,
                client_url,
                client_token,
            };
            let cfg = Config::load_with_overrides(&resolved_config, overrides)?;
            run_send(cfg, url, body, method, expiry, wait, timeout).await
        }
        Some(Commands::Ping { user, app, timeout }) => {
            let overrides = ConfigOverrides {
                email,
                data_dir: datadir,
                server_url: server,
                client_url,
                client_token,
            };
            let cfg = Config::load_with_overrides(&resolved_config, overrides)?;
            run_ping(cfg, user, app, timeout).await
        }
        None => {
            // Running with no subcommand starts the daemon, matching the reference client.
            let overrides = ConfigOverrides {
                email,
                data_dir: datadir,
                server_url: server,
                client_url,
                client_token,
            };
            let cfg = Config::load_with_overrides(&resolved_config, overrides)?;
            run_daemon(cfg, "127.0.0.1:7938".to_string(), String::new()).await
        }
    }
}

fn run_login(
    config_path: PathBuf,
    email: Option<String>,
    datadir: Option<PathBuf>,
    server_url: String,
    quiet: bool,
) -> Result<()> {
    if let Ok(cfg) = Config::load_file_only(&config_path) {
        if !quiet {
            print_datasite_config(&cfg, "Already logged in");
        }
        return Ok(());
    }

    let email = email
        .or_else(|| std::env::var("SYFTBOX_EMAIL").ok())
        .ok_or_else(|| anyhow::anyhow!("--email is required (the OAuth login flow is out of scope; this only bootstraps config.json)"))?;
    let data_dir = datadir.unwrap_or_else(Config::default_data_dir);

    let cfg = Config::new_for_save(&config_path, &data_dir, &email, &server_url, None, None)?;
    cfg.save().context("save config")?;
    std::fs::create_dir_all(data_dir.join("datasites").join(&cfg.email))
        .context("create datasite home directory")?;

    if !quiet {
        print_datasite_config(&cfg, "Logged in");
    }
    Ok(())
}

fn print_datasite_config(cfg: &Config, status: &str) {
    println!("{status}");
    println!("=== SYFTBOX DATASITE CONFIG ===");
    println!("email: {}", cfg.email);
    println!("data_dir: {}", cfg.data_dir.display());
    println!("server_url: {}", cfg.server_url);
}

async fn run_daemon(cfg: Config, http_addr: String, http_token: String) -> Result<()> {
    let opts = DaemonOptions {
        http_addr: Some(http_addr),
        http_token: (!http_token.trim().is_empty()).then_some(http_token),
        ..Default::default()
    };
    let shutdown = syftbox_rs::shutdown::Shutdown::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_signal.signal();
    });
    daemon::run_daemon_with_shutdown(cfg, opts, shutdown).await
}

async fn run_send(
    cfg: Config,
    url: String,
    body: Option<String>,
    method: String,
    expiry: String,
    wait: bool,
    timeout: String,
) -> Result<()> {
    let syft_url = SyftUrl::parse(&url).with_context(|| format!("invalid syft url: {url}"))?;
    let method = parse_method(&method)?;
    let datasites_root = cfg.data_dir.join("datasites");

    let future = rpc::send(
        &datasites_root,
        &cfg.email,
        syft_url,
        body.map(|b| b.into_bytes()),
        BTreeMap::new(),
        method,
        &expiry,
        false,
    )?;
    println!("{}", future.id);

    if wait {
        let timeout = rpc::parse_duration(&timeout)?
            .to_std()
            .context("convert timeout")?;
        let resolved = future
            .wait(timeout, std::time::Duration::from_millis(200))
            .await?;
        print_resolved(resolved);
    }
    Ok(())
}

async fn run_ping(cfg: Config, user: String, app: String, timeout: String) -> Result<()> {
    let syft_url = SyftUrl::parse(&format!("syft://{user}/api_data/{app}/rpc/ping"))?;
    let datasites_root = cfg.data_dir.join("datasites");

    let future = rpc::send(
        &datasites_root,
        &cfg.email,
        syft_url,
        None,
        BTreeMap::new(),
        Method::Get,
        rpc::DEFAULT_EXPIRY,
        false,
    )?;

    let timeout = rpc::parse_duration(&timeout)?
        .to_std()
        .context("convert timeout")?;
    let resolved = future
        .wait(timeout, std::time::Duration::from_millis(200))
        .await?;
    print_resolved(resolved);
    Ok(())
}

fn print_resolved(resolved: syftbox_rs::future::Resolved) {
    use syftbox_rs::future::Resolved;
    match resolved {
        Resolved::Completed(resp) => {
            println!("status: {}", resp.status_code);
            if let Some(body) = resp.body {
                println!("{}", String::from_utf8_lossy(&body));
            }
        }
        Resolved::Rejected(resp) => {
            println!("rejected status: {}", resp.status_code);
        }
        Resolved::Expired(_) => println!("expired"),
        Resolved::Deleted(_) => println!("deleted"),
        Resolved::Pending => println!("pending"),
    }
}

fn parse_method(s: &str) -> Result<Method> {
    match s.to_ascii_lowercase().as_str() {
        "get" => Ok(Method::Get),
        "post" => Ok(Method::Post),
        "put" => Ok(Method::Put),
        "delete" => Ok(Method::Delete),
        other => anyhow::bail!("unsupported method: {other}"),
    }
}

fn detailed_version() -> String {
    let version = env!("CARGO_PKG_VERSION");
    let revision = option_env!("SYFTBOX_REVISION").unwrap_or("HEAD");
    let build_date = option_env!("SYFTBOX_BUILD_DATE").unwrap_or("");
    format!(
        "{} ({}; rust; {}/{}; {})",
        version,
        revision,
        std::env::consts::OS,
        std::env::consts::ARCH,
        build_date
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_cli_allows_no_subcommand() {
        let cli = Cli::try_parse_from(["syftbox"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn daemon_cli_parses_flags() {
        let cli = Cli::try_parse_from([
            "syftbox",
            "-c",
            "config.json",
            "daemon",
            "-a",
            "127.0.0.1:7938",
            "-t",
            "token123",
        ])
        .unwrap();

        match cli.command {
            Some(Commands::Daemon {
                http_addr,
                http_token,
            }) => {
                assert_eq!(http_addr, "127.0.0.1:7938");
                assert_eq!(http_token, "token123");
            }
            _ => panic!("expected daemon command"),
        }
    }

    #[test]
    fn login_cli_supports_init_alias() {
        let cli = Cli::try_parse_from(["syftbox", "init", "--quiet"]).unwrap();
        match cli.command {
            Some(Commands::Login { quiet }) => assert!(quiet),
            _ => panic!("expected login via init alias"),
        }
    }

    #[test]
    fn send_cli_parses_flags() {
        let cli = Cli::try_parse_from([
            "syftbox",
            "send",
            "syft://alice@example.com/api_data/app/rpc/ping",
            "--body",
            "hello",
            "--wait",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Send { url, body, wait, .. }) => {
                assert_eq!(url, "syft://alice@example.com/api_data/app/rpc/ping");
                assert_eq!(body.as_deref(), Some("hello"));
                assert!(wait);
            }
            _ => panic!("expected send command"),
        }
    }

    #[test]
    fn ping_cli_parses_flags() {
        let cli =
            Cli::try_parse_from(["syftbox", "ping", "alice@example.com", "--app", "pingpong"])
                .unwrap();
        match cli.command {
            Some(Commands::Ping { user, app, .. }) => {
                assert_eq!(user, "alice@example.com");
                assert_eq!(app, "pingpong");
            }
            _ => panic!("expected ping command"),
        }
    }
}
