use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{debug, info, LevelFilter};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use huddle::hub::{persistence, Hub};

const APP_NAME: &str = "huddle";
const ENV_PREFIX: &str = "AGENT_CHAT";

fn main() {
    if let Err(err) = try_main() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging();
    debug!("resolved settings: {:#?}", ctx.settings);

    match cli.command {
        Command::Serve(cmd) => serve_main(ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
            Ok(())
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = APP_NAME,
    author,
    version,
    about = "Huddle - chat hub for coordinated CLI AI agents.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Root directory for hub state and the port file
    #[arg(long, value_name = "PATH", global = true)]
    data_dir: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Disable ANSI colors in log output
    #[arg(long = "no-color", global = true)]
    no_color: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the hub server
    Serve(ServeCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Port to listen on; 0 lets the OS assign one
    #[arg(short, long, default_value = "0")]
    port: u16,
    /// Default room name for requests that omit one
    #[arg(long, value_name = "NAME")]
    room: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
}

/// Effective settings after layering defaults, the optional config file,
/// `AGENT_CHAT_*` environment variables, and CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Settings {
    data_dir: PathBuf,
    room: String,
    #[serde(default)]
    hub_token: Option<String>,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    settings: Settings,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let data_dir = resolve_data_dir(&common)?;
        let config_file = data_dir.join("config.toml");

        let mut builder = Config::builder()
            .set_default("room", "default")?
            .set_default("data_dir", data_dir.to_string_lossy().to_string())?
            .add_source(File::from(config_file).format(FileFormat::Toml).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX));
        if let Some(dir) = &common.data_dir {
            builder = builder.set_override("data_dir", dir.to_string_lossy().to_string())?;
        }

        let settings: Settings = builder
            .build()
            .context("loading configuration")?
            .try_deserialize()
            .context("invalid configuration")?;

        Ok(Self { common, settings })
    }

    fn config_file(&self) -> PathBuf {
        self.settings.data_dir.join("config.toml")
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.quiet {
            return LevelFilter::Error;
        }
        match self.common.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    fn init_logging(&self) {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        let level = self.effective_log_level();
        let directive = match level {
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            _ => "trace",
        };

        let disable_color = self.common.no_color
            || std::env::var_os("NO_COLOR").is_some()
            || !io::stderr().is_terminal();

        // Tracing keeps axum/hyper internals observable; env_logger carries
        // the crate's own log-facade output.
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("axum={directive},hyper={directive}")));
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(!disable_color)
                    .with_writer(io::stderr),
            )
            .try_init()
            .ok();

        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(directive));
        builder.filter_level(level);
        if disable_color {
            builder.write_style(env_logger::WriteStyle::Never);
        }
        builder.try_init().ok();
    }
}

fn resolve_data_dir(common: &CommonOpts) -> Result<PathBuf> {
    if let Some(dir) = &common.data_dir {
        return Ok(dir.clone());
    }
    if let Ok(dir) = std::env::var(format!("{ENV_PREFIX}_DATA_DIR")) {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    let home = dirs::home_dir().context("could not determine home directory")?;
    Ok(home.join(".agent-chat"))
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let rendered = serde_json::to_string_pretty(&ctx.settings)?;
            println!("{rendered}");
        }
        ConfigCommand::Path => println!("{}", ctx.config_file().display()),
    }
    Ok(())
}

#[tokio::main]
async fn serve_main(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let settings = &ctx.settings;
    let room = cmd.room.clone().unwrap_or_else(|| settings.room.clone());

    std::fs::create_dir_all(&settings.data_dir)
        .with_context(|| format!("creating data dir {:?}", settings.data_dir))?;

    let hub = Arc::new(Hub::new(
        &settings.data_dir,
        room,
        settings.hub_token.clone(),
    ));
    hub.load_persisted_state();

    // localhost only; discovery happens through the port file.
    let listener = TcpListener::bind(("127.0.0.1", cmd.port))
        .await
        .context("hub listen")?;
    let port = listener.local_addr()?.port();
    hub.write_port_file(port)?;

    let persist = tokio::spawn(persistence::persist_loop(Arc::clone(&hub)));

    let result = axum::serve(listener, hub.router())
        .with_graceful_shutdown(shutdown_signal())
        .await;

    persist.abort();
    hub.shutdown().await;
    info!("bye");

    result.context("hub server")
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
