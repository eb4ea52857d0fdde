use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::cli::args::{
    ConfigAction, ConfigArgs, InitArgs, MountsArgs, OutputFormat, RunArgs, TranslateArgs,
};
use crate::config::loader::get_config_path;
use crate::config::types::AgentboxConfig;
use crate::error::Result;
use crate::supervisor::{EventSink, SessionEvent, SpawnRequest, Supervisor};

// ============================================================================
// Run Command
// ============================================================================

/// Event sink for interactive runs: mirrors the worker's streams onto ours
/// and records the exit so the command can adopt the worker's status.
struct ConsoleSink {
    format: OutputFormat,
    exit_code: Mutex<Option<i32>>,
    exited: Notify,
}

impl ConsoleSink {
    fn new(format: OutputFormat) -> Self {
        Self {
            format,
            exit_code: Mutex::new(None),
            exited: Notify::new(),
        }
    }

    async fn wait_exit(&self) -> i32 {
        loop {
            let notified = self.exited.notified();
            if let Some(code) = *self.exit_code.lock().unwrap() {
                return code;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl EventSink for ConsoleSink {
    async fn deliver(&self, event: SessionEvent) {
        if let OutputFormat::Json = self.format {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{}", line);
            }
        } else {
            match &event {
                SessionEvent::Stdout { data, .. } => print!("{}", data),
                SessionEvent::Stderr { data, .. } => eprint!("{}", data),
                SessionEvent::Error { message, .. } => eprintln!("error: {}", message),
                SessionEvent::GuestConnection { connected, .. } => {
                    info!(connected, "Worker connection state changed");
                }
                SessionEvent::Exit { .. } => {}
            }
        }
        if let SessionEvent::Exit { code, signal, .. } = &event {
            // Signal deaths report the conventional shell status for SIGTERM,
            // the only signal this command ever sends.
            let code = if signal.is_empty() { *code } else { 128 + libc::SIGTERM };
            *self.exit_code.lock().unwrap() = Some(code);
            self.exited.notify_waiters();
        }
    }
}

/// Spawn a worker, wire our stdin/stdout to it, and adopt its exit status.
pub async fn run(args: RunArgs, mut config: AgentboxConfig, format: OutputFormat) -> Result<()> {
    if let Some(mode) = args.sandbox {
        config.sandbox.mode = mode;
    }

    let command = config.worker.virtual_command.clone();
    let supervisor = Arc::new(Supervisor::new(config)?);
    let sink = Arc::new(ConsoleSink::new(format));
    supervisor.bridge().register(sink.clone());

    let id = args
        .id
        .unwrap_or_else(|| format!("run-{}", std::process::id()));
    let request = SpawnRequest {
        id: id.clone(),
        session: args.session.clone(),
        command,
        args: args.args,
        cwd: args.cwd,
        env: args.env_vars.into_iter().collect(),
        mounts: args.mounts,
        resume: args.resume,
        allowed_domains: args.allowed_domains,
    };
    let outcome = supervisor.spawn(request).await?;
    info!(id = %id, session = %args.session, pid = outcome.pid, "Worker running");

    // Forward our stdin line by line until the worker stops taking it.
    let forwarder = tokio::spawn({
        let supervisor = supervisor.clone();
        let id = id.clone();
        async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !supervisor.write_stdin(&id, &format!("{line}\n")).await {
                    break;
                }
            }
        }
    });

    let code = tokio::select! {
        code = sink.wait_exit() => code,
        _ = tokio::signal::ctrl_c() => {
            warn!(id = %id, "Interrupted, terminating worker");
            supervisor.kill(&id, None);
            sink.wait_exit().await
        }
    };
    forwarder.abort();

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

// ============================================================================
// Inspection Commands
// ============================================================================

/// Show the mount map a spawn in this session would receive.
pub async fn mounts(args: MountsArgs, config: AgentboxConfig, format: OutputFormat) -> Result<()> {
    let supervisor = Supervisor::new(config)?;
    let map = supervisor.plan_mounts(&args.session, &args.mounts);

    match format {
        OutputFormat::Text => {
            println!("{:<16} {:<4} HOST", "MOUNT", "MODE");
            println!("{}", "-".repeat(60));
            for (name, entry) in &map {
                let mode = if entry.mode.is_read_only() { "ro" } else { "rw" };
                println!(
                    "{:<16} {:<4} {}",
                    name,
                    mode,
                    entry.host_path.display()
                );
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&map)?);
        }
    }
    Ok(())
}

/// Translate a virtual session path to its host path.
pub async fn translate(
    args: TranslateArgs,
    config: AgentboxConfig,
    format: OutputFormat,
) -> Result<()> {
    let supervisor = Supervisor::new(config)?;
    let host = supervisor.translate(&args.path, args.session.as_deref())?;

    match format {
        OutputFormat::Text => println!("{}", host.display()),
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "virtual": args.path,
                    "host": host,
                })
            );
        }
    }
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn init(args: InitArgs) -> Result<()> {
    let config_path = get_config_path();

    if config_path.exists() && !args.force {
        println!("Configuration already exists at: {}", config_path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let default_config = AgentboxConfig::default();
    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| crate::error::AgentboxError::Config(e.to_string()))?;

    std::fs::write(&config_path, toml_str)?;

    println!("Created configuration at: {}", config_path.display());
    println!("\nQuick start:");
    println!("  # Inspect the mounts a session would see");
    println!("  agentbox mounts mysession --mount projects=src:ro");
    println!();
    println!("  # Run the installed worker in a sandboxed session");
    println!("  agentbox run --session mysession -- --serve");
    println!();
    println!("  # Translate a virtual worker path to the host path");
    println!("  agentbox translate /sessions/mysession/mnt/config/settings.json");

    Ok(())
}

pub async fn config(args: ConfigArgs, config: AgentboxConfig) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(&config)
                .map_err(|e| crate::error::AgentboxError::Config(e.to_string()))?;
            println!("{}", toml_str);
        }
        ConfigAction::Path => {
            println!("{}", get_config_path().display());
        }
    }
    Ok(())
}
