use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::types::SandboxMode;
use crate::vfs::MountRequest;

#[derive(Parser, Debug)]
#[clap(name = "agentbox")]
#[clap(version, about = "Sandboxed session supervisor for agent worker processes")]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(flatten)]
    pub global_opts: GlobalOpts,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Configuration file path
    #[clap(short, long, global = true, env = "AGENTBOX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[clap(long, global = true, default_value = "text", value_enum)]
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Spawn a worker in a session sandbox and stream its output
    Run(RunArgs),

    /// Show the mount map a session would receive
    Mounts(MountsArgs),

    /// Translate a virtual session path to its host path
    Translate(TranslateArgs),

    /// Initialize a new agentbox configuration
    Init(InitArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Session name scoping the mount namespace
    #[clap(long, short = 's', default_value = "default")]
    pub session: String,

    /// Process id (auto-generated if not provided)
    #[clap(long)]
    pub id: Option<String>,

    /// Mounts to expose in the session (name[=relative/path][:ro])
    #[clap(long = "mount", short = 'm', value_parser = MountRequest::parse)]
    pub mounts: Vec<MountRequest>,

    /// Environment variables to set for the worker (KEY=VALUE)
    #[clap(long = "env", short = 'e', value_parser = parse_env_var)]
    pub env_vars: Vec<(String, String)>,

    /// Working directory inside the session namespace
    #[clap(long)]
    pub cwd: Option<String>,

    /// Override the configured sandbox mode
    #[clap(long, value_enum)]
    pub sandbox: Option<SandboxMode>,

    /// Tell the worker it is resuming an earlier conversation
    #[clap(long)]
    pub resume: bool,

    /// Domain the worker may reach (repeatable)
    #[clap(long = "allow-domain")]
    pub allowed_domains: Vec<String>,

    /// Arguments passed through to the worker
    #[clap(trailing_var_arg = true)]
    pub args: Vec<String>,
}

#[derive(Args, Debug)]
pub struct MountsArgs {
    /// Session name
    #[clap(default_value = "default")]
    pub session: String,

    /// Mounts to include (name[=relative/path][:ro])
    #[clap(long = "mount", short = 'm', value_parser = MountRequest::parse)]
    pub mounts: Vec<MountRequest>,
}

#[derive(Args, Debug)]
pub struct TranslateArgs {
    /// Virtual path to translate
    pub path: String,

    /// Session whose mounts to consult
    #[clap(long, short = 's')]
    pub session: Option<String>,
}

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Force overwrite existing configuration
    #[clap(short, long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[clap(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Show configuration file path
    Path,
}

fn parse_env_var(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| "Environment variable format: KEY=VALUE".to_string())
}

#[derive(Debug, Clone, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}
