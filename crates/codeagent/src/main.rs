use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{ArgGroup, Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::{LevelFilter, debug, info, warn};
use serde::Serialize;

use codeagent::config::{APP_NAME, AppConfig};
use codeagent::naming::{ContainerVariant, candidate_names};
use codeagent::{
    DefaultBackendFactory, RetryingInvoker, SessionError, SessionRegistry, WorkTarget, Workspace,
    container_name, legacy_names, resolve_worktree,
};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, command: Command) -> Result<()> {
    match command {
        Command::Prompt(cmd) => handle_prompt(&ctx, cmd).await,
        Command::Cleanup(cmd) => handle_cleanup(&ctx, cmd).await,
        _ => unreachable!("synchronous command dispatched to async runtime"),
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        command @ (Command::Prompt(_) | Command::Cleanup(_)) => async_main(ctx, command),
        Command::Names(cmd) => handle_names(&ctx, cmd),
        Command::Worktree(cmd) => handle_worktree(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "codeagent - drive code-generation CLIs in local processes and containers.",
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
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk or in the container runtime
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send one or more messages to a workspace session
    Prompt(PromptCommand),
    /// Print the container names used for a workspace
    Names(NamesCommand),
    /// Force-remove a workspace's containers, including legacy names
    Cleanup(CleanupCommand),
    /// Check a directory's git worktree pointer
    Worktree(WorktreeCommand),
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

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Clone, Args)]
#[command(group(ArgGroup::new("target").required(true).args(["pr", "issue"])))]
struct WorkspaceArgs {
    /// Provider profile (claude, codex, or a configured one)
    #[arg(long, default_value = "claude")]
    provider: String,
    /// Repository owner
    #[arg(long)]
    org: String,
    /// Repository name
    #[arg(long)]
    repo: String,
    /// Pull request number
    #[arg(long)]
    pr: Option<u64>,
    /// Issue number
    #[arg(long)]
    issue: Option<u64>,
    /// Checked-out workspace directory
    #[arg(long, value_name = "DIR", default_value = ".")]
    path: PathBuf,
    /// Scratch directory for session state (defaults under the state dir)
    #[arg(long, value_name = "DIR")]
    session_path: Option<PathBuf>,
}

impl WorkspaceArgs {
    fn target(&self) -> Result<WorkTarget> {
        match (self.pr, self.issue) {
            (Some(pr), None) => Ok(WorkTarget::PullRequest(pr)),
            (None, Some(issue)) => Ok(WorkTarget::Issue(issue)),
            _ => bail!("exactly one of --pr or --issue is required"),
        }
    }

    fn workspace(&self, paths: &AppPaths) -> Result<Workspace> {
        let target = self.target()?;
        let path = expand_path(self.path.clone())?;
        let path = path
            .canonicalize()
            .with_context(|| format!("resolving workspace path {}", path.display()))?;
        let session_path = match self.session_path {
            Some(ref dir) => expand_path(dir.clone())?,
            None => paths.sessions_dir(),
        };
        Ok(Workspace::new(
            self.provider.clone(),
            self.org.clone(),
            self.repo.clone(),
            path,
            session_path,
            target,
        ))
    }
}

#[derive(Debug, Clone, Args)]
struct PromptCommand {
    #[command(flatten)]
    workspace: WorkspaceArgs,
    /// Message to send; repeat for a multi-turn conversation. Reads stdin
    /// when omitted.
    #[arg(short, long = "message", value_name = "TEXT")]
    messages: Vec<String>,
    /// Run the CLI inside a container
    #[arg(long)]
    docker: bool,
    /// Keep one interactive CLI process for all messages (implies --docker)
    #[arg(long)]
    interactive: bool,
    /// Leave the session running instead of closing it afterwards
    #[arg(long)]
    keep: bool,
}

#[derive(Debug, Clone, Args)]
struct NamesCommand {
    #[command(flatten)]
    workspace: WorkspaceArgs,
}

#[derive(Debug, Clone, Args)]
struct CleanupCommand {
    #[command(flatten)]
    workspace: WorkspaceArgs,
}

#[derive(Debug, Clone, Args)]
struct WorktreeCommand {
    /// Directory to inspect
    #[arg(default_value = ".")]
    path: PathBuf,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&paths, &common)?;
        Ok(Self {
            common,
            paths,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={level}")));

        let file_layer = match self.config.logging.file {
            Some(ref path) => {
                let file = open_log_file(Path::new(path))?;
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::sync::Mutex::new(file))
                        .with_ansi(false),
                )
            }
            None => None,
        };

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(io::stderr),
                )
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        // Library code logs through the `log` facade.
        let mut builder = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(self.config.logging.level.as_str()),
        );
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    state_dir: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self {
            config_file,
            state_dir: default_state_dir()?,
        })
    }

    fn sessions_dir(&self) -> PathBuf {
        self.state_dir.join("sessions")
    }
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, state: {}",
            self.config_file.display(),
            self.state_dir.display()
        )
    }
}

async fn handle_prompt(ctx: &RuntimeContext, cmd: PromptCommand) -> Result<()> {
    let workspace = cmd.workspace.workspace(&ctx.paths)?;

    let mut config = ctx.config.clone();
    if cmd.docker || cmd.interactive {
        config.runtime.docker_enabled = true;
    }
    if cmd.interactive {
        config.runtime.interactive_enabled = true;
    }

    let messages = if cmd.messages.is_empty() {
        let mut input = String::new();
        io::stdin()
            .read_to_string(&mut input)
            .context("reading message from stdin")?;
        vec![input.trim().to_string()]
    } else {
        cmd.messages.clone()
    };
    if messages.iter().all(|m| m.is_empty()) {
        bail!("no message given");
    }

    if ctx.common.dry_run {
        let factory = DefaultBackendFactory::new(Arc::new(config));
        info!(
            "dry-run: would send {} message(s) to a {} session for {}",
            messages.len(),
            factory.kind(),
            workspace.session_key()
        );
        return Ok(());
    }

    fs::create_dir_all(workspace.session_path()).with_context(|| {
        format!(
            "creating session directory {}",
            workspace.session_path().display()
        )
    })?;

    let invoker = RetryingInvoker::new(config.retry.policy());
    let registry = SessionRegistry::new(Arc::new(DefaultBackendFactory::new(Arc::new(config))));

    let result = run_conversation(&registry, &invoker, &workspace, &messages).await;

    if cmd.keep {
        info!("leaving session {} open", workspace.session_key());
    } else if let Err(e) = registry.close(&workspace).await {
        warn!("closing session failed: {}", e);
    }
    result
}

async fn run_conversation(
    registry: &SessionRegistry,
    invoker: &RetryingInvoker,
    workspace: &Workspace,
    messages: &[String],
) -> Result<()> {
    let backend = registry
        .get_or_create(workspace)
        .await
        .with_context(|| format!("starting session for {}", workspace.session_key()))?;

    let mut stdout = tokio::io::stdout();
    for (turn, message) in messages.iter().enumerate() {
        debug!("turn {}: {} bytes", turn + 1, message.len());
        let mut response = invoker
            .prompt_with_retry(backend.as_ref(), message)
            .await
            .with_context(|| format!("prompt {} failed", turn + 1))?;

        tokio::io::copy(&mut response, &mut stdout)
            .await
            .map_err(SessionError::from_io)
            .with_context(|| format!("reading response {}", turn + 1))?;
        tokio::io::AsyncWriteExt::flush(&mut stdout).await?;
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct NamesReport {
    session_key: String,
    managed: String,
    managed_legacy: Vec<String>,
    interactive: String,
    interactive_legacy: Vec<String>,
}

fn handle_names(ctx: &RuntimeContext, cmd: NamesCommand) -> Result<()> {
    let workspace = cmd.workspace.workspace(&ctx.paths)?;
    let provider = workspace.provider().to_string();
    let report = NamesReport {
        session_key: workspace.session_key().to_string(),
        managed: container_name(&provider, &workspace, ContainerVariant::Managed),
        managed_legacy: legacy_names(&provider, &workspace, ContainerVariant::Managed),
        interactive: container_name(&provider, &workspace, ContainerVariant::Interactive),
        interactive_legacy: legacy_names(&provider, &workspace, ContainerVariant::Interactive),
    };

    if ctx.common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serializing names to JSON")?
        );
    } else {
        println!("session:     {}", report.session_key);
        println!("managed:     {}", report.managed);
        for name in &report.managed_legacy {
            println!("  legacy:    {}", name);
        }
        println!("interactive: {}", report.interactive);
        for name in &report.interactive_legacy {
            println!("  legacy:    {}", name);
        }
    }
    Ok(())
}

async fn handle_cleanup(ctx: &RuntimeContext, cmd: CleanupCommand) -> Result<()> {
    let workspace = cmd.workspace.workspace(&ctx.paths)?;
    let factory = DefaultBackendFactory::new(Arc::new(ctx.config.clone()));
    let runtime = factory.runtime();
    let provider = workspace.provider().to_string();

    let mut names = candidate_names(&provider, &workspace, ContainerVariant::Managed);
    names.extend(candidate_names(
        &provider,
        &workspace,
        ContainerVariant::Interactive,
    ));

    if !ctx.common.dry_run {
        let version = runtime
            .health_check()
            .await
            .with_context(|| format!("checking container runtime {}", runtime.binary()))?;
        debug!("{} version: {}", runtime.binary(), version.trim());
    }

    for name in names {
        if ctx.common.dry_run {
            info!("dry-run: would remove container {}", name);
            continue;
        }
        runtime
            .remove_container(&name, true)
            .await
            .with_context(|| format!("removing container {name}"))?;
        info!("removed {}", name);
    }
    Ok(())
}

fn handle_worktree(ctx: &RuntimeContext, cmd: WorktreeCommand) -> Result<()> {
    let path = expand_path(cmd.path)?;
    let info = resolve_worktree(&path)?;

    if ctx.common.json {
        println!(
            "{}",
            serde_json::json!({
                "path": path,
                "is_worktree": info.is_worktree,
                "parent_repo": info.parent_repo,
            })
        );
    } else if let Some(parent) = info.parent_repo {
        println!("worktree of {}", parent.display());
    } else {
        println!("not a worktree");
    }
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else {
                print!("{}", ctx.config.to_toml()?);
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Init { force } => {
            if ctx.paths.config_file.exists() && !force {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    ctx.paths.config_file.display()
                );
            }
            if ctx.common.dry_run {
                info!(
                    "dry-run: would write default config to {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

fn load_or_init_config(paths: &AppPaths, common: &CommonOpts) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if common.dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_default_config(&paths.config_file)?;
        }
    }

    let mut config = AppConfig::load(Some(&paths.config_file))?;

    if let Some(ref file) = config.logging.file {
        let expanded = expand_str_path(file)?;
        config.logging.file = Some(expanded.display().to_string());
    }

    Ok(config)
}

/// Open the configured log file for appending, creating its directory.
fn open_log_file(path: &Path) -> Result<fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating log directory {parent:?}"))?;
    }
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {}", path.display()))
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let mut body = default_config_header(path);
    body.push_str(&AppConfig::default().to_toml()?);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    format!(
        "# Configuration for {}\n# File: {}\n\n",
        APP_NAME,
        path.display()
    )
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_state_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::state_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("state").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine state directory"))
}
