//! Engine configuration.
//!
//! Values are layered with the `config` crate: built-in defaults, an
//! optional TOML file, then `CODEAGENT__SECTION__KEY` environment
//! variables. Backends receive the resolved structs at construction time
//! and never read the environment themselves.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::boundary::BoundaryConfig;
use crate::container::RuntimeType;
use crate::retry::RetryPolicy;

pub const APP_NAME: &str = "codeagent";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub runtime: RuntimeConfig,
    pub retry: RetryConfig,
    pub boundary: BoundaryConfig,
    /// Provider profiles keyed by provider name.
    pub providers: BTreeMap<String, ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Backend selection and process/container settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Run the CLI inside containers instead of local processes.
    pub docker_enabled: bool,
    /// Keep one interactive CLI process per session (container mode only).
    pub interactive_enabled: bool,
    /// Container runtime flavour.
    pub container_runtime: RuntimeType,
    /// Override for the container CLI binary.
    pub container_binary: Option<String>,
    /// Image the session containers run.
    pub image: String,
    /// Mount point of the workspace inside containers.
    pub container_workdir: String,
    /// Home directory of the CLI user inside containers.
    pub container_home: String,
    /// Main process keeping session containers alive.
    pub keepalive_command: Vec<String>,
    /// Optional `--network` value for session containers.
    pub network: Option<String>,
    /// Upper bound for one prompt, in seconds.
    pub prompt_timeout_secs: u64,
    /// Upper bound for container start plus readiness handshake, in seconds.
    pub startup_timeout_secs: u64,
    /// Time between SIGTERM and SIGKILL, in seconds.
    pub kill_grace_secs: u64,
    /// Remove interactive containers on close. Off by default so a
    /// finished session can still be inspected.
    pub remove_on_close: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_enabled: false,
            interactive_enabled: false,
            container_runtime: RuntimeType::Docker,
            container_binary: None,
            image: "ghcr.io/codeagent/agent-runner:latest".to_string(),
            container_workdir: "/workspace".to_string(),
            container_home: "/home/agent".to_string(),
            keepalive_command: vec!["sleep".to_string(), "infinity".to_string()],
            network: None,
            prompt_timeout_secs: 15 * 60,
            startup_timeout_secs: 120,
            kill_grace_secs: 5,
            remove_on_close: false,
        }
    }
}

impl RuntimeConfig {
    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.prompt_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    /// Expand `~` and environment variables in path-like values.
    pub fn expand_paths(&mut self) {
        if let Some(ref binary) = self.container_binary {
            self.container_binary = Some(shellexpand::tilde(binary).to_string());
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            backoff_base_ms: policy.backoff_base.as_millis() as u64,
            backoff_max_ms: policy.backoff_max.as_millis() as u64,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
        }
    }
}

/// How to drive one provider's CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// CLI binary.
    pub command: String,
    /// Arguments for a one-shot prompt. `{prompt}` is replaced by the
    /// message; without a placeholder the message is appended.
    pub args: Vec<String>,
    /// Arguments for the long-lived interactive mode.
    pub interactive_args: Vec<String>,
    /// API key injected as `api_key_env`.
    pub api_key: Option<String>,
    /// Name of the environment variable the CLI reads its key from.
    pub api_key_env: Option<String>,
    /// Extra environment for the CLI.
    pub env: BTreeMap<String, String>,
    /// Case-insensitive regexes marking authentication failures in output.
    pub auth_failure_patterns: Vec<String>,
    /// Probe line written during the interactive readiness handshake.
    pub probe_message: String,
}

impl ProviderConfig {
    /// Built-in profile for known providers.
    pub fn builtin(provider: &str) -> Option<Self> {
        let common_auth = vec![
            r"invalid api key".to_string(),
            r"authentication[_ ]error".to_string(),
            r"\b401\b.*unauthori[sz]ed".to_string(),
            r"not logged in".to_string(),
            r"please run /login".to_string(),
        ];

        match provider {
            "claude" => Some(Self {
                command: "claude".to_string(),
                args: vec![
                    "--print".to_string(),
                    "--dangerously-skip-permissions".to_string(),
                    "{prompt}".to_string(),
                ],
                interactive_args: vec!["--dangerously-skip-permissions".to_string()],
                api_key: None,
                api_key_env: Some("ANTHROPIC_API_KEY".to_string()),
                env: BTreeMap::new(),
                auth_failure_patterns: common_auth,
                probe_message: "Reply with the single word ready.".to_string(),
            }),
            "codex" => Some(Self {
                command: "codex".to_string(),
                args: vec![
                    "exec".to_string(),
                    "--full-auto".to_string(),
                    "{prompt}".to_string(),
                ],
                interactive_args: vec!["--full-auto".to_string()],
                api_key: None,
                api_key_env: Some("OPENAI_API_KEY".to_string()),
                env: BTreeMap::new(),
                auth_failure_patterns: common_auth,
                probe_message: "Reply with the single word ready.".to_string(),
            }),
            _ => None,
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, an optional TOML file and the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = AppConfig::default();
        let mut builder = Config::builder()
            .set_default("logging.level", defaults.logging.level.clone())?
            .set_default("runtime.prompt_timeout_secs", defaults.runtime.prompt_timeout_secs as i64)?
            .set_default("runtime.startup_timeout_secs", defaults.runtime.startup_timeout_secs as i64)?
            .set_default("retry.max_attempts", defaults.retry.max_attempts as i64)?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
        }

        let built = builder
            .add_source(
                Environment::with_prefix(env_prefix().as_str()).separator("__"),
            )
            .build()
            .context("building configuration")?;

        let mut config: AppConfig = built
            .try_deserialize()
            .context("deserializing configuration")?;
        config.runtime.expand_paths();
        Ok(config)
    }

    /// Resolve the profile for `provider`: configured values win, the
    /// built-in profile fills in for known providers.
    pub fn provider(&self, provider: &str) -> Option<ProviderConfig> {
        let key = provider.to_lowercase();
        match (self.providers.get(&key), ProviderConfig::builtin(&key)) {
            (Some(configured), Some(builtin)) => Some(merge_provider(configured, builtin)),
            (Some(configured), None) => Some(configured.clone()),
            (None, builtin) => builtin,
        }
    }

    /// Render as TOML for display or the default config file.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("serializing configuration to TOML")
    }
}

fn merge_provider(configured: &ProviderConfig, builtin: ProviderConfig) -> ProviderConfig {
    let pick_vec = |configured: &Vec<String>, builtin: Vec<String>| {
        if configured.is_empty() {
            builtin
        } else {
            configured.clone()
        }
    };

    let mut env = builtin.env;
    env.extend(configured.env.clone());

    ProviderConfig {
        command: if configured.command.is_empty() {
            builtin.command
        } else {
            configured.command.clone()
        },
        args: pick_vec(&configured.args, builtin.args),
        interactive_args: pick_vec(&configured.interactive_args, builtin.interactive_args),
        api_key: configured.api_key.clone().or(builtin.api_key),
        api_key_env: configured.api_key_env.clone().or(builtin.api_key_env),
        env,
        auth_failure_patterns: pick_vec(
            &configured.auth_failure_patterns,
            builtin.auth_failure_patterns,
        ),
        probe_message: if configured.probe_message.is_empty() {
            builtin.probe_message
        } else {
            configured.probe_message.clone()
        },
    }
}

pub fn env_prefix() -> String {
    APP_NAME.to_ascii_uppercase().replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert!(!config.runtime.docker_enabled);
        assert!(!config.runtime.remove_on_close);
        assert_eq!(config.runtime.prompt_timeout(), Duration::from_secs(900));
        assert_eq!(config.retry.policy(), RetryPolicy::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[runtime]
docker_enabled = true
interactive_enabled = true
image = "agent:dev"
prompt_timeout_secs = 60

[retry]
max_attempts = 5

[providers.claude]
api_key = "sk-test"

[providers.custom]
command = "my-cli"
args = ["run", "{{prompt}}"]
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert!(config.runtime.docker_enabled);
        assert!(config.runtime.interactive_enabled);
        assert_eq!(config.runtime.image, "agent:dev");
        assert_eq!(config.runtime.prompt_timeout_secs, 60);
        // Untouched keys keep their defaults.
        assert_eq!(config.runtime.container_workdir, "/workspace");
        assert_eq!(config.retry.max_attempts, 5);

        let claude = config.provider("claude").unwrap();
        assert_eq!(claude.command, "claude");
        assert_eq!(claude.api_key.as_deref(), Some("sk-test"));
        assert_eq!(claude.api_key_env.as_deref(), Some("ANTHROPIC_API_KEY"));

        let custom = config.provider("custom").unwrap();
        assert_eq!(custom.command, "my-cli");
        assert_eq!(custom.args, vec!["run", "{prompt}"]);
    }

    #[test]
    fn test_unknown_provider() {
        assert!(AppConfig::default().provider("nope").is_none());
        assert!(AppConfig::default().provider("Codex").is_some());
    }

    #[test]
    fn test_toml_round_trip() {
        let toml = AppConfig::default().to_toml().unwrap();
        assert!(toml.contains("[runtime]"));
        let parsed: AppConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.runtime.image, AppConfig::default().runtime.image);
    }
}
