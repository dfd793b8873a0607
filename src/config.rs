use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// External setup/teardown collaborators
    #[serde(default)]
    pub provisioning: ProvisioningConfig,

    /// How backends are recognised and talked to
    #[serde(default)]
    pub backend: BackendConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port (default: 8000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Path to the SQLite session registry
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Timeout for a proxied request in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// DELETE requests allowed per client per minute on the proxy route (default: 5)
    #[serde(default = "default_delete_rate_limit")]
    pub delete_rate_limit_per_minute: u32,

    /// Permit running as UID 0 (default: false)
    #[serde(default)]
    pub allow_root: bool,

    /// Maximum idle connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            database_path: default_database_path(),
            request_timeout_secs: default_request_timeout(),
            delete_rate_limit_per_minute: default_delete_rate_limit(),
            allow_root: false,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProvisioningConfig {
    /// Command that provisions a backend; invoked with the correlation id appended
    #[serde(default = "default_setup_command")]
    pub setup_command: String,

    /// Command that tears a backend down; invoked with the correlation id appended
    #[serde(default = "default_cleanup_command")]
    pub cleanup_command: String,

    #[serde(default = "default_setup_timeout")]
    pub setup_timeout_secs: u64,

    #[serde(default = "default_cleanup_timeout")]
    pub cleanup_timeout_secs: u64,

    /// Repository cloned into `repo_path` at startup when not already present
    pub repo_url: Option<String>,

    #[serde(default = "default_repo_path")]
    pub repo_path: PathBuf,

    #[serde(default = "default_clone_timeout")]
    pub clone_timeout_secs: u64,

    /// Base directory for per-session worktrees
    #[serde(default = "default_worktree_base")]
    pub worktree_base: String,

    pub project_path: Option<String>,

    #[serde(default = "default_get_prod_hash_command")]
    pub get_prod_hash_command: String,

    #[serde(default = "default_debug_env")]
    pub debug_env: String,
}

impl ProvisioningConfig {
    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_timeout_secs)
    }

    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout_secs)
    }

    /// Environment handed to the setup/teardown commands
    pub fn collaborator_env(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![
            ("REPO_PATH", self.repo_path.display().to_string()),
            ("WORKTREE_BASE", self.worktree_base.clone()),
            ("GET_PROD_HASH_COMMAND", self.get_prod_hash_command.clone()),
            ("DEBUG_ENV", self.debug_env.clone()),
        ];
        if let Some(ref url) = self.repo_url {
            env.push(("REPO_URL", url.clone()));
        }
        if let Some(ref path) = self.project_path {
            env.push(("PROJECT_PATH", path.clone()));
        }
        env
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            setup_command: default_setup_command(),
            cleanup_command: default_cleanup_command(),
            setup_timeout_secs: default_setup_timeout(),
            cleanup_timeout_secs: default_cleanup_timeout(),
            repo_url: None,
            repo_path: default_repo_path(),
            clone_timeout_secs: default_clone_timeout(),
            worktree_base: default_worktree_base(),
            project_path: None,
            get_prod_hash_command: default_get_prod_hash_command(),
            debug_env: default_debug_env(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Program name identifying a backend in the process table
    #[serde(default = "default_program")]
    pub program: String,

    /// Subcommand token that must accompany the program name
    #[serde(default = "default_serve_token")]
    pub serve_token: String,

    /// Self-description endpoint
    #[serde(default = "default_spec_path")]
    pub spec_path: String,

    /// Time-to-live for cached specs in seconds (default: 600)
    #[serde(default = "default_spec_ttl")]
    pub spec_ttl_secs: u64,

    #[serde(default = "default_spec_timeout")]
    pub spec_timeout_secs: u64,

    /// Health probe endpoint
    #[serde(default = "default_health_path")]
    pub health_path: String,

    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,

    /// Grace period between SIGTERM and SIGKILL in seconds (default: 3)
    #[serde(default = "default_kill_grace_period")]
    pub kill_grace_period_secs: u64,
}

impl BackendConfig {
    pub fn spec_ttl(&self) -> Duration {
        Duration::from_secs(self.spec_ttl_secs)
    }

    pub fn spec_timeout(&self) -> Duration {
        Duration::from_secs(self.spec_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn kill_grace_period(&self) -> Duration {
        Duration::from_secs(self.kill_grace_period_secs)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            serve_token: default_serve_token(),
            spec_path: default_spec_path(),
            spec_ttl_secs: default_spec_ttl(),
            spec_timeout_secs: default_spec_timeout(),
            health_path: default_health_path(),
            health_timeout_ms: default_health_timeout_ms(),
            kill_grace_period_secs: default_kill_grace_period(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8000
}

fn default_database_path() -> PathBuf {
    PathBuf::from("instances.db")
}

fn default_request_timeout() -> u64 {
    30
}

fn default_delete_rate_limit() -> u32 {
    5
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_setup_command() -> String {
    "./setup_env.sh".to_string()
}

fn default_cleanup_command() -> String {
    "./cleanup_env.sh".to_string()
}

fn default_setup_timeout() -> u64 {
    30
}

fn default_cleanup_timeout() -> u64 {
    60
}

fn default_repo_path() -> PathBuf {
    PathBuf::from("/repo")
}

fn default_clone_timeout() -> u64 {
    120
}

fn default_worktree_base() -> String {
    "/tmp/debug-worktrees".to_string()
}

fn default_get_prod_hash_command() -> String {
    "./get_prod_hash.sh".to_string()
}

fn default_debug_env() -> String {
    ".env.debug.template".to_string()
}

fn default_program() -> String {
    "opencode".to_string()
}

fn default_serve_token() -> String {
    "serve".to_string()
}

fn default_spec_path() -> String {
    "/doc".to_string()
}

fn default_spec_ttl() -> u64 {
    600
}

fn default_spec_timeout() -> u64 {
    10
}

fn default_health_path() -> String {
    "/global/health".to_string()
}

fn default_health_timeout_ms() -> u64 {
    1000
}

fn default_kill_grace_period() -> u64 {
    3
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Replace provisioning inputs with values from the environment when set
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(url) = non_empty("REPO_URL") {
            self.provisioning.repo_url = Some(url);
        }
        if let Some(base) = non_empty("WORKTREE_BASE") {
            self.provisioning.worktree_base = base;
        }
        if let Some(path) = non_empty("PROJECT_PATH") {
            self.provisioning.project_path = Some(path);
        }
    }

    /// Validate the configuration, collecting every problem
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if self.server.delete_rate_limit_per_minute == 0 {
            errors.push("server.delete_rate_limit_per_minute must be non-zero".to_string());
        }
        if self.server.request_timeout_secs == 0 {
            errors.push("server.request_timeout_secs must be non-zero".to_string());
        }

        for (name, command) in [
            ("provisioning.setup_command", &self.provisioning.setup_command),
            ("provisioning.cleanup_command", &self.provisioning.cleanup_command),
        ] {
            match shell_words::split(command) {
                Ok(words) if words.is_empty() => errors.push(format!("{} must not be empty", name)),
                Ok(_) => {}
                Err(e) => errors.push(format!("{} is not a valid command: {}", name, e)),
            }
        }
        if self.provisioning.setup_timeout_secs == 0 || self.provisioning.cleanup_timeout_secs == 0 {
            errors.push("provisioning timeouts must be non-zero".to_string());
        }

        if self.backend.spec_ttl_secs == 0 {
            errors.push("backend.spec_ttl_secs must be non-zero".to_string());
        }
        if self.backend.spec_timeout_secs == 0 || self.backend.health_timeout_ms == 0 {
            errors.push("backend timeouts must be non-zero".to_string());
        }
        if self.backend.program.is_empty() || self.backend.serve_token.is_empty() {
            errors.push("backend.program and backend.serve_token must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Invalid configuration:\n  - {}", errors.join("\n  - "))
        }
    }
}
