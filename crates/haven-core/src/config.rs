use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_PORT: u16 = 18990;
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Top-level config (haven.toml + HAVEN_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HavenConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub attachments: AttachmentsConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub scripting: ScriptingConfig,
    #[serde(default)]
    pub automations: AutomationsConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    /// Named processing profiles; the profile id "default" is used when a
    /// caller does not select one.
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileConfig>,
    #[serde(default)]
    pub remote_tools: Vec<RemoteToolServerConfig>,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
    #[serde(default)]
    pub a2a: A2aConfig,
    /// IANA timezone used when rendering times to the user and to scripts.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for HavenConfig {
    fn default() -> Self {
        Self {
            database: Default::default(),
            attachments: Default::default(),
            worker: Default::default(),
            orchestrator: Default::default(),
            scripting: Default::default(),
            automations: Default::default(),
            llm: Default::default(),
            profiles: Default::default(),
            remote_tools: Default::default(),
            webhooks: Default::default(),
            a2a: Default::default(),
            timezone: default_timezone(),
        }
    }
}

impl HavenConfig {
    /// Load config from a TOML file with HAVEN_* env var overrides.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: HavenConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("HAVEN_").split("_"))
            .extract()
            .map_err(|e| crate::error::HavenError::Config(e.to_string()))?;

        Ok(config)
    }

    pub fn tz(&self) -> crate::error::Result<chrono_tz::Tz> {
        self.timezone
            .parse()
            .map_err(|_| crate::error::HavenError::Timezone(self.timezone.clone()))
    }

    /// The profile to use for `id`, falling back to "default", falling back
    /// to a built-in empty profile.
    pub fn profile(&self, id: Option<&str>) -> ProfileConfig {
        let key = id.unwrap_or("default");
        self.profiles
            .get(key)
            .or_else(|| self.profiles.get("default"))
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentsConfig {
    /// Directory holding the content-addressed blob files.
    #[serde(default = "default_attachments_dir")]
    pub dir: String,
    /// Base URL prefix for externally reachable content links.
    #[serde(default = "default_attachments_base_url")]
    pub base_url: String,
}

impl Default for AttachmentsConfig {
    fn default() -> Self {
        Self {
            dir: default_attachments_dir(),
            base_url: default_attachments_base_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Seconds a dequeued task stays leased before another worker may steal it.
    #[serde(default = "default_lease_duration")]
    pub lease_duration_secs: u64,
    /// Idle poll interval when the queue is empty.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries_default: u32,
    /// Exponential backoff base: base * 2^retry + jitter.
    #[serde(default = "default_backoff_base")]
    pub retry_backoff_base_secs: u64,
    #[serde(default = "default_jitter_max")]
    pub retry_jitter_max_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lease_duration_secs: default_lease_duration(),
            poll_interval_secs: default_poll_interval(),
            max_retries_default: default_max_retries(),
            retry_backoff_base_secs: default_backoff_base(),
            retry_jitter_max_secs: default_jitter_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_history_messages")]
    pub max_history_messages: usize,
    #[serde(default = "default_history_max_age_hours")]
    pub history_max_age_hours: i64,
    /// Hard cap on LLM/tool rounds within one turn.
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,
    /// At or below this many pending attachments, forward them all.
    #[serde(default = "default_selection_threshold")]
    pub attachment_selection_threshold: usize,
    #[serde(default = "default_max_response_attachments")]
    pub max_response_attachments: usize,
    #[serde(default = "default_llm_timeout")]
    pub llm_timeout_secs: u64,
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_history_messages: default_max_history_messages(),
            history_max_age_hours: default_history_max_age_hours(),
            max_tool_iterations: default_max_tool_iterations(),
            attachment_selection_threshold: default_selection_threshold(),
            max_response_attachments: default_max_response_attachments(),
            llm_timeout_secs: default_llm_timeout(),
            confirmation_timeout_secs: default_confirmation_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptingConfig {
    /// Wall-clock cap for one script execution.
    #[serde(default = "default_script_timeout")]
    pub max_execution_secs: u64,
}

impl Default for ScriptingConfig {
    fn default() -> Self {
        Self {
            max_execution_secs: default_script_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AutomationsConfig {
    /// Per-listener daily trigger cap. None = unlimited.
    #[serde(default)]
    pub max_daily_executions: Option<u32>,
}

/// Connection settings for the single concrete LLM adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_chat_path")]
    pub chat_path: String,
    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_llm_base_url(),
            chat_path: default_llm_chat_path(),
            model: default_model(),
        }
    }
}

/// A named bundle of system prompt, model selection, and tool policy.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProfileConfig {
    #[serde(default)]
    pub system_prompt: String,
    /// Overrides `llm.model` when set.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub max_tool_iterations: Option<usize>,
    /// Extra provider parameters merged verbatim into the request body.
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolsConfig {
    /// When set, only these tools are exposed. None = all registered tools.
    #[serde(default)]
    pub enabled: Option<Vec<String>>,
    /// Removed from whatever `enabled` (or "all") produced.
    #[serde(default)]
    pub disabled: Vec<String>,
    /// Tools gated behind a user confirmation callback.
    #[serde(default)]
    pub require_confirmation: Vec<String>,
}

impl ToolsConfig {
    /// Whether `name` is visible under this policy.
    pub fn allows(&self, name: &str) -> bool {
        if self.disabled.iter().any(|d| d == name) {
            return false;
        }
        match &self.enabled {
            Some(list) => list.iter().any(|e| e == name),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteToolTransport {
    /// Child process speaking line-delimited JSON on stdin/stdout.
    Stdio,
    /// HTTP endpoint with SSE responses.
    Http,
}

/// One remote tool server entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteToolServerConfig {
    pub name: String,
    pub transport: RemoteToolTransport,
    /// Stdio: executable to spawn.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Http: base URL.
    #[serde(default)]
    pub url: Option<String>,
    /// Bearer secret; `$VAR_NAME` values are resolved from the environment
    /// at startup (see [`resolve_secret`]).
    #[serde(default)]
    pub secret: Option<String>,
    /// Extra environment for stdio servers; values support `$VAR` indirection.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Authentication mode for an incoming webhook source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WebhookAuthMode {
    /// HMAC-SHA256 over the raw request body (GitHub-style X-Hub-Signature-256).
    HmacSha256,
    /// Static bearer token in the Authorization header.
    BearerToken,
    /// No authentication — use only for internal/trusted networks.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSourceConfig {
    /// Identifier used in the route, e.g. "worker" → POST /webhooks/worker.
    pub name: String,
    /// HMAC signing secret or bearer token value; `$VAR` indirection allowed.
    pub secret: Option<String>,
    pub auth_mode: WebhookAuthMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebhooksConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub sources: Vec<WebhookSourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct A2aConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_agent_name")]
    pub agent_name: String,
    #[serde(default)]
    pub agent_description: String,
    /// Externally reachable base URL advertised on the agent card.
    #[serde(default)]
    pub agent_url: String,
}

impl Default for A2aConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            agent_name: default_agent_name(),
            agent_description: String::new(),
            agent_url: String::new(),
        }
    }
}

/// Resolve a configured secret. `$VAR_NAME` reads the named environment
/// variable at startup; anything else is returned verbatim.
pub fn resolve_secret(value: &str) -> crate::error::Result<String> {
    if let Some(var) = value.strip_prefix('$') {
        std::env::var(var).map_err(|_| {
            crate::error::HavenError::Config(format!(
                "secret references unset environment variable {var}"
            ))
        })
    } else {
        Ok(value.to_string())
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.haven/haven.db")
}
fn default_attachments_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.haven/attachments")
}
fn default_attachments_base_url() -> String {
    "/attachments".to_string()
}
fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.haven/haven.toml")
}
fn default_lease_duration() -> u64 {
    300
}
fn default_poll_interval() -> u64 {
    5
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base() -> u64 {
    5
}
fn default_jitter_max() -> u64 {
    2
}
fn default_max_history_messages() -> usize {
    50
}
fn default_history_max_age_hours() -> i64 {
    48
}
fn default_max_tool_iterations() -> usize {
    10
}
fn default_selection_threshold() -> usize {
    3
}
fn default_max_response_attachments() -> usize {
    5
}
fn default_llm_timeout() -> u64 {
    60
}
fn default_confirmation_timeout() -> u64 {
    60
}
fn default_script_timeout() -> u64 {
    600
}
fn default_llm_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_llm_chat_path() -> String {
    "/v1/chat/completions".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_agent_name() -> String {
    "Haven".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = HavenConfig::default();
        assert_eq!(cfg.worker.poll_interval_secs, 5);
        assert_eq!(cfg.worker.retry_backoff_base_secs, 5);
        assert_eq!(cfg.orchestrator.attachment_selection_threshold, 3);
        assert_eq!(cfg.scripting.max_execution_secs, 600);
        assert_eq!(cfg.timezone, "UTC");
        assert!(cfg.tz().is_ok());
    }

    #[test]
    fn tools_config_enable_disable() {
        let cfg = ToolsConfig {
            enabled: Some(vec!["echo".into(), "notes".into()]),
            disabled: vec!["notes".into()],
            require_confirmation: vec![],
        };
        assert!(cfg.allows("echo"));
        assert!(!cfg.allows("notes"));
        assert!(!cfg.allows("unknown"));

        let open = ToolsConfig::default();
        assert!(open.allows("anything"));
    }

    #[test]
    fn secret_indirection() {
        std::env::set_var("HAVEN_TEST_SECRET_VALUE", "s3cret");
        assert_eq!(
            resolve_secret("$HAVEN_TEST_SECRET_VALUE").unwrap(),
            "s3cret"
        );
        assert_eq!(resolve_secret("plain").unwrap(), "plain");
        assert!(resolve_secret("$HAVEN_TEST_SECRET_MISSING").is_err());
    }

    #[test]
    fn profile_falls_back_to_default() {
        let mut cfg = HavenConfig::default();
        cfg.profiles.insert(
            "default".into(),
            ProfileConfig {
                system_prompt: "you are haven".into(),
                ..Default::default()
            },
        );
        assert_eq!(cfg.profile(None).system_prompt, "you are haven");
        assert_eq!(cfg.profile(Some("missing")).system_prompt, "you are haven");
    }
}
