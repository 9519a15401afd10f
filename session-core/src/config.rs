//! `SessionConfiguration` and the workflow input/result envelopes.
//!
//! Every optional field gets a named `default_*` function rather than
//! leaning on a single blanket `Default` impl, so each default is
//! independently documented and testable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Approval policy mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalMode {
    Never,
    UnlessTrusted,
    OnFailure,
}

impl Default for ApprovalMode {
    fn default() -> Self {
        Self::UnlessTrusted
    }
}

/// Sandbox restriction regime applied to tool invocations (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    FullAccess,
    ReadOnly,
    WorkspaceWrite,
}

impl Default for SandboxMode {
    fn default() -> Self {
        Self::WorkspaceWrite
    }
}

/// Environment-variable inheritance policy (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvInherit {
    All,
    None,
    Core,
}

impl Default for EnvInherit {
    fn default() -> Self {
        Self::Core
    }
}

fn default_true() -> bool {
    true
}

/// Configuration for one MCP server entry under `tools.mcp_servers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_mcp_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
}

fn default_mcp_startup_timeout_ms() -> u64 {
    10_000
}

fn default_shell_enabled() -> bool {
    true
}

/// Which built-in tools are enabled for the session, plus any MCP servers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_shell_enabled")]
    pub enable_shell: bool,
    #[serde(default)]
    pub enable_read_file: bool,
    #[serde(default)]
    pub enable_write_file: bool,
    #[serde(default)]
    pub enable_list_dir: bool,
    #[serde(default)]
    pub enable_grep_files: bool,
    #[serde(default)]
    pub enable_apply_patch: bool,
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, McpServerConfig>,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model_name() -> String {
    "gpt-5-codex".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_context_window() -> u32 {
    128_000
}

/// Model selection/parameters (spec.md §3 `model`, §6 `model`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model_name")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_context_window")]
    pub context_window: u32,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model_name(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            context_window: default_context_window(),
        }
    }
}

fn default_cwd() -> String {
    ".".to_string()
}

fn default_codex_home() -> String {
    ".codex".to_string()
}

fn default_max_consecutive_tool_loops() -> u32 {
    8
}

fn default_auto_compact_token_limit() -> u32 {
    // 80% of the default context window; SessionConfiguration::normalize()
    // recomputes this relative to the *actual* model.context_window once
    // both are known, per SPEC_FULL.md §3 ("ties back to C8's default
    // threshold").
    (default_context_window() as f64 * 0.8) as u32
}

/// Full session configuration (spec.md §6 `SessionConfiguration`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfiguration {
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub approval_mode: ApprovalMode,
    #[serde(default)]
    pub sandbox_mode: SandboxMode,
    #[serde(default)]
    pub sandbox_writable_roots: Vec<String>,
    #[serde(default)]
    pub sandbox_network_access: bool,
    #[serde(default)]
    pub env_inherit: EnvInherit,
    #[serde(default)]
    pub env_exclude: Vec<String>,
    #[serde(default)]
    pub env_include_only: Vec<String>,
    #[serde(default)]
    pub env_set: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub env_ignore_default_excludes: bool,
    #[serde(default = "default_cwd")]
    pub cwd: String,
    #[serde(default = "default_codex_home")]
    pub codex_home: String,
    #[serde(default)]
    pub base_instructions: Option<String>,
    #[serde(default)]
    pub developer_instructions: Option<String>,
    #[serde(default)]
    pub cli_project_docs: Option<String>,
    #[serde(default)]
    pub user_personal_instructions: Option<String>,
    #[serde(default = "default_auto_compact_token_limit")]
    pub auto_compact_token_limit: u32,
    /// Tool-only round streak (no intervening assistant text) that ends a
    /// turn with `TurnComplete{length-cap}` before `TurnEngine::max_iterations`
    /// would otherwise catch a stuck loop.
    #[serde(default = "default_max_consecutive_tool_loops")]
    pub max_consecutive_tool_loops: u32,
}

impl Default for SessionConfiguration {
    fn default() -> Self {
        Self {
            model: ModelSettings::default(),
            tools: ToolsConfig::default(),
            approval_mode: ApprovalMode::default(),
            sandbox_mode: SandboxMode::default(),
            sandbox_writable_roots: Vec::new(),
            sandbox_network_access: false,
            env_inherit: EnvInherit::default(),
            env_exclude: Vec::new(),
            env_include_only: Vec::new(),
            env_set: BTreeMap::new(),
            env_ignore_default_excludes: true,
            cwd: default_cwd(),
            codex_home: default_codex_home(),
            base_instructions: None,
            developer_instructions: None,
            cli_project_docs: None,
            user_personal_instructions: None,
            auto_compact_token_limit: default_auto_compact_token_limit(),
            max_consecutive_tool_loops: default_max_consecutive_tool_loops(),
        }
    }
}

impl SessionConfiguration {
    /// Recompute `auto_compact_token_limit` as 80% of the configured
    /// model's context window when the caller left it at the library
    /// default placeholder (128k-based). Called once at session creation.
    pub fn normalize(&mut self) {
        if self.auto_compact_token_limit == default_auto_compact_token_limit() {
            self.auto_compact_token_limit = (self.model.context_window as f64 * 0.8) as u32;
        }
    }
}

/// Workflow start input (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInput {
    pub conversation_id: String,
    #[serde(default)]
    pub user_message: Option<String>,
    pub config: SessionConfiguration,
}

/// Why the workflow execution ended (spec.md §6 `WorkflowResult.end_reason`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Shutdown,
    Completed,
    Error,
}

/// Workflow completion result (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub conversation_id: String,
    pub total_tokens: u64,
    pub total_cached_tokens: u64,
    pub total_iterations: u64,
    pub tool_calls_executed: Vec<String>,
    pub end_reason: EndReason,
}

/// Handoff payload carried across a `continue_as_new` continuation boundary
/// (spec.md §6 "Persisted state layout").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuationHandoff {
    pub last_summary: Option<String>,
    pub recent_items_tail: Vec<crate::model::ConversationItem>,
    pub totals: crate::model::Totals,
    pub config: SessionConfiguration,
    pub model: ModelSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = SessionConfiguration::default();
        assert_eq!(config.approval_mode, ApprovalMode::UnlessTrusted);
        assert_eq!(config.sandbox_mode, SandboxMode::WorkspaceWrite);
        assert_eq!(config.env_inherit, EnvInherit::Core);
        assert!(config.env_ignore_default_excludes);
        assert!(!config.sandbox_network_access);
    }

    #[test]
    fn auto_compact_limit_tracks_context_window_after_normalize() {
        let mut config = SessionConfiguration {
            model: ModelSettings {
                context_window: 1000,
                ..ModelSettings::default()
            },
            ..SessionConfiguration::default()
        };
        config.normalize();
        assert_eq!(config.auto_compact_token_limit, 800);
    }

    #[test]
    fn deserializes_from_minimal_json() {
        let json = serde_json::json!({
            "model": {},
        });
        let config: SessionConfiguration = serde_json::from_value(json).expect("deserialize");
        assert_eq!(config.model.provider, "openai");
        assert!(config.tools.enable_shell);
    }
}
