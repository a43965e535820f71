//! Context builder for agent conversations
//!
//! Assembles what is sent to the model on every iteration: the system prompt
//! (served from [`SystemPromptCache`] when its inputs are unchanged), a
//! per-call session block, and the conversation history after compression.
//!
//! With a workspace set, the bootstrap files ([`BOOTSTRAP_FILES`]) and
//! `memory/MEMORY.md` are read on every build and hashed with the other
//! prompt inputs, so editing one of them invalidates the cached prompt.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::warn;

use crate::config::CompressionConfig;
use crate::providers::{LLMProvider, ToolDefinition};
use crate::session::Message;

use super::compression::{CompressionStats, ContextCompressor};
use super::prompt_cache::{hash_sources, PromptLookup, SystemPromptCache};
use super::token::{estimate_message_tokens, estimate_tokens};

const DEFAULT_IDENTITY: &str = r#"You are aisbot, a personal AI assistant reachable from several chat platforms.

You have access to tools to help accomplish tasks. Use them when needed.

Be concise but helpful. Focus on completing the user's request efficiently."#;

/// Workspace files rendered into the system prompt, in prompt order.
pub const BOOTSTRAP_FILES: [&str; 5] = ["AGENTS.md", "SOUL.md", "USER.md", "TOOLS.md", "IDENTITY.md"];

/// Long-term memory, relative to the workspace.
pub const MEMORY_FILE: &str = "memory/MEMORY.md";

/// Prompt inputs read from the workspace for one build.
#[derive(Debug, Default)]
struct WorkspaceFiles {
    bootstrap: Vec<(&'static str, String)>,
    memory: Option<String>,
}

impl WorkspaceFiles {
    async fn load(root: &Path) -> Self {
        let mut bootstrap = Vec::new();
        for name in BOOTSTRAP_FILES {
            if let Some(content) = read_prompt_file(&root.join(name)).await {
                bootstrap.push((name, content));
            }
        }
        Self {
            bootstrap,
            memory: read_prompt_file(&root.join(MEMORY_FILE)).await,
        }
    }

    fn render_bootstrap(&self) -> Option<String> {
        if self.bootstrap.is_empty() {
            return None;
        }
        let sections: Vec<String> = self
            .bootstrap
            .iter()
            .map(|(name, content)| format!("## {}\n\n{}", name, content))
            .collect();
        Some(sections.join("\n\n"))
    }
}

/// Trimmed file content; `None` when missing, unreadable or blank.
async fn read_prompt_file(path: &Path) -> Option<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => {
            let content = content.trim();
            (!content.is_empty()).then(|| content.to_string())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read workspace prompt file");
            None
        }
    }
}

/// Environment facts rendered into the system prompt.
///
/// Only stable facts belong here: the rendered block is part of the cached
/// prompt, so anything that changes per call would defeat the cache.
#[derive(Debug, Clone, Default)]
pub struct RuntimeContext {
    /// Workspace directory
    pub workspace: Option<String>,
    /// OS and architecture
    pub os_info: Option<String>,
}

impl RuntimeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workspace(mut self, workspace: &str) -> Self {
        self.workspace = Some(workspace.to_string());
        self
    }

    pub fn with_os_info(mut self) -> Self {
        self.os_info = Some(format!(
            "{} {}",
            std::env::consts::OS,
            std::env::consts::ARCH
        ));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.workspace.is_none() && self.os_info.is_none()
    }

    /// Render as a markdown section, or `None` when empty.
    pub fn render(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }

        let mut parts = Vec::new();
        if let Some(ref workspace) = self.workspace {
            parts.push(format!("- Workspace: {}", workspace));
        }
        if let Some(ref os) = self.os_info {
            parts.push(format!("- Platform: {}", os));
        }

        Some(format!("## Runtime Context\n\n{}", parts.join("\n")))
    }
}

/// Where the current conversation lives. Rendered per call, outside the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    pub channel: String,
    pub chat_id: String,
}

impl SessionInfo {
    pub fn new(channel: &str, chat_id: &str) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
        }
    }

    fn render(&self) -> String {
        format!(
            "## Current Session\nChannel: {}\nChat ID: {}",
            self.channel, self.chat_id
        )
    }
}

/// Everything one model call needs, plus what the builder decided.
#[derive(Debug, Clone)]
pub struct BuiltContext {
    /// System message first, then (compressed) history, then the current turn
    pub messages: Vec<Message>,
    pub stats: CompressionStats,
    /// Cache key of the rendered system prompt
    pub prompt_hash: String,
    pub cache_hit: bool,
}

/// Builds model context from prompt sources and history.
pub struct ContextBuilder {
    identity: String,
    soul: Option<String>,
    skills: Option<String>,
    runtime_context: Option<RuntimeContext>,
    workspace: Option<PathBuf>,
    compressor: ContextCompressor,
    cache: Arc<SystemPromptCache>,
}

impl ContextBuilder {
    pub fn new(config: CompressionConfig) -> Self {
        let cache = Arc::new(SystemPromptCache::new(config.prompt_cache_capacity));
        Self {
            identity: DEFAULT_IDENTITY.to_string(),
            soul: None,
            skills: None,
            runtime_context: None,
            workspace: None,
            compressor: ContextCompressor::new(config),
            cache,
        }
    }

    /// Replace the identity prompt.
    pub fn with_identity(mut self, prompt: &str) -> Self {
        self.identity = prompt.to_string();
        self
    }

    /// Persona text placed before the identity prompt.
    pub fn with_soul(mut self, content: &str) -> Self {
        self.soul = Some(content.to_string());
        self
    }

    pub fn with_skills(mut self, skills: &str) -> Self {
        self.skills = Some(skills.to_string());
        self
    }

    pub fn with_runtime_context(mut self, ctx: RuntimeContext) -> Self {
        self.runtime_context = (!ctx.is_empty()).then_some(ctx);
        self
    }

    /// Read bootstrap and memory files from `path` on every build.
    pub fn with_workspace(mut self, path: &Path) -> Self {
        self.workspace = Some(path.to_path_buf());
        self
    }

    pub fn workspace(&self) -> Option<&Path> {
        self.workspace.as_deref()
    }

    /// Share a prompt cache between builders.
    pub fn with_cache(mut self, cache: Arc<SystemPromptCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &Arc<SystemPromptCache> {
        &self.cache
    }

    pub fn compression_config(&self) -> &CompressionConfig {
        self.compressor.config()
    }

    async fn workspace_files(&self) -> WorkspaceFiles {
        match self.workspace.as_deref() {
            Some(root) => WorkspaceFiles::load(root).await,
            None => WorkspaceFiles::default(),
        }
    }

    fn sources(&self, tools: &[ToolDefinition], files: &WorkspaceFiles) -> BTreeMap<String, String> {
        let mut sources = BTreeMap::new();
        sources.insert("identity".to_string(), self.identity.clone());
        for (name, content) in &files.bootstrap {
            sources.insert(format!("bootstrap:{}", name), content.clone());
        }
        if let Some(ref memory) = files.memory {
            sources.insert("memory".to_string(), memory.clone());
        }
        if let Some(summary) = tools_summary(tools) {
            sources.insert("tools".to_string(), summary);
        }
        if let Some(ref soul) = self.soul {
            sources.insert("soul".to_string(), soul.clone());
        }
        if let Some(ref skills) = self.skills {
            sources.insert("skills".to_string(), skills.clone());
        }
        if let Some(rendered) = self.runtime_context.as_ref().and_then(|c| c.render()) {
            sources.insert("runtime".to_string(), rendered);
        }
        sources
    }

    /// Render the system prompt from its sources, without the session block.
    pub async fn render_system_prompt(&self, tools: &[ToolDefinition]) -> String {
        let files = self.workspace_files().await;
        self.render(tools, &files)
    }

    fn render(&self, tools: &[ToolDefinition], files: &WorkspaceFiles) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(ref soul) = self.soul {
            parts.push(soul.clone());
        }
        parts.push(self.identity.clone());
        if let Some(bootstrap) = files.render_bootstrap() {
            parts.push(bootstrap);
        }
        if let Some(ref skills) = self.skills {
            parts.push(format!("## Available Skills\n\n{}", skills));
        }
        if let Some(summary) = tools_summary(tools) {
            parts.push(summary);
        }
        if let Some(ref memory) = files.memory {
            parts.push(format!("# Memory\n\n{}", memory));
        }
        if let Some(rendered) = self.runtime_context.as_ref().and_then(|c| c.render()) {
            parts.push(rendered);
        }
        parts.join("\n\n---\n\n")
    }

    /// Build the context for one model call.
    ///
    /// # Arguments
    /// * `history` - Conversation so far, oldest first
    /// * `current_turn` - Message that must follow the history verbatim, if any
    /// * `session` - Channel and chat for the per-call session block
    /// * `tools` - Tools offered to the model in this call
    /// * `summarizer` - Completion service for the summary strategy
    /// * `model` - Model for the summary call
    pub async fn build(
        &self,
        history: &[Message],
        current_turn: Option<&Message>,
        session: &SessionInfo,
        tools: &[ToolDefinition],
        summarizer: Option<Arc<dyn LLMProvider>>,
        model: Option<&str>,
    ) -> BuiltContext {
        let files = self.workspace_files().await;
        let sources = self.sources(tools, &files);
        let lookup = if self.compressor.config().preserve_system_prompt_cache {
            self.cache
                .get_or_render(&sources, || self.render(tools, &files))
                .await
        } else {
            PromptLookup {
                rendered: self.render(tools, &files),
                hash: hash_sources(&sources),
                hit: false,
            }
        };

        let system = Message::system(&format!("{}\n\n{}", lookup.rendered, session.render()));
        let reserved = estimate_message_tokens(&system)
            + current_turn.map(estimate_message_tokens).unwrap_or(0);

        let outcome = self
            .compressor
            .compress(history, reserved, summarizer, model)
            .await;

        let mut messages = Vec::with_capacity(outcome.messages.len() + 2);
        messages.push(system);
        messages.extend(outcome.messages);
        if let Some(turn) = current_turn {
            messages.push(turn.clone());
        }

        BuiltContext {
            messages,
            stats: outcome.stats,
            prompt_hash: lookup.hash,
            cache_hit: lookup.hit,
        }
    }

    /// Estimated tokens of the cached part of the system prompt.
    pub async fn system_prompt_tokens(&self, tools: &[ToolDefinition]) -> usize {
        estimate_tokens(&self.render_system_prompt(tools).await)
    }
}

/// One line per tool, sorted as given.
fn tools_summary(tools: &[ToolDefinition]) -> Option<String> {
    if tools.is_empty() {
        return None;
    }
    let lines: Vec<String> = tools
        .iter()
        .map(|t| format!("- {}: {}", t.name, t.description))
        .collect();
    Some(format!("## Tools\n\n{}", lines.join("\n")))
}
