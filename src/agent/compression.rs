//! Context compression.
//!
//! Keeps the context sent to the model inside a token budget:
//!
//! ```text
//!  history: [ m0 m1 m2 ... | tail (recent_messages_keep, verbatim) ]
//!            \____ older ___/
//!                  |
//!                  v  strategy (truncation | semantic | summary)
//!            [ reduced older ]
//!                  |
//!                  v  floor: drop oldest groups, hard-truncate the last one
//!            [ fits budget = target - (system + tail + current turn) ]
//! ```
//!
//! A "group" is an assistant message that issues tool calls together with
//! the tool results answering it, or any other single message. Groups are
//! dropped whole so call/result pairs are never split. The tail is never
//! modified, so when the tail alone is over target the final context is
//! too; compression always terminates.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{CompressionConfig, StrategyKind};
use crate::error::{AisbotError, Result};
use crate::providers::{ChatOptions, LLMProvider};
use crate::session::{Message, Role};
use crate::utils::string::{char_len, chunk_chars, prefix_chars, truncate_with_marker};

use super::token::{estimate_message_tokens, estimate_messages_tokens};

/// Ratio applied to older conversation messages.
pub const OLDER_MESSAGE_RATIO: f64 = 0.3;
/// Ratio applied to long tool results before they enter history.
pub const TOOL_RESULT_RATIO: f64 = 0.4;
/// Prefix of the system message produced by the summary strategy.
pub const SUMMARY_PREFIX: &str = "[Conversation Summary]\n";

const TRUNCATION_MIN_CHARS: usize = 200;
const SEMANTIC_MIN_CHARS: usize = 500;
const SECTION_SPLIT_CHARS: usize = 2000;
const SECTION_CHUNK_CHARS: usize = 1000;
const HARD_TRUNCATION_MARKER: &str = "...[truncated]";
const SALIENT_TERMS: &[&str] = &[
    "error",
    "exception",
    "result",
    "summary",
    "conclusion",
    "important",
    "critical",
];

// ============================================================================
// Stats
// ============================================================================

/// Why compression did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Compression is turned off.
    Disabled,
    /// The context already fits `max_context_tokens`.
    UnderLimit,
    /// Nothing older than the kept tail.
    ShortHistory,
}

/// Outcome of one compression decision. Observability only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionStats {
    pub original_tokens: usize,
    pub final_tokens: usize,
    pub reduction: usize,
    pub reduction_percent: f64,
    /// Strategy actually applied (truncation after a summary fallback)
    pub strategy: Option<StrategyKind>,
    /// The summary strategy failed and truncation was used instead
    #[serde(default)]
    pub fell_back: bool,
    pub compressed: bool,
    pub skip_reason: Option<SkipReason>,
}

impl CompressionStats {
    fn skipped(reason: SkipReason, tokens: usize) -> Self {
        Self {
            original_tokens: tokens,
            final_tokens: tokens,
            reduction: 0,
            reduction_percent: 0.0,
            strategy: None,
            fell_back: false,
            compressed: false,
            skip_reason: Some(reason),
        }
    }

    fn applied(original: usize, final_tokens: usize, strategy: StrategyKind, fell_back: bool) -> Self {
        let reduction = original.saturating_sub(final_tokens);
        let reduction_percent = if original == 0 {
            0.0
        } else {
            reduction as f64 * 100.0 / original as f64
        };
        Self {
            original_tokens: original,
            final_tokens,
            reduction,
            reduction_percent,
            strategy: Some(strategy),
            fell_back,
            compressed: true,
            skip_reason: None,
        }
    }
}

/// Compressed history plus what happened.
#[derive(Debug, Clone)]
pub struct CompressionOutcome {
    pub messages: Vec<Message>,
    pub stats: CompressionStats,
}

// ============================================================================
// Content-level reduction
// ============================================================================

/// Shorten text to about `ratio` of its length, preferring to stop at a
/// sentence or line break past 70% of the target. Text under 200 chars is
/// returned unchanged.
pub fn truncate_content(content: &str, ratio: f64) -> String {
    let len = char_len(content);
    if len < TRUNCATION_MIN_CHARS {
        return content.to_string();
    }
    let target = (len as f64 * ratio) as usize;
    let prefix = prefix_chars(content, target);

    let cut = match prefix.rfind(|c: char| c == '.' || c == '\n') {
        Some(idx) if prefix[..idx].chars().count() as f64 > target as f64 * 0.7 => {
            let end = idx + 1;
            &prefix[..end]
        }
        _ => prefix.as_str(),
    };
    format!("{}...", cut)
}

/// Salience of one section of text.
fn section_score(section: &str) -> f64 {
    let mut score = 1.0;
    if section.contains("```") {
        score += 2.0;
    }
    let trimmed = section.trim_start();
    if ["# ", "## ", "### "].iter().any(|h| trimmed.starts_with(h)) {
        score += 1.5;
    }
    let lower = section.to_lowercase();
    score += 0.5 * SALIENT_TERMS.iter().filter(|t| lower.contains(*t)).count() as f64;
    if char_len(section) < 100 {
        score *= 0.5;
    }
    score
}

/// Split text on blank lines; sections over 2000 chars are re-split on
/// line breaks into pieces of roughly 1000 chars.
fn split_sections(content: &str) -> Vec<String> {
    let mut sections = Vec::new();
    for section in content.split("\n\n").filter(|s| !s.trim().is_empty()) {
        if char_len(section) <= SECTION_SPLIT_CHARS {
            sections.push(section.to_string());
            continue;
        }
        let mut current = String::new();
        for line in section.lines() {
            for piece in chunk_chars(line, SECTION_CHUNK_CHARS) {
                if !current.is_empty()
                    && char_len(&current) + 1 + char_len(&piece) > SECTION_CHUNK_CHARS
                {
                    sections.push(std::mem::take(&mut current));
                }
                if !current.is_empty() {
                    current.push('\n');
                }
                current.push_str(&piece);
            }
        }
        if !current.is_empty() {
            sections.push(current);
        }
    }
    sections
}

/// Keep the most salient `ratio` of sections in their original order.
/// Text of 500 chars or less is returned unchanged; text with a single
/// section falls back to [`truncate_content`].
pub fn semantic_content(content: &str, ratio: f64) -> String {
    if char_len(content) <= SEMANTIC_MIN_CHARS {
        return content.to_string();
    }
    let sections = split_sections(content);
    if sections.len() <= 1 {
        return truncate_content(content, ratio);
    }

    let keep = ((sections.len() as f64 * ratio) as usize).max(1);
    let mut scored: Vec<(usize, f64)> = sections
        .iter()
        .enumerate()
        .map(|(i, s)| (i, section_score(s)))
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));

    let mut kept: Vec<usize> = scored.into_iter().take(keep).map(|(i, _)| i).collect();
    kept.sort_unstable();
    kept.iter()
        .map(|&i| sections[i].as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Compress a long tool result before it is stored in history.
///
/// Results shorter than `tool_result_threshold` are returned unchanged.
/// The summary strategy maps to truncation here so tool execution never
/// waits on an extra model call.
pub fn compress_tool_result(content: &str, config: &CompressionConfig) -> String {
    if !config.enabled || char_len(content) < config.tool_result_threshold {
        return content.to_string();
    }
    match config.strategy {
        StrategyKind::Semantic => semantic_content(content, TOOL_RESULT_RATIO),
        StrategyKind::Truncation | StrategyKind::Summary => {
            truncate_content(content, TOOL_RESULT_RATIO)
        }
    }
}

// ============================================================================
// Message groups
// ============================================================================

/// Split messages into atomic groups, preserving order.
pub fn group_messages(messages: Vec<Message>) -> Vec<Vec<Message>> {
    let mut groups: Vec<Vec<Message>> = Vec::new();
    let mut open_calls: HashSet<String> = HashSet::new();

    for msg in messages {
        let answers_open = msg.role == Role::Tool
            && msg
                .tool_call_id
                .as_ref()
                .is_some_and(|id| open_calls.contains(id));

        if answers_open {
            if let Some(id) = &msg.tool_call_id {
                open_calls.remove(id);
            }
            if let Some(group) = groups.last_mut() {
                group.push(msg);
                continue;
            }
        }

        open_calls = msg
            .tool_calls
            .iter()
            .flatten()
            .map(|c| c.id.clone())
            .collect();
        groups.push(vec![msg]);
    }
    groups
}

fn group_tokens(group: &[Message]) -> usize {
    estimate_messages_tokens(group)
}

fn groups_tokens(groups: &[Vec<Message>]) -> usize {
    groups.iter().map(|g| group_tokens(g)).sum()
}

/// Index where the verbatim tail starts. Moves backwards past tool results
/// so the assistant message that issued them is kept with them.
pub fn tail_start(history: &[Message], keep: usize) -> usize {
    let mut start = history.len().saturating_sub(keep);
    while start > 0 && start < history.len() && history[start].role == Role::Tool {
        start -= 1;
    }
    start
}

/// Shorten every message of a lone group so it fits `budget`, or `None` if
/// even empty messages would not fit.
fn hard_truncate_group(group: Vec<Message>, budget: usize) -> Option<Vec<Message>> {
    let fixed: usize = group
        .iter()
        .map(|m| {
            let mut empty = m.clone();
            empty.content.clear();
            estimate_message_tokens(&empty)
        })
        .sum();
    if budget <= fixed {
        return None;
    }
    let per_message_chars = ((budget - fixed) / group.len()) * 4;
    let allowance = per_message_chars.saturating_sub(char_len(HARD_TRUNCATION_MARKER));
    if allowance == 0 {
        return None;
    }
    let truncated: Vec<Message> = group
        .into_iter()
        .map(|mut m| {
            m.content = truncate_with_marker(&m.content, allowance, HARD_TRUNCATION_MARKER);
            m
        })
        .collect();
    (group_tokens(&truncated) <= budget).then_some(truncated)
}

/// Make `messages` fit `budget`: drop oldest groups, then hard-truncate or
/// drop the last remaining one.
pub fn enforce_floor(messages: Vec<Message>, budget: usize) -> Vec<Message> {
    let mut groups = group_messages(messages);
    while groups.len() > 1 && groups_tokens(&groups) > budget {
        groups.remove(0);
    }
    if groups_tokens(&groups) > budget {
        groups = groups
            .pop()
            .and_then(|g| hard_truncate_group(g, budget))
            .into_iter()
            .collect();
    }
    groups.into_iter().flatten().collect()
}

// ============================================================================
// Strategies
// ============================================================================

/// Inputs shared by all strategies.
#[derive(Clone)]
pub struct StrategyContext {
    /// Messages shorter than this are never rewritten
    pub min_content_length: usize,
    /// Completion service for the summary strategy
    pub provider: Option<Arc<dyn LLMProvider>>,
    /// Model override for the summary call
    pub model: Option<String>,
    /// Deadline for the summary call
    pub summary_timeout: Duration,
}

/// Reduces the older segment of a conversation toward a token budget.
///
/// Implementations may return more than `budget` tokens; the compressor
/// applies the floor policy afterwards.
#[async_trait]
pub trait CompressionStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    async fn compress(
        &self,
        older: Vec<Message>,
        budget: usize,
        ctx: &StrategyContext,
    ) -> Result<Vec<Message>>;
}

fn shorten_eligible(
    messages: Vec<Message>,
    min_len: usize,
    shorten: impl Fn(&str) -> String,
) -> Vec<Message> {
    messages
        .into_iter()
        .map(|mut m| {
            if char_len(&m.content) >= min_len {
                let shorter = shorten(&m.content);
                if char_len(&shorter) < char_len(&m.content) {
                    m.content = shorter;
                }
            }
            m
        })
        .collect()
}

/// Sentence-boundary shortening, then oldest-first group drops.
pub struct TruncationStrategy;

#[async_trait]
impl CompressionStrategy for TruncationStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Truncation
    }

    async fn compress(
        &self,
        older: Vec<Message>,
        budget: usize,
        ctx: &StrategyContext,
    ) -> Result<Vec<Message>> {
        if estimate_messages_tokens(&older) <= budget {
            return Ok(older);
        }
        let shortened = shorten_eligible(older, ctx.min_content_length, |c| {
            truncate_content(c, OLDER_MESSAGE_RATIO)
        });
        Ok(enforce_floor(shortened, budget))
    }
}

/// Section salience scoring, then lowest-salience group drops.
pub struct SemanticStrategy;

impl SemanticStrategy {
    fn group_salience(group: &[Message]) -> f64 {
        group
            .iter()
            .map(|m| section_score(&m.content))
            .fold(0.0, f64::max)
    }
}

#[async_trait]
impl CompressionStrategy for SemanticStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Semantic
    }

    async fn compress(
        &self,
        older: Vec<Message>,
        budget: usize,
        ctx: &StrategyContext,
    ) -> Result<Vec<Message>> {
        if estimate_messages_tokens(&older) <= budget {
            return Ok(older);
        }
        let shortened = shorten_eligible(older, ctx.min_content_length, |c| {
            semantic_content(c, OLDER_MESSAGE_RATIO)
        });

        let groups = group_messages(shortened);
        let mut order: Vec<(usize, f64)> = groups
            .iter()
            .enumerate()
            .map(|(i, g)| (i, Self::group_salience(g)))
            .collect();
        order.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));

        let mut total = groups_tokens(&groups);
        let mut dropped = HashSet::new();
        for (idx, _) in order {
            if total <= budget || dropped.len() + 1 >= groups.len() {
                break;
            }
            total -= group_tokens(&groups[idx]);
            dropped.insert(idx);
        }

        let kept: Vec<Message> = groups
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !dropped.contains(i))
            .flat_map(|(_, g)| g)
            .collect();
        Ok(enforce_floor(kept, budget))
    }
}

/// One model call condensing the older segment into a system message.
pub struct SummaryStrategy;

impl SummaryStrategy {
    fn build_prompt(older: &[Message], target_tokens: usize) -> String {
        let transcript = older
            .iter()
            .map(|m| match (&m.role, &m.tool_call_id) {
                (Role::Tool, Some(id)) => format!("tool({}): {}", id, m.content),
                (role, _) => format!("{}: {}", role, m.content),
            })
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "Summarize the following conversation so it can replace the original. \
             Keep facts, decisions, open tasks and tool results the assistant relied on. \
             Stay under about {} tokens.\n\n{}",
            target_tokens, transcript
        )
    }
}

#[async_trait]
impl CompressionStrategy for SummaryStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Summary
    }

    async fn compress(
        &self,
        older: Vec<Message>,
        budget: usize,
        ctx: &StrategyContext,
    ) -> Result<Vec<Message>> {
        let provider = ctx
            .provider
            .as_ref()
            .ok_or_else(|| AisbotError::Provider("No provider for summary".to_string()))?;

        let target = budget.max(64);
        let prompt = Self::build_prompt(&older, target);
        let options = ChatOptions::new().with_max_tokens(target.min(u32::MAX as usize) as u32);
        let call = provider.chat(vec![Message::user(&prompt)], vec![], ctx.model.as_deref(), options);

        let response = tokio::time::timeout(ctx.summary_timeout, call)
            .await
            .map_err(|_| AisbotError::Timeout("summary call".to_string()))??;

        let summary = response.content.trim();
        if summary.is_empty() {
            return Err(AisbotError::Provider("empty summary".to_string()));
        }
        Ok(enforce_floor(
            vec![Message::system(&format!("{}{}", SUMMARY_PREFIX, summary))],
            budget,
        ))
    }
}

/// Strategy object for a configured kind.
pub fn strategy_for(kind: StrategyKind) -> Box<dyn CompressionStrategy> {
    match kind {
        StrategyKind::Truncation => Box::new(TruncationStrategy),
        StrategyKind::Semantic => Box::new(SemanticStrategy),
        StrategyKind::Summary => Box::new(SummaryStrategy),
    }
}

// ============================================================================
// Compressor
// ============================================================================

/// Decides whether to compress and applies the configured strategy.
pub struct ContextCompressor {
    config: CompressionConfig,
}

impl ContextCompressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Compress `history` given `reserved_tokens` already spent on the system
    /// prompt and current turn.
    ///
    /// Never fails: a failing summary falls back to truncation.
    pub async fn compress(
        &self,
        history: &[Message],
        reserved_tokens: usize,
        provider: Option<Arc<dyn LLMProvider>>,
        model: Option<&str>,
    ) -> CompressionOutcome {
        let cfg = &self.config;
        let history_tokens = estimate_messages_tokens(history);
        let original = reserved_tokens + history_tokens;

        let skip = if !cfg.enabled {
            Some(SkipReason::Disabled)
        } else if original <= cfg.max_context_tokens {
            Some(SkipReason::UnderLimit)
        } else if history.len() <= cfg.recent_messages_keep {
            Some(SkipReason::ShortHistory)
        } else {
            None
        };

        let split = tail_start(history, cfg.recent_messages_keep);
        let skip = skip.or((split == 0).then_some(SkipReason::ShortHistory));
        if let Some(reason) = skip {
            return CompressionOutcome {
                messages: history.to_vec(),
                stats: CompressionStats::skipped(reason, original),
            };
        }

        let (older, tail) = history.split_at(split);
        let tail_tokens = estimate_messages_tokens(tail);
        let budget = cfg
            .target_context_tokens
            .saturating_sub(reserved_tokens + tail_tokens);

        let ctx = StrategyContext {
            min_content_length: cfg.min_content_length,
            provider,
            model: model.map(str::to_string),
            summary_timeout: Duration::from_secs(cfg.summary_timeout_secs),
        };

        let strategy = strategy_for(cfg.strategy);
        let (reduced, applied, fell_back) =
            match strategy.compress(older.to_vec(), budget, &ctx).await {
                Ok(reduced) => (reduced, cfg.strategy, false),
                Err(e) => {
                    warn!(
                        strategy = %cfg.strategy,
                        error = %e,
                        "Compression strategy failed, falling back to truncation"
                    );
                    let reduced = TruncationStrategy
                        .compress(older.to_vec(), budget, &ctx)
                        .await
                        .unwrap_or_else(|_| enforce_floor(older.to_vec(), budget));
                    (reduced, StrategyKind::Truncation, true)
                }
            };
        // Strategies may overshoot; the floor is always applied.
        let reduced = enforce_floor(reduced, budget);

        let mut messages = reduced;
        messages.extend_from_slice(tail);
        let final_tokens = reserved_tokens + estimate_messages_tokens(&messages);
        let stats = CompressionStats::applied(original, final_tokens, applied, fell_back);

        crate::log_component!(
            info,
            "compression",
            "Context compressed",
            strategy = applied.to_string().as_str(),
            original_tokens = original as u64,
            final_tokens = final_tokens as u64,
            dropped_messages = (history.len().saturating_sub(messages.len())) as u64,
            fell_back = fell_back,
        );
        if final_tokens > cfg.target_context_tokens {
            crate::log_component!(
                warn,
                "compression",
                "Context still over target, recent messages alone exceed it",
                final_tokens = final_tokens as u64,
                target = cfg.target_context_tokens as u64,
            );
        }

        CompressionOutcome { messages, stats }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{LLMResponse, ToolDefinition};
    use crate::session::ToolCall;

    fn config(strategy: StrategyKind) -> CompressionConfig {
        CompressionConfig {
            max_context_tokens: 1000,
            target_context_tokens: 600,
            recent_messages_keep: 4,
            strategy,
            ..CompressionConfig::default()
        }
    }

    fn long_history(n: usize, chars: usize) -> Vec<Message> {
        (0..n)
            .map(|i| {
                let body = format!("message {} ", i).repeat(chars / 10 + 1);
                if i % 2 == 0 {
                    Message::user(&body)
                } else {
                    Message::assistant(&body)
                }
            })
            .collect()
    }

    struct FixedSummary(&'static str);

    #[async_trait]
    impl LLMProvider for FixedSummary {
        async fn chat(
            &self,
            _messages: Vec<Message>,
            _tools: Vec<ToolDefinition>,
            _model: Option<&str>,
            _options: ChatOptions,
        ) -> Result<LLMResponse> {
            Ok(LLMResponse::text(self.0))
        }
        fn default_model(&self) -> &str {
            "summary-model"
        }
        fn name(&self) -> &str {
            "fixed"
        }
    }

    struct BrokenSummary;

    #[async_trait]
    impl LLMProvider for BrokenSummary {
        async fn chat(
            &self,
            _messages: Vec<Message>,
            _tools: Vec<ToolDefinition>,
            _model: Option<&str>,
            _options: ChatOptions,
        ) -> Result<LLMResponse> {
            Err(AisbotError::Provider("HTTP 503".into()))
        }
        fn default_model(&self) -> &str {
            "broken"
        }
        fn name(&self) -> &str {
            "broken"
        }
    }

    // ========================================================================
    // Content-level reduction
    // ========================================================================

    #[test]
    fn test_truncate_content_short_unchanged() {
        let s = "short text.";
        assert_eq!(truncate_content(s, 0.3), s);
    }

    #[test]
    fn test_truncate_content_prefers_sentence_boundary() {
        let sentence = "This is a sentence that keeps going on. ";
        let content = sentence.repeat(20);
        let out = truncate_content(&content, 0.3);
        assert!(out.ends_with("...."));
        assert!(char_len(&out) < char_len(&content) / 2);
    }

    #[test]
    fn test_truncate_content_multibyte_safe() {
        let content = "日本語のテキスト".repeat(60);
        let out = truncate_content(&content, 0.3);
        assert!(out.ends_with("..."));
        assert!(char_len(&out) <= char_len(&content) * 3 / 10 + 3);
    }

    #[test]
    fn test_semantic_keeps_salient_sections_in_order() {
        let filler = "plain filler text that carries little meaning at all. ".repeat(3);
        let mut sections = Vec::new();
        for i in 0..8 {
            sections.push(format!("{} {}", filler, i));
        }
        sections.insert(2, "## Result\nThe important result is 42.\n```\ncode\n```".to_string());
        sections.insert(6, "A critical error occurred: exception in worker.".repeat(3));
        let content = sections.join("\n\n");

        let out = semantic_content(&content, 0.3);
        let result_pos = out.find("## Result").unwrap();
        let error_pos = out.find("critical error").unwrap();
        assert!(result_pos < error_pos);
        assert!(char_len(&out) < char_len(&content));
    }

    #[test]
    fn test_semantic_small_content_unchanged() {
        let content = "a\n\nb\n\nc";
        assert_eq!(semantic_content(content, 0.3), content);
    }

    #[test]
    fn test_semantic_single_section_falls_back_to_truncation() {
        let content = "word ".repeat(200);
        let out = semantic_content(&content, 0.3);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn test_split_sections_chunks_long_sections() {
        let long = (0..60)
            .map(|i| format!("line number {} of a very long section", i))
            .collect::<Vec<_>>()
            .join("\n");
        assert!(char_len(&long) > SECTION_SPLIT_CHARS);
        let sections = split_sections(&long);
        assert!(sections.len() >= 2);
        assert!(sections
            .iter()
            .all(|s| char_len(s) <= SECTION_CHUNK_CHARS));
    }

    #[test]
    fn test_compress_tool_result_threshold() {
        let cfg = CompressionConfig::default();
        let short = "x".repeat(999);
        assert_eq!(compress_tool_result(&short, &cfg), short);
        let long = "Line of output.\n".repeat(200);
        assert!(char_len(&compress_tool_result(&long, &cfg)) < char_len(&long));

        let disabled = CompressionConfig {
            enabled: false,
            ..CompressionConfig::default()
        };
        assert_eq!(compress_tool_result(&long, &disabled), long);
    }

    // ========================================================================
    // Groups and floor
    // ========================================================================

    fn tool_exchange(id: &str) -> Vec<Message> {
        vec![
            Message::assistant_with_tools("", vec![ToolCall::new(id, "add", "{}")]),
            Message::tool_result(id, "3"),
        ]
    }

    #[test]
    fn test_group_messages_keeps_pairs() {
        let mut msgs = vec![Message::user("hi")];
        msgs.extend(tool_exchange("c1"));
        msgs.push(Message::assistant("done"));
        let groups = group_messages(msgs);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[1].len(), 2);
        assert_eq!(groups[1][1].tool_call_id.as_deref(), Some("c1"));
    }

    #[test]
    fn test_tail_start_never_splits_pairs() {
        let mut msgs = long_history(4, 20);
        msgs.extend(tool_exchange("c1"));
        msgs.push(Message::assistant("final"));
        // keep=2 would start on the tool result; the tail must include its call.
        let start = tail_start(&msgs, 2);
        assert_eq!(start, 4);
        assert!(msgs[start].has_tool_calls());
    }

    #[test]
    fn test_enforce_floor_drops_oldest_then_truncates() {
        let msgs = long_history(5, 400);
        let last = msgs[4].content.clone();
        let out = enforce_floor(msgs, 60);
        assert_eq!(out.len(), 1);
        assert!(out[0].content.ends_with(HARD_TRUNCATION_MARKER));
        assert!(last.starts_with(out[0].content.trim_end_matches(HARD_TRUNCATION_MARKER)));
        assert!(estimate_messages_tokens(&out) <= 60);
    }

    #[test]
    fn test_enforce_floor_zero_budget_drops_everything() {
        assert!(enforce_floor(long_history(3, 100), 0).is_empty());
    }

    // ========================================================================
    // Compressor
    // ========================================================================

    #[tokio::test]
    async fn test_skip_reasons() {
        let compressor = ContextCompressor::new(config(StrategyKind::Truncation));
        let short = long_history(2, 50);
        let out = compressor.compress(&short, 0, None, None).await;
        assert_eq!(out.stats.skip_reason, Some(SkipReason::UnderLimit));
        assert!(!out.stats.compressed);

        let huge_short = long_history(3, 2000);
        let out = compressor.compress(&huge_short, 0, None, None).await;
        assert_eq!(out.stats.skip_reason, Some(SkipReason::ShortHistory));
        assert_eq!(out.messages, huge_short);

        let disabled = ContextCompressor::new(CompressionConfig {
            enabled: false,
            ..config(StrategyKind::Truncation)
        });
        let out = disabled.compress(&long_history(30, 400), 0, None, None).await;
        assert_eq!(out.stats.skip_reason, Some(SkipReason::Disabled));
    }

    #[tokio::test]
    async fn test_tail_preserved_verbatim_for_every_strategy() {
        let history = long_history(30, 400);
        for kind in [
            StrategyKind::Truncation,
            StrategyKind::Semantic,
            StrategyKind::Summary,
        ] {
            let compressor = ContextCompressor::new(config(kind));
            let provider: Arc<dyn LLMProvider> = Arc::new(FixedSummary("they talked"));
            let out = compressor
                .compress(&history, 50, Some(provider), None)
                .await;
            assert!(out.stats.compressed, "{:?}", kind);
            let n = out.messages.len();
            assert_eq!(&out.messages[n - 4..], &history[history.len() - 4..]);
            assert!(out.stats.final_tokens < out.stats.original_tokens);
        }
    }

    #[tokio::test]
    async fn test_summary_produces_summary_message() {
        let compressor = ContextCompressor::new(config(StrategyKind::Summary));
        let provider: Arc<dyn LLMProvider> = Arc::new(FixedSummary("User asked about Rust."));
        let history = long_history(20, 400);
        let out = compressor.compress(&history, 0, Some(provider), None).await;
        assert_eq!(out.stats.strategy, Some(StrategyKind::Summary));
        assert!(!out.stats.fell_back);
        assert_eq!(out.messages[0].role, Role::System);
        assert_eq!(
            out.messages[0].content,
            "[Conversation Summary]\nUser asked about Rust."
        );
        assert_eq!(out.messages.len(), 5);
    }

    #[tokio::test]
    async fn test_summary_failure_falls_back_to_truncation() {
        let compressor = ContextCompressor::new(config(StrategyKind::Summary));
        let history = long_history(20, 400);

        let out = compressor
            .compress(&history, 0, Some(Arc::new(BrokenSummary)), None)
            .await;
        assert!(out.stats.fell_back);
        assert_eq!(out.stats.strategy, Some(StrategyKind::Truncation));

        let out = compressor.compress(&history, 0, None, None).await;
        assert!(out.stats.fell_back);
    }

    #[tokio::test]
    async fn test_compression_is_idempotent() {
        let compressor = ContextCompressor::new(config(StrategyKind::Semantic));
        let history = long_history(30, 400);
        let first = compressor.compress(&history, 40, None, None).await;
        assert!(first.stats.compressed);
        assert!(first.stats.final_tokens <= 600);

        let second = compressor.compress(&first.messages, 40, None, None).await;
        assert!(!second.stats.compressed);
        assert_eq!(second.messages, first.messages);
    }

    #[tokio::test]
    async fn test_tail_over_target_still_terminates() {
        let compressor = ContextCompressor::new(config(StrategyKind::Truncation));
        let history = long_history(10, 2000);
        let out = compressor.compress(&history, 0, None, None).await;
        assert!(out.stats.compressed);
        assert!(out.stats.final_tokens > 600);
        assert_eq!(out.messages, history[history.len() - 4..].to_vec());
    }

    #[tokio::test]
    async fn test_truncation_is_deterministic() {
        let compressor = ContextCompressor::new(config(StrategyKind::Truncation));
        let history = long_history(25, 300);
        let a = compressor.compress(&history, 0, None, None).await;
        let b = compressor.compress(&history, 0, None, None).await;
        assert_eq!(a.messages, b.messages);
        assert_eq!(a.stats, b.stats);
    }

    #[test]
    fn test_stats_serde() {
        let stats = CompressionStats::applied(1000, 600, StrategyKind::Semantic, false);
        assert_eq!(stats.reduction, 400);
        assert!((stats.reduction_percent - 40.0).abs() < f64::EPSILON);
        let json = serde_json::to_string(&stats).unwrap();
        let back: CompressionStats = serde_json::from_str(&json).unwrap();
        assert_eq!(back, stats);
    }
}
