//! Agent loop implementation
//!
//! This module provides the per-session state machine that turns an inbound
//! envelope into a reply: build context, call the model, run the tools it
//! asks for, repeat, respond.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::{watch, Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::bus::{
    DeliveryState, Envelope, InboundSource, MediaAttachment, MessageBus, OutboundSink,
};
use crate::config::Config;
use crate::error::{AisbotError, ErrorClass, Result};
use crate::providers::retry::RetryProvider;
use crate::providers::{ChatOptions, LLMProvider, LLMResponse, LLMToolCall};
use crate::session::{Message, Session, SessionManager, ToolCall};
use crate::tools::{Tool, ToolContext, ToolOutput, ToolRegistry};
use crate::utils::string::char_len;

use super::compression::compress_tool_result;
use super::context::{ContextBuilder, RuntimeContext, SessionInfo};

/// Channel whose envelopes come from background work rather than a user.
///
/// Build them with [`Envelope::system`] so they share the origin chat's bus
/// session key.
pub const SYSTEM_CHANNEL: &str = "system";

const NO_RESPONSE_FALLBACK: &str = "I've completed processing but have no response to give.";
const SYSTEM_FALLBACK: &str = "Background task completed.";
/// Origin channel for system envelopes whose chat id has no channel part.
const DEFAULT_ORIGIN_CHANNEL: &str = "cli";

/// Where a cycle stands for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopState {
    #[default]
    Idle,
    AwaitingModel,
    ExecutingTools,
    Responding,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoopState::Idle => "idle",
            LoopState::AwaitingModel => "awaiting_model",
            LoopState::ExecutingTools => "executing_tools",
            LoopState::Responding => "responding",
        };
        write!(f, "{}", s)
    }
}

/// How one inbound envelope maps onto a session and a reply.
struct Turn {
    session_key: String,
    reply_channel: String,
    reply_chat_id: String,
    user_text: String,
    media: Vec<MediaAttachment>,
    fallback: &'static str,
}

impl Turn {
    fn for_envelope(envelope: &Envelope) -> Self {
        if envelope.channel != SYSTEM_CHANNEL {
            return Self {
                session_key: envelope.session_key.clone(),
                reply_channel: envelope.channel.clone(),
                reply_chat_id: envelope.chat_id.clone(),
                user_text: envelope.content().to_string(),
                media: envelope.payload.media.clone(),
                fallback: NO_RESPONSE_FALLBACK,
            };
        }

        let (channel, chat_id) = envelope
            .chat_id
            .split_once(':')
            .unwrap_or((DEFAULT_ORIGIN_CHANNEL, envelope.chat_id.as_str()));
        Self {
            session_key: format!("{}:{}", channel, chat_id),
            reply_channel: channel.to_string(),
            reply_chat_id: chat_id.to_string(),
            user_text: format!("[System: {}] {}", envelope.sender_id, envelope.content()),
            media: envelope.payload.media.clone(),
            fallback: SYSTEM_FALLBACK,
        }
    }

    fn reply(&self, inbound: &Envelope, content: &str) -> Envelope {
        Envelope::reply(inbound, content)
            .with_route(&self.reply_channel, &self.reply_chat_id)
            .with_session_key(&self.session_key)
    }
}

/// The agent engine.
///
/// Talks to the bus only through [`InboundSource`] and [`OutboundSink`].
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use aisbot::agent::AgentLoop;
/// use aisbot::bus::MessageBus;
/// use aisbot::config::Config;
/// use aisbot::session::SessionManager;
///
/// let bus = Arc::new(MessageBus::new());
/// let agent = AgentLoop::new(Config::default(), SessionManager::new_memory(), bus);
/// assert!(!agent.is_running());
/// ```
pub struct AgentLoop {
    config: Config,
    session_manager: Arc<SessionManager>,
    inbound: Arc<dyn InboundSource>,
    outbound: Arc<dyn OutboundSink>,
    /// Cloned out at the start of each cycle
    provider: RwLock<Option<Arc<dyn LLMProvider>>>,
    tools: RwLock<ToolRegistry>,
    context_builder: ContextBuilder,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    /// Per-session locks serializing cycles of the same session
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    states: RwLock<HashMap<String, LoopState>>,
    /// Inbound envelopes whose task is running, with the session each runs against
    active: Mutex<HashMap<String, String>>,
}

impl AgentLoop {
    /// Create an agent loop reading from and replying to `bus`.
    pub fn new(config: Config, session_manager: SessionManager, bus: Arc<MessageBus>) -> Self {
        let inbound: Arc<dyn InboundSource> = bus.clone();
        let outbound: Arc<dyn OutboundSink> = bus;
        Self::with_io(config, session_manager, inbound, outbound)
    }

    /// Create an agent loop over arbitrary inbound and outbound endpoints.
    pub fn with_io(
        config: Config,
        session_manager: SessionManager,
        inbound: Arc<dyn InboundSource>,
        outbound: Arc<dyn OutboundSink>,
    ) -> Self {
        let workspace = config.workspace_path();
        let context_builder = ContextBuilder::new(config.compression.clone())
            .with_workspace(&workspace)
            .with_runtime_context(
                RuntimeContext::new()
                    .with_workspace(&workspace.to_string_lossy())
                    .with_os_info(),
            );
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            session_manager: Arc::new(session_manager),
            inbound,
            outbound,
            provider: RwLock::new(None),
            tools: RwLock::new(ToolRegistry::new()),
            context_builder,
            running: AtomicBool::new(false),
            shutdown_tx,
            session_locks: Mutex::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the context builder (builder pattern).
    pub fn with_context_builder(mut self, context_builder: ContextBuilder) -> Self {
        self.context_builder = context_builder;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Set the completion service. It is wrapped with timeout and retry
    /// handling from the agent defaults.
    pub async fn set_provider(&self, provider: Arc<dyn LLMProvider>) {
        let wrapped: Arc<dyn LLMProvider> = Arc::new(RetryProvider::from_defaults(
            provider,
            &self.config.agents.defaults,
        ));
        *self.provider.write().await = Some(wrapped);
    }

    pub async fn register_tool(&self, tool: Box<dyn Tool>) {
        self.tools.write().await.register(tool);
    }

    pub async fn tool_count(&self) -> usize {
        self.tools.read().await.len()
    }

    pub async fn has_tool(&self, name: &str) -> bool {
        self.tools.read().await.has(name)
    }

    /// Current state of the cycle for `session_key`.
    pub async fn loop_state(&self, session_key: &str) -> LoopState {
        self.states
            .read()
            .await
            .get(session_key)
            .copied()
            .unwrap_or_default()
    }

    async fn set_state(&self, session_key: &str, state: LoopState) {
        let mut states = self.states.write().await;
        if state == LoopState::Idle {
            states.remove(session_key);
        } else {
            states.insert(session_key.to_string(), state);
        }
    }

    async fn session_lock(&self, session_key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        Arc::clone(
            locks
                .entry(session_key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Run one cycle for an inbound envelope and return its reply.
    ///
    /// The session is saved (with the envelope recorded as processed) before
    /// this returns; publishing the reply and acknowledging the envelope are
    /// left to the caller. An envelope already in the processed ledger gets
    /// its stored reply back without any model call.
    ///
    /// # Errors
    /// Only errors that escape the cycle (see
    /// [`AisbotError::escapes_cycle`]). Model and tool failures become reply
    /// or history content instead.
    pub async fn process_envelope(&self, envelope: &Envelope) -> Result<Envelope> {
        let turn = Turn::for_envelope(envelope);

        let lock = self.session_lock(&turn.session_key).await;
        let _guard = lock.lock().await;

        let mut session = self.session_manager.get_or_create(&turn.session_key).await?;
        if let Some(done) = session.processed_reply(&envelope.id) {
            info!(envelope_id = %envelope.id, "Envelope already processed, replaying stored reply");
            return Ok(Envelope::reply(envelope, &done.reply)
                .with_route(&done.reply_channel, &done.reply_chat_id)
                .with_session_key(&turn.session_key));
        }

        let result = self.run_cycle(&mut session, envelope, &turn).await;
        self.set_state(&turn.session_key, LoopState::Idle).await;

        match result {
            Ok(reply) => Ok(turn.reply(envelope, &reply)),
            Err(e) => {
                if e.class() == ErrorClass::Fatal {
                    session.mark_failed(&e.to_string());
                    if let Err(save_err) = self.session_manager.save(&session).await {
                        warn!(error = %save_err, "Failed to record session failure");
                    }
                }
                Err(e)
            }
        }
    }

    /// Think, act, observe until the model answers without tool calls.
    ///
    /// Works on a copy of the session; `session` is only replaced once the
    /// finished copy has been saved.
    async fn run_cycle(
        &self,
        session: &mut Session,
        envelope: &Envelope,
        turn: &Turn,
    ) -> Result<String> {
        let provider = self
            .provider
            .read()
            .await
            .clone()
            .ok_or_else(|| AisbotError::Config("No provider configured".into()))?;

        let defaults = &self.config.agents.defaults;
        let options = ChatOptions::new()
            .with_max_tokens(defaults.max_tokens)
            .with_temperature(defaults.temperature);
        let model = Some(defaults.model.as_str());
        let tool_timeout = Duration::from_secs(defaults.tool_timeout_secs);
        let max_iterations = defaults.max_tool_iterations;

        let workspace = self.config.workspace_path();
        let tool_ctx = ToolContext::new()
            .with_channel(&turn.reply_channel, &turn.reply_chat_id)
            .with_session(&turn.session_key)
            .with_workspace(&workspace.to_string_lossy());
        let session_info = SessionInfo::new(&turn.reply_channel, &turn.reply_chat_id);

        let mut working = session.clone();
        working.add_message(Message::user(&turn.user_text).with_media(turn.media.clone()))?;

        let mut iteration = 0;
        let reply = loop {
            self.set_state(&turn.session_key, LoopState::AwaitingModel)
                .await;
            let tool_definitions = self.tools.read().await.definitions();
            let built = self
                .context_builder
                .build(
                    &working.messages,
                    None,
                    &session_info,
                    &tool_definitions,
                    Some(Arc::clone(&provider)),
                    model,
                )
                .await;
            working.prompt_hash = Some(built.prompt_hash);
            working.last_compression = Some(built.stats);

            let response = match provider
                .chat(built.messages.clone(), tool_definitions, model, options.clone())
                .await
            {
                Ok(response) => response,
                Err(e) if e.escapes_cycle() => return Err(e),
                Err(e) => {
                    error!(error = %e, "Model call failed, replying with error");
                    break format!("Sorry, I encountered an error: {}", e);
                }
            };

            if let Some(usage) = response.usage {
                debug!(
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    "Model usage"
                );
            }

            if !response.has_tool_calls() {
                break non_empty_or(response.content, turn.fallback);
            }

            if iteration >= max_iterations {
                info!(
                    iterations = iteration,
                    "Tool loop reached maximum iterations, asking for a final answer"
                );
                break self
                    .final_answer(&provider, built.messages, model, &options, turn.fallback)
                    .await;
            }
            iteration += 1;
            debug!(iteration, max_iterations, calls = response.tool_calls.len(), "Tool iteration");

            self.set_state(&turn.session_key, LoopState::ExecutingTools)
                .await;
            self.execute_tools(&mut working, &response, &tool_ctx, tool_timeout)
                .await?;
        };

        self.set_state(&turn.session_key, LoopState::Responding)
            .await;
        working.add_message(Message::assistant(&reply))?;
        working.record_processed(
            &envelope.id,
            &reply,
            &turn.reply_channel,
            &turn.reply_chat_id,
        );
        self.session_manager.save(&working).await?;
        *session = working;
        Ok(reply)
    }

    /// Run every call of `response` concurrently and append the results in
    /// request order.
    async fn execute_tools(
        &self,
        working: &mut Session,
        response: &LLMResponse,
        ctx: &ToolContext,
        timeout: Duration,
    ) -> Result<()> {
        let planned = unique_calls(&response.tool_calls);
        let calls: Vec<ToolCall> = planned.iter().map(|(call, _)| ToolCall::from(call)).collect();
        working.add_message(Message::assistant_with_tools(&response.content, calls))?;

        let outputs = {
            let tools = self.tools.read().await;
            let tools = &*tools;
            let started = Instant::now();
            let outputs = join_all(planned.iter().map(|(call, reused)| async move {
                match reused {
                    Some(id) => {
                        warn!(tool = %call.name, call_id = %id, "Model reused a tool call id");
                        ToolOutput::error(format!("Error: duplicate tool call id '{}'", id))
                    }
                    None => tools.invoke(call, ctx, timeout).await,
                }
            }))
            .await;
            debug!(
                calls = outputs.len(),
                duration_ms = started.elapsed().as_millis() as u64,
                "Tool batch finished"
            );
            outputs
        };

        let compression = self.context_builder.compression_config();
        for ((call, _), output) in planned.iter().zip(outputs) {
            let content = compress_tool_result(&output.for_llm, compression);
            if content.len() < output.for_llm.len() {
                debug!(
                    tool = %call.name,
                    original_chars = char_len(&output.for_llm),
                    compressed_chars = char_len(&content),
                    "Compressed tool result"
                );
            }
            let message = if output.is_error {
                Message::tool_error(&call.id, &content)
            } else {
                Message::tool_result(&call.id, &content)
            };
            working.add_message(message)?;
        }
        Ok(())
    }

    /// One last model call without tools once the iteration cap is hit.
    async fn final_answer(
        &self,
        provider: &Arc<dyn LLMProvider>,
        messages: Vec<Message>,
        model: Option<&str>,
        options: &ChatOptions,
        fallback: &str,
    ) -> String {
        match provider
            .chat(messages, Vec::new(), model, options.clone())
            .await
        {
            Ok(response) if !response.has_tool_calls() => non_empty_or(response.content, fallback),
            Ok(_) => fallback.to_string(),
            Err(e) => {
                warn!(error = %e, "Final answer call failed");
                fallback.to_string()
            }
        }
    }

    /// Process a message without the bus (CLI and scheduled jobs).
    pub async fn process_direct(
        &self,
        content: &str,
        session_key: &str,
        channel: &str,
        chat_id: &str,
    ) -> Result<String> {
        let envelope =
            Envelope::inbound(channel, "user", chat_id, content).with_session_key(session_key);
        let reply = self.process_envelope(&envelope).await?;
        Ok(reply.payload.content)
    }

    /// Process one claimed envelope end to end: cycle, publish reply,
    /// acknowledge.
    async fn handle_envelope(&self, envelope: Envelope) {
        let request_span = info_span!(
            "request",
            request_id = %uuid::Uuid::new_v4(),
            envelope_id = %envelope.id,
            session_id = %envelope.session_key,
            channel = %envelope.channel,
            sender = %envelope.sender_id,
        );

        async {
            info!(attempt = envelope.attempts, "Processing envelope");
            let start = Instant::now();

            let reply = match self.process_envelope(&envelope).await {
                Ok(reply) => reply,
                Err(e) => {
                    error!(error = %e, "Cycle failed");
                    self.abandon(&envelope, &e).await;
                    return;
                }
            };

            let response_len = reply.content().len();
            if let Err(e) = self.outbound.emit(reply).await {
                error!(error = %e, "Failed to publish reply");
                self.abandon(&envelope, &e).await;
                return;
            }
            if let Err(e) = self.inbound.complete(&envelope.id).await {
                error!(error = %e, "Failed to acknowledge envelope");
                return;
            }
            info!(
                latency_ms = start.elapsed().as_millis() as u64,
                response_len,
                "Request completed"
            );
        }
        .instrument(request_span)
        .await
    }

    /// Hand a failed envelope back to the bus; apologise if it will not be
    /// retried.
    async fn abandon(&self, envelope: &Envelope, err: &AisbotError) {
        match self.inbound.abandon(&envelope.id, &err.to_string()).await {
            Ok(DeliveryState::DeadLetter) => {
                let turn = Turn::for_envelope(envelope);
                let apology = turn.reply(
                    envelope,
                    &format!("Sorry, I encountered an error: {}", err),
                );
                if let Err(e) = self.outbound.emit(apology).await {
                    warn!(error = %e, "Failed to publish apology for dead-lettered envelope");
                }
            }
            Ok(state) => debug!(%state, "Envelope handed back for redelivery"),
            Err(e) => error!(error = %e, "Failed to abandon envelope"),
        }
    }

    /// Consume inbound envelopes until [`stop`](Self::stop) is called or the
    /// source closes.
    ///
    /// Each envelope runs in its own task, at most
    /// `max_concurrent_sessions` at a time. On stop, running tasks are
    /// aborted and their envelopes released for redelivery.
    ///
    /// # Errors
    /// Returns an error if the loop is already running.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AisbotError::Config("Agent loop already running".into()));
        }
        info!("Starting agent loop");

        // Subscribe fresh and consume any stale stop signal from a previous run.
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let _ = *shutdown_rx.borrow_and_update();

        let permits = Arc::new(Semaphore::new(
            self.config.agents.defaults.max_concurrent_sessions.max(1),
        ));
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!(error = %e, "Envelope task panicked");
                    }
                }
            }

            let next = async {
                let permit = Arc::clone(&permits).acquire_owned().await;
                (permit, self.inbound.receive().await)
            };

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Received shutdown signal");
                        break;
                    }
                }
                (permit, received) = next => {
                    let Ok(permit) = permit else {
                        break;
                    };
                    match received {
                        Ok(Some(envelope)) => {
                            let session_key = Turn::for_envelope(&envelope).session_key;
                            self.active
                                .lock()
                                .await
                                .insert(envelope.id.clone(), session_key);
                            let agent = Arc::clone(&self);
                            tasks.spawn(async move {
                                let _permit = permit;
                                let id = envelope.id.clone();
                                agent.handle_envelope(envelope).await;
                                agent.active.lock().await.remove(&id);
                            });
                        }
                        Ok(None) => {
                            info!("Inbound source closed");
                            break;
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to receive inbound envelope");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }

            if !self.running.load(Ordering::SeqCst) {
                break;
            }
        }

        tasks.abort_all();
        while tasks.join_next().await.is_some() {}

        let unfinished: Vec<(String, String)> = self.active.lock().await.drain().collect();
        for (id, session_key) in unfinished {
            debug!(envelope_id = %id, "Releasing envelope of aborted task");
            self.set_state(&session_key, LoopState::Idle).await;
            if let Err(e) = self.inbound.release(&id).await {
                warn!(envelope_id = %id, error = %e, "Failed to release envelope");
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Agent loop stopped");
        Ok(())
    }

    /// Signal [`start`](Self::start) to return.
    pub fn stop(&self) {
        info!("Stopping agent loop");
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
    }

    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.session_manager
    }

    pub fn context_builder(&self) -> &ContextBuilder {
        &self.context_builder
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Give every call of one response a distinct id.
///
/// A call reusing an id seen earlier in the same response is renamed and
/// carries the reused id; it is answered with an error instead of being run.
fn unique_calls(calls: &[LLMToolCall]) -> Vec<(LLMToolCall, Option<String>)> {
    let mut issued = HashSet::new();
    calls
        .iter()
        .map(|call| {
            if issued.insert(call.id.clone()) {
                return (call.clone(), None);
            }
            let mut renamed = call.clone();
            renamed.id = format!("{}_dup_{}", call.id, uuid::Uuid::new_v4().simple());
            issued.insert(renamed.id.clone());
            (renamed, Some(call.id.clone()))
        })
        .collect()
}

fn non_empty_or(content: String, fallback: &str) -> String {
    if content.trim().is_empty() {
        fallback.to_string()
    } else {
        content
    }
}
