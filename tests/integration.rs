//! Integration tests for Aisbot
//!
//! These tests verify that the components work together through the public
//! API: bus ordering and durability, tool invocation, context building and
//! session persistence.

use std::sync::Arc;
use std::time::Duration;

use aisbot::{
    agent::{ContextBuilder, SessionInfo},
    bus::{BusEvent, ConsumeScope, DeliveryState, Direction, Envelope, MessageBus, PublishOutcome},
    config::{BusConfig, CompressionConfig, Config, StrategyKind},
    providers::{LLMToolCall, ToolDefinition},
    session::{Message, Role, SessionManager, ToolCall},
    tools::{EchoTool, ToolContext, ToolRegistry},
};
use tempfile::tempdir;

async fn claim(bus: &MessageBus, scope: ConsumeScope) -> Option<Envelope> {
    bus.try_consume(Direction::Inbound, &scope).await.unwrap()
}

// ============================================================================
// Message Bus Integration Tests
// ============================================================================

#[tokio::test]
async fn test_message_bus_roundtrip() {
    let bus = MessageBus::new();

    let inbound = Envelope::inbound("telegram", "user123", "chat456", "Hello bot!");
    bus.publish(inbound).await.unwrap();

    let received = claim(&bus, ConsumeScope::Any).await.unwrap();
    assert_eq!(received.content(), "Hello bot!");
    assert_eq!(received.session_key, "telegram:chat456");
    assert_eq!(received.state, DeliveryState::InFlight);
    assert_eq!(received.attempts, 1);

    bus.publish(Envelope::reply(&received, "Hello human!"))
        .await
        .unwrap();
    bus.acknowledge(&received.id).await.unwrap();

    let reply = bus
        .consume_timeout(
            Direction::Outbound,
            ConsumeScope::Any,
            Duration::from_millis(200),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.content(), "Hello human!");
    assert_eq!(reply.chat_id, "chat456");
    assert_eq!(reply.reply_to.as_deref(), Some(received.id.as_str()));
}

#[tokio::test]
async fn test_session_order_and_exclusivity() {
    let bus = MessageBus::new();
    let a1 = Envelope::inbound("cli", "u", "a", "a1");
    let a2 = Envelope::inbound("cli", "u", "a", "a2");
    let b1 = Envelope::inbound("cli", "u", "b", "b1");
    for env in [a1.clone(), a2.clone(), b1.clone()] {
        bus.publish(env).await.unwrap();
    }

    // Session "a" is busy after the first claim, so "b" is next.
    assert_eq!(claim(&bus, ConsumeScope::Any).await.unwrap().id, a1.id);
    assert_eq!(claim(&bus, ConsumeScope::Any).await.unwrap().id, b1.id);
    assert!(claim(&bus, ConsumeScope::Any).await.is_none());

    bus.acknowledge(&a1.id).await.unwrap();
    let next = claim(&bus, ConsumeScope::Session("cli:a".into()))
        .await
        .unwrap();
    assert_eq!(next.id, a2.id);
}

#[tokio::test]
async fn test_duplicate_publish_is_ignored() {
    let bus = MessageBus::new();
    let env = Envelope::inbound("cli", "u", "1", "once");
    assert_eq!(
        bus.publish(env.clone()).await.unwrap(),
        PublishOutcome::Published
    );
    assert_eq!(bus.publish(env).await.unwrap(), PublishOutcome::Duplicate);
    assert_eq!(bus.inbound_size().await, 1);
}

#[tokio::test]
async fn test_dead_letter_after_max_retries() {
    let config = BusConfig {
        max_retries: 2,
        ..BusConfig::default()
    };
    let bus = MessageBus::with_config(&config);
    let mut events = bus.subscribe();

    let env = Envelope::inbound("cli", "u", "1", "doomed");
    let id = env.id.clone();
    bus.publish(env).await.unwrap();

    claim(&bus, ConsumeScope::Any).await.unwrap();
    assert_eq!(bus.fail(&id, "boom").await.unwrap(), DeliveryState::Failed);
    claim(&bus, ConsumeScope::Any).await.unwrap();
    assert_eq!(
        bus.fail(&id, "boom again").await.unwrap(),
        DeliveryState::DeadLetter
    );
    assert!(claim(&bus, ConsumeScope::Any).await.is_none());

    let mut dead_lettered = None;
    while let Ok(event) = events.try_recv() {
        if let BusEvent::DeadLettered { id, attempts, error } = event {
            dead_lettered = Some((id, attempts, error));
        }
    }
    let (dead_id, attempts, error) = dead_lettered.expect("no DeadLettered event");
    assert_eq!(dead_id, id);
    assert_eq!(attempts, 2);
    assert_eq!(error, "boom again");

    let dead = bus.dead_letters(Direction::Inbound).await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].last_error.as_deref(), Some("boom again"));
}

#[tokio::test]
async fn test_journal_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bus").join("queue.jsonl");
    let config = BusConfig::default();

    let (claimed_id, waiting_id) = {
        let bus = MessageBus::open(&path, &config).unwrap();
        let first = Envelope::inbound("cli", "u", "1", "first");
        let second = Envelope::inbound("cli", "u", "2", "second");
        bus.publish(first.clone()).await.unwrap();
        bus.publish(second.clone()).await.unwrap();
        let claimed = claim(&bus, ConsumeScope::Session("cli:1".into()))
            .await
            .unwrap();
        assert_eq!(claimed.id, first.id);
        // Crash: dropped without acknowledging.
        (first.id, second.id)
    };

    let bus = MessageBus::open(&path, &config).unwrap();
    let recovered = bus.get(&claimed_id).await.unwrap();
    assert_eq!(recovered.state, DeliveryState::Pending);
    assert_eq!(recovered.attempts, 1);
    assert_eq!(bus.get(&waiting_id).await.unwrap().state, DeliveryState::Pending);
    assert_eq!(bus.pending_count(Direction::Inbound).await, 2);

    // Original publish order is kept across the reopen.
    let again = claim(&bus, ConsumeScope::Any).await.unwrap();
    assert_eq!(again.id, claimed_id);
    assert_eq!(again.attempts, 2);
}

#[tokio::test]
async fn test_closed_bus_rejects_publish_and_ends_consumers() {
    let bus = Arc::new(MessageBus::new());
    let consumer = {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move { bus.consume(Direction::Inbound, ConsumeScope::Any).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    bus.close();
    assert!(bus.is_closed());
    let result = tokio::time::timeout(Duration::from_secs(1), consumer)
        .await
        .unwrap()
        .unwrap();
    assert!(result.unwrap().is_none());

    let err = bus
        .publish(Envelope::inbound("cli", "u", "1", "late"))
        .await
        .unwrap_err();
    assert!(err.escapes_cycle());
}

// ============================================================================
// Tool Registry Integration Tests
// ============================================================================

#[tokio::test]
async fn test_registry_invoke() {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(EchoTool));
    let ctx = ToolContext::new().with_channel("cli", "1").with_session("cli:1");

    let ok = registry
        .invoke(
            &LLMToolCall::new("c1", "echo", r#"{"message": "hi"}"#),
            &ctx,
            Duration::from_secs(1),
        )
        .await;
    assert!(!ok.is_error);
    assert_eq!(ok.for_llm, "hi");

    let unknown = registry
        .invoke(
            &LLMToolCall::new("c2", "nonexistent", "{}"),
            &ctx,
            Duration::from_secs(1),
        )
        .await;
    assert!(unknown.is_error);
    assert!(unknown.for_llm.starts_with("Error: "));

    let malformed = registry
        .invoke(
            &LLMToolCall::new("c3", "echo", "not json"),
            &ctx,
            Duration::from_secs(1),
        )
        .await;
    assert!(malformed.is_error);
}

// ============================================================================
// Context Builder Integration Tests
// ============================================================================

#[tokio::test]
async fn test_builder_reuses_cached_system_prompt() {
    let builder = ContextBuilder::new(CompressionConfig::default()).with_soul("Be brief.");
    let tools = vec![ToolDefinition::new(
        "echo",
        "Echo a message",
        serde_json::json!({"type": "object"}),
    )];
    let history = vec![Message::user("Hello"), Message::assistant("Hi!")];

    let first = builder
        .build(&history, None, &SessionInfo::new("cli", "1"), &tools, None, None)
        .await;
    let second = builder
        .build(&history, None, &SessionInfo::new("slack", "2"), &tools, None, None)
        .await;

    assert!(!first.cache_hit);
    assert!(second.cache_hit);
    assert_eq!(first.prompt_hash, second.prompt_hash);
    assert_eq!(first.messages[0].role, Role::System);
    assert!(first.messages[0].content.contains("Be brief."));
    assert!(first.messages[0].content.contains("Chat ID: 1"));
    assert!(second.messages[0].content.contains("Chat ID: 2"));
    assert_eq!(builder.cache().stats(), (1, 1));
}

#[tokio::test]
async fn test_builder_keeps_recent_tail_verbatim() {
    let config = CompressionConfig {
        max_context_tokens: 1000,
        target_context_tokens: 800,
        recent_messages_keep: 10,
        strategy: StrategyKind::Semantic,
        ..CompressionConfig::default()
    };
    let builder = ContextBuilder::new(config);
    let history: Vec<Message> = (0..30)
        .map(|i| {
            let text = format!("Message number {}. It rambles on for a while. ", i).repeat(4);
            if i % 2 == 0 {
                Message::user(&text)
            } else {
                Message::assistant(&text)
            }
        })
        .collect();

    let built = builder
        .build(&history, None, &SessionInfo::new("cli", "1"), &[], None, None)
        .await;
    assert!(built.stats.compressed);
    assert!(built.stats.final_tokens < built.stats.original_tokens);

    let n = built.messages.len();
    assert_eq!(built.messages.split_at(n - 10).1, history.split_at(20).1);
}

// ============================================================================
// Session Persistence Integration Tests
// ============================================================================

#[tokio::test]
async fn test_session_persistence() {
    let dir = tempdir().unwrap();
    let path = dir.path().to_path_buf();

    {
        let manager = SessionManager::with_path(path.clone()).unwrap();
        let mut session = manager.get_or_create("telegram:42").await.unwrap();
        session.add_message(Message::user("add 1 and 2")).unwrap();
        session
            .add_message(Message::assistant_with_tools(
                "",
                vec![ToolCall::new("call_1", "add", r#"{"a":1,"b":2}"#)],
            ))
            .unwrap();
        session
            .add_message(Message::tool_result("call_1", "3"))
            .unwrap();
        session.add_message(Message::assistant("3")).unwrap();
        session.record_processed("env-1", "3", "telegram", "42");
        manager.save(&session).await.unwrap();
    }

    let manager = SessionManager::with_path(path).unwrap();
    let session = manager.get("telegram:42").await.unwrap().unwrap();
    assert_eq!(session.messages.len(), 4);
    assert_eq!(session.messages[2].role, Role::Tool);
    assert_eq!(session.messages[2].tool_call_id.as_deref(), Some("call_1"));
    assert_eq!(session.processed_reply("env-1").unwrap().reply, "3");
}

#[tokio::test]
async fn test_session_rejects_orphan_tool_result() {
    let manager = SessionManager::new_memory();
    let mut session = manager.get_or_create("cli:1").await.unwrap();
    session.add_message(Message::user("hi")).unwrap();
    assert!(session
        .add_message(Message::tool_result("nope", "x"))
        .is_err());
    assert_eq!(session.messages.len(), 1);
}

// ============================================================================
// Configuration Integration Tests
// ============================================================================

#[test]
fn test_config_partial_file_uses_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(
        &path,
        r#"{"compression": {"strategy": "truncation", "recent_messages_keep": 4}, "bus": {"max_retries": 5}}"#,
    )
    .unwrap();

    let config = Config::load_from_path(&path).unwrap();
    assert_eq!(config.compression.strategy, StrategyKind::Truncation);
    assert_eq!(config.compression.recent_messages_keep, 4);
    assert_eq!(config.bus.max_retries, 5);
    assert_eq!(
        config.compression.target_context_tokens,
        CompressionConfig::default().target_context_tokens
    );
}

#[test]
fn test_config_rejects_target_above_max() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(
        &path,
        r#"{"compression": {"max_context_tokens": 1000, "target_context_tokens": 5000}}"#,
    )
    .unwrap();
    assert!(Config::load_from_path(&path).is_err());
}
