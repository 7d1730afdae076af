//! # Greetings Demo
//!
//! Wires a command processor with an inbox, an outbox and both sweepers,
//! then walks through send, publish and post.
//!
//! ```text
//! RUST_LOG=debug cargo run -p greetings-demo
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use postbox_core::{
    request, AsyncHandler, CommandProcessor, DecoratorDescriptor, HandlerTiming,
    InboxConfiguration, InboxSweepConfig, MapperRegistry, Message, MessageProducer,
    OnceOnlyAction, OutboxProducerMediator, PostboxError, ProducerRegistry, Publication,
    RequestId, SweeperConfig,
};
use postbox_outbox::{InboxExpirySweeper, OutboxSweeper};
use postbox_persistence::{InMemoryInbox, InMemoryOutbox};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Requests
// ============================================================================

/// Ask for someone to be greeted.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GreetingCommand {
    id: RequestId,
    name: String,
}

request!(GreetingCommand);

impl GreetingCommand {
    fn new(name: &str) -> Self {
        Self {
            id: RequestId::new(),
            name: name.to_string(),
        }
    }
}

/// Someone was greeted.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GreetingMade {
    event_id: RequestId,
    greeting: String,
}

request!(GreetingMade, event_id);

// ============================================================================
// Handlers
// ============================================================================

struct GreetingHandler;

#[async_trait]
impl AsyncHandler<GreetingCommand> for GreetingHandler {
    async fn handle(&self, command: GreetingCommand) -> Result<GreetingCommand> {
        info!(name = %command.name, "Hello, {}!", command.name);
        Ok(command)
    }

    fn decorators(&self) -> Vec<DecoratorDescriptor> {
        vec![
            DecoratorDescriptor::logging(0, HandlerTiming::Before),
            DecoratorDescriptor::use_inbox(1, "greetings", true, OnceOnlyAction::Throw),
        ]
    }
}

struct AuditHandler {
    seen: Arc<AtomicUsize>,
}

#[async_trait]
impl AsyncHandler<GreetingMade> for AuditHandler {
    async fn handle(&self, event: GreetingMade) -> Result<GreetingMade> {
        let seen = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
        info!(seen, greeting = %event.greeting, "audited greeting");
        Ok(event)
    }
}

struct MailHandler;

#[async_trait]
impl AsyncHandler<GreetingMade> for MailHandler {
    async fn handle(&self, event: GreetingMade) -> Result<GreetingMade> {
        info!(greeting = %event.greeting, "mailed greeting");
        Ok(event)
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Stands in for a broker: logs every message it is handed.
struct ConsoleProducer;

impl MessageProducer for ConsoleProducer {
    fn send(&self, message: &Message) -> Result<()> {
        info!(
            message_id = %message.id(),
            topic = %message.topic(),
            body = message.body.as_str().unwrap_or("<binary>"),
            "produced message"
        );
        Ok(())
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let inbox = Arc::new(InMemoryInbox::default());
    let outbox = Arc::new(InMemoryOutbox::default());

    let mediator = Arc::new(
        OutboxProducerMediator::new(
            ProducerRegistry::new().with_producer("greetings.made", Arc::new(ConsoleProducer)),
            MapperRegistry::new().with_json::<GreetingMade>(Publication::event("greetings.made")),
        )
        .with_outbox(outbox.clone())
        .with_async_outbox(outbox.clone()),
    );

    let audited = Arc::new(AtomicUsize::new(0));
    let processor = CommandProcessor::builder()
        .with_async_handler(GreetingHandler)
        .with_async_handler(AuditHandler {
            seen: audited.clone(),
        })
        .with_async_handler(MailHandler)
        .with_inbox_store(inbox.clone())
        .with_inbox_configuration(InboxConfiguration::default().with_action(OnceOnlyAction::Warn))
        .with_mediator(mediator.clone())
        .build();

    let outbox_sweeper = Arc::new(OutboxSweeper::new(
        mediator,
        SweeperConfig::default()
            .with_interval(Duration::from_millis(100))
            .with_min_age(Duration::from_millis(200)),
    ))
    .start();
    let inbox_sweeper = InboxExpirySweeper::new(inbox, InboxSweepConfig::default()).start();

    // Commands run exactly once per id.
    let command = GreetingCommand::new("Ada");
    processor.send_async(command.clone()).await?;
    match processor.send_async(command).await {
        Err(PostboxError::Duplicate { id, context_key }) => {
            warn!(%id, %context_key, "duplicate greeting rejected");
        }
        other => anyhow::bail!("expected a duplicate, got {other:?}"),
    }

    // Events reach every subscriber; the global inbox guards the ones that
    // declare no inbox of their own.
    let event = GreetingMade {
        event_id: RequestId::new(),
        greeting: "Hello, Ada!".into(),
    };
    processor.publish_async(event.clone()).await?;
    processor.publish_async(event).await?;
    info!(audited = audited.load(Ordering::SeqCst), "publish finished");

    // Post sends right away; a bare deposit is left for the sweeper.
    processor
        .post_async(&GreetingMade {
            event_id: RequestId::new(),
            greeting: "Hello, Grace!".into(),
        })
        .await?;
    processor
        .deposit_post_async(&GreetingMade {
            event_id: RequestId::new(),
            greeting: "Hello, Barbara!".into(),
        })
        .await?;

    tokio::time::sleep(Duration::from_millis(500)).await;
    info!(
        outstanding = processor.mediator()?.outstanding_count_async().await?,
        "outbox drained"
    );

    outbox_sweeper.shutdown().await;
    inbox_sweeper.shutdown().await;
    Ok(())
}
