//! End-to-end tests for command dispatch through handler chains.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use postbox_core::{
    async_trait, request, AsyncHandler, CommandProcessor, ConfigurationError, DecoratorDescriptor,
    ErrorKind, Handler, HandlerTiming, PolicyRegistry, PostboxError, RequestId, RetryPolicy,
};
use postbox_testing::{CountingHandler, StepRecorder, RECORD_STEP};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlaceOrder {
    id: RequestId,
    sku: String,
}

request!(PlaceOrder);

impl PlaceOrder {
    fn new(sku: &str) -> Self {
        Self {
            id: RequestId::new(),
            sku: sku.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderPlaced {
    event_id: RequestId,
}

request!(OrderPlaced, event_id);

// =============================================================================
// Send
// =============================================================================

#[test]
fn test_send_invokes_handler_exactly_once() {
    let handler = CountingHandler::<PlaceOrder>::new();
    let counter = handler.clone();
    let processor = CommandProcessor::builder().with_handler(handler).build();

    let order = PlaceOrder::new("tea");
    let returned = processor.send(order.clone()).unwrap();

    assert_eq!(counter.count(), 1);
    assert_eq!(returned.id, order.id);
    assert_eq!(returned.sku, "tea");
}

#[test]
fn test_send_without_handler_is_cardinality_error() {
    let processor = CommandProcessor::builder().build();

    let err = processor.send(PlaceOrder::new("tea")).unwrap_err();
    assert!(matches!(err, PostboxError::NoHandler { .. }));
    assert_eq!(err.kind(), ErrorKind::Cardinality);
}

#[test]
fn test_send_with_two_handlers_is_ambiguous_and_runs_neither() {
    let first = CountingHandler::<PlaceOrder>::new().named("First");
    let second = CountingHandler::<PlaceOrder>::new().named("Second");
    let (a, b) = (first.clone(), second.clone());
    let processor = CommandProcessor::builder()
        .with_handler(first)
        .with_async_handler(second)
        .build();

    // One blocking and one async handler: each model sees one, so it is not ambiguous.
    processor.send(PlaceOrder::new("tea")).unwrap();
    assert_eq!(a.count(), 1);
    assert_eq!(b.count(), 0);

    let third = CountingHandler::<PlaceOrder>::new().named("Third");
    let processor = CommandProcessor::builder()
        .with_handler(CountingHandler::<PlaceOrder>::new().named("Fourth"))
        .with_handler(Wrapper(third.clone()))
        .build();
    let err = processor.send(PlaceOrder::new("tea")).unwrap_err();
    assert!(matches!(err, PostboxError::AmbiguousHandler { count: 2, .. }));
    assert_eq!(third.count(), 0);
}

#[test]
fn test_duplicate_registration_is_returned_as_error() {
    let builder = CommandProcessor::builder()
        .try_with_handler(CountingHandler::<PlaceOrder>::new())
        .unwrap();
    match builder.try_with_handler(CountingHandler::<PlaceOrder>::new()) {
        Err(ConfigurationError::HandlerAlreadyRegistered { request_type, .. }) => {
            assert!(request_type.ends_with("PlaceOrder"))
        }
        Err(other) => panic!("Expected HandlerAlreadyRegistered, got {other:?}"),
        Ok(_) => panic!("Expected HandlerAlreadyRegistered"),
    }

    let processor = CommandProcessor::builder()
        .try_with_async_handler(CountingHandler::<PlaceOrder>::new())
        .and_then(|b| b.try_with_handler(Wrapper(CountingHandler::new())))
        .unwrap()
        .build();
    processor.send(PlaceOrder::new("tea")).unwrap();
}

/// Distinct handler type around a counting handler.
struct Wrapper(CountingHandler<PlaceOrder>);

impl Handler<PlaceOrder> for Wrapper {
    fn handle(&self, request: PlaceOrder) -> anyhow::Result<PlaceOrder> {
        Handler::handle(&self.0, request)
    }
}

#[test]
fn test_handler_error_is_returned_to_caller() {
    let processor = CommandProcessor::builder()
        .with_handler(CountingHandler::<PlaceOrder>::new().failing("out of stock"))
        .build();

    let err = processor.send(PlaceOrder::new("tea")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Handler);
    assert!(err.to_string().contains("out of stock"));
}

// =============================================================================
// Ordering
// =============================================================================

#[test]
fn test_links_run_in_ascending_step_order_around_handler() {
    let recorder = StepRecorder::new();
    let handler = CountingHandler::<PlaceOrder>::new()
        .named("PlaceOrderHandler")
        .with_recorder(recorder.clone())
        .with_decorators(vec![
            StepRecorder::descriptor(3, HandlerTiming::Before, "before-3"),
            StepRecorder::descriptor(-1, HandlerTiming::After, "after--1"),
            StepRecorder::descriptor(1, HandlerTiming::Before, "before-1"),
            StepRecorder::descriptor(2, HandlerTiming::After, "after-2"),
            StepRecorder::descriptor(2, HandlerTiming::Before, "before-2"),
        ]);
    let processor = CommandProcessor::builder()
        .with_handler(handler)
        .with_link::<PlaceOrder, _>(RECORD_STEP, recorder.constructor())
        .build();

    processor.send(PlaceOrder::new("tea")).unwrap();
    assert_eq!(
        recorder.steps(),
        vec!["before-1", "before-2", "before-3", "PlaceOrderHandler", "after--1", "after-2"]
    );
}

#[test]
fn test_equal_steps_keep_declaration_order() {
    let recorder = StepRecorder::new();
    let handler = CountingHandler::<PlaceOrder>::new()
        .with_decorators(vec![
            StepRecorder::descriptor(1, HandlerTiming::Before, "a"),
            StepRecorder::descriptor(1, HandlerTiming::Before, "b"),
            StepRecorder::descriptor(0, HandlerTiming::Before, "c"),
        ]);
    let processor = CommandProcessor::builder()
        .with_handler(handler)
        .with_link::<PlaceOrder, _>(RECORD_STEP, recorder.constructor())
        .build();

    processor.send(PlaceOrder::new("tea")).unwrap();
    assert_eq!(recorder.steps(), vec!["c", "a", "b"]);
}

#[tokio::test]
async fn test_async_chain_uses_the_same_ordering() {
    let recorder = StepRecorder::new();
    let handler = CountingHandler::<PlaceOrder>::new()
        .with_recorder(recorder.clone())
        .with_decorators(vec![
            StepRecorder::descriptor(5, HandlerTiming::Before, "late"),
            StepRecorder::descriptor(0, HandlerTiming::Before, "early"),
            StepRecorder::descriptor(0, HandlerTiming::After, "done"),
        ]);
    let processor = CommandProcessor::builder()
        .with_async_handler(handler)
        .with_async_link::<PlaceOrder, _>(RECORD_STEP, recorder.async_constructor())
        .build();

    processor.send_async(PlaceOrder::new("tea")).await.unwrap();
    assert_eq!(recorder.steps(), vec!["early", "late", "CountingHandler", "done"]);
}

#[test]
fn test_unknown_link_type_fails_when_chain_is_built() {
    let handler = CountingHandler::<PlaceOrder>::new()
        .with_decorators(vec![DecoratorDescriptor::before(0, "acme.audit")]);
    let counter = handler.clone();
    let processor = CommandProcessor::builder().with_handler(handler).build();

    let err = processor.send(PlaceOrder::new("tea")).unwrap_err();
    assert!(matches!(
        err,
        PostboxError::Configuration(ConfigurationError::UnknownLinkType { .. })
    ));
    assert_eq!(counter.count(), 0);
}

#[test]
fn test_describe_lists_chain_in_execution_order() {
    let recorder = StepRecorder::new();
    let handler = CountingHandler::<PlaceOrder>::new()
        .named("PlaceOrderHandler")
        .with_decorators(vec![
            DecoratorDescriptor::logging(0, HandlerTiming::Before),
            StepRecorder::descriptor(1, HandlerTiming::Before, "audit"),
        ]);
    let processor = CommandProcessor::builder()
        .with_handler(handler)
        .with_link::<PlaceOrder, _>(RECORD_STEP, recorder.constructor())
        .build();

    let pipelines = processor.pipelines().build::<PlaceOrder>().unwrap();
    assert_eq!(pipelines.len(), 1);
    let description = pipelines[0].describe();
    let logging = description.find("Logging").unwrap();
    let audit = description.find("audit").unwrap();
    let core = description.find("PlaceOrderHandler").unwrap();
    assert!(logging < audit && audit < core, "{description}");
}

// =============================================================================
// Publish
// =============================================================================

#[test]
fn test_publish_reaches_every_subscriber() {
    let billing = CountingHandler::<OrderPlaced>::new().named("Billing");
    let shipping = Wrapped(CountingHandler::<OrderPlaced>::new().named("Shipping"));
    let (a, b) = (billing.clone(), shipping.0.clone());
    let processor = CommandProcessor::builder()
        .with_handler(billing)
        .with_handler(shipping)
        .build();

    processor
        .publish(OrderPlaced {
            event_id: RequestId::new(),
        })
        .unwrap();
    assert_eq!(a.count(), 1);
    assert_eq!(b.count(), 1);
}

#[test]
fn test_publish_with_no_subscribers_succeeds() {
    let processor = CommandProcessor::builder().build();
    processor
        .publish(OrderPlaced {
            event_id: RequestId::new(),
        })
        .unwrap();
}

#[tokio::test]
async fn test_async_publish_runs_all_chains_and_reports_failures() {
    let healthy = CountingHandler::<OrderPlaced>::new().named("Healthy");
    let broken = Wrapped(CountingHandler::<OrderPlaced>::new().named("Broken").failing("down"));
    let (a, b) = (healthy.clone(), broken.0.clone());
    let processor = CommandProcessor::builder()
        .with_async_handler(healthy)
        .with_async_handler(broken)
        .build();

    let err = processor
        .publish_async(OrderPlaced {
            event_id: RequestId::new(),
        })
        .await
        .unwrap_err();
    match err {
        PostboxError::PublishFailed { failures } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].handler, "Broken");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(a.count(), 1);
    assert_eq!(b.count(), 1);
}

/// Distinct handler type, usable in both models.
struct Wrapped(CountingHandler<OrderPlaced>);

impl Handler<OrderPlaced> for Wrapped {
    fn handle(&self, request: OrderPlaced) -> anyhow::Result<OrderPlaced> {
        Handler::handle(&self.0, request)
    }

    fn name(&self) -> &'static str {
        Handler::name(&self.0)
    }
}

#[async_trait]
impl AsyncHandler<OrderPlaced> for Wrapped {
    async fn handle(&self, request: OrderPlaced) -> anyhow::Result<OrderPlaced> {
        AsyncHandler::handle(&self.0, request).await
    }

    fn name(&self) -> &'static str {
        AsyncHandler::name(&self.0)
    }
}

// =============================================================================
// Policy and timeout links
// =============================================================================

/// Fails the first `failures` calls, then succeeds.
struct FlakyHandler {
    failures: usize,
    calls: Arc<AtomicUsize>,
}

impl Handler<PlaceOrder> for FlakyHandler {
    fn handle(&self, request: PlaceOrder) -> anyhow::Result<PlaceOrder> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            anyhow::bail!("transient failure {call}");
        }
        Ok(request)
    }

    fn decorators(&self) -> Vec<DecoratorDescriptor> {
        vec![DecoratorDescriptor::use_policy(0, "orders")]
    }
}

fn fast_policies(attempts: u32) -> Arc<PolicyRegistry> {
    Arc::new(PolicyRegistry::new().with_policy(
        "orders",
        RetryPolicy::new(attempts)
            .with_backoff(Duration::from_millis(1), 1.0, Duration::from_millis(1))
            .without_jitter(),
    ))
}

#[test]
fn test_policy_link_retries_transient_handler_failures() {
    let calls = Arc::new(AtomicUsize::new(0));
    let processor = CommandProcessor::builder()
        .with_handler(FlakyHandler {
            failures: 2,
            calls: calls.clone(),
        })
        .with_policies(fast_policies(3))
        .build();

    processor.send(PlaceOrder::new("tea")).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_policy_link_gives_up_after_max_attempts() {
    let calls = Arc::new(AtomicUsize::new(0));
    let processor = CommandProcessor::builder()
        .with_handler(FlakyHandler {
            failures: 10,
            calls: calls.clone(),
        })
        .with_policies(fast_policies(2))
        .build();

    let err = processor.send(PlaceOrder::new("tea")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Handler);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_policy_link_with_unknown_policy_is_configuration_error() {
    let calls = Arc::new(AtomicUsize::new(0));
    let processor = CommandProcessor::builder()
        .with_handler(FlakyHandler { failures: 0, calls })
        .build();

    let err = processor.send(PlaceOrder::new("tea")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

struct SlowHandler;

#[async_trait]
impl AsyncHandler<PlaceOrder> for SlowHandler {
    async fn handle(&self, request: PlaceOrder) -> anyhow::Result<PlaceOrder> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(request)
    }

    fn decorators(&self) -> Vec<DecoratorDescriptor> {
        vec![DecoratorDescriptor::timeout(0, Duration::from_millis(20))]
    }
}

#[tokio::test]
async fn test_timeout_link_cancels_slow_async_handler() {
    let processor = CommandProcessor::builder().with_async_handler(SlowHandler).build();

    let err = processor.send_async(PlaceOrder::new("tea")).await.unwrap_err();
    match err {
        PostboxError::Timeout { duration } => assert_eq!(duration, Duration::from_millis(20)),
        other => panic!("unexpected error: {other}"),
    }
}

// =============================================================================
// Outbound without a mediator
// =============================================================================

#[test]
fn test_post_without_mediator_is_configuration_error() {
    let processor = CommandProcessor::builder().build();

    let err = processor.post(&PlaceOrder::new("tea")).unwrap_err();
    assert!(matches!(
        err,
        PostboxError::Configuration(ConfigurationError::NoOutbox { .. })
    ));
}
