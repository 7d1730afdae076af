//! Handler and chain-node traits, and the executable pipelines they form.
//!
//! There are two execution models with the same shape:
//!
//! | | blocking | async |
//! |---|---|---|
//! | core handler | [`Handler`] | [`AsyncHandler`] |
//! | chain node | [`RequestHandler`] | [`AsyncRequestHandler`] |
//! | cursor | [`Next`] | [`AsyncNext`] |
//! | chain | [`Pipeline`] | [`AsyncPipeline`] |
//!
//! A chain is an immutable slice of nodes. Each node receives the request and
//! a cursor over the nodes after it; calling `next.run(request)` forwards,
//! returning without calling it short-circuits the rest of the chain.

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{short_type_name, Request};
use crate::error::{PostboxError, Result};
use crate::pipeline::DecoratorDescriptor;

// =============================================================================
// Core handlers
// =============================================================================

/// Application logic for one request type, blocking model.
///
/// # Example
///
/// ```ignore
/// struct GreetingHandler;
///
/// impl Handler<GreetingCommand> for GreetingHandler {
///     fn handle(&self, command: GreetingCommand) -> anyhow::Result<GreetingCommand> {
///         println!("Hello {}", command.name);
///         Ok(command)
///     }
///
///     fn decorators(&self) -> Vec<DecoratorDescriptor> {
///         vec![
///             DecoratorDescriptor::logging(0, HandlerTiming::Before),
///             DecoratorDescriptor::use_inbox(1, "greetings", true, OnceOnlyAction::Throw),
///         ]
///     }
/// }
/// ```
pub trait Handler<R: Request>: Send + Sync + 'static {
    fn handle(&self, request: R) -> anyhow::Result<R>;

    /// Links to build around this handler.
    fn decorators(&self) -> Vec<DecoratorDescriptor> {
        Vec::new()
    }

    fn name(&self) -> &'static str {
        short_type_name(std::any::type_name::<Self>())
    }
}

/// Application logic for one request type, async model.
#[async_trait]
pub trait AsyncHandler<R: Request>: Send + Sync + 'static {
    async fn handle(&self, request: R) -> anyhow::Result<R>;

    fn decorators(&self) -> Vec<DecoratorDescriptor> {
        Vec::new()
    }

    fn name(&self) -> &'static str {
        short_type_name(std::any::type_name::<Self>())
    }
}

// =============================================================================
// Chain nodes
// =============================================================================

/// One link of a blocking chain.
pub trait RequestHandler<R>: Send + Sync {
    fn name(&self) -> &str;

    fn handle(&self, request: R, next: Next<'_, R>) -> Result<R>;
}

/// One link of an async chain.
#[async_trait]
pub trait AsyncRequestHandler<R>: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, request: R, next: AsyncNext<'_, R>) -> Result<R>;
}

/// Cursor over the remaining nodes of a blocking chain.
pub struct Next<'a, R> {
    links: &'a [Arc<dyn RequestHandler<R>>],
}

impl<'a, R: Request> Next<'a, R> {
    pub(crate) fn new(links: &'a [Arc<dyn RequestHandler<R>>]) -> Self {
        Self { links }
    }

    /// Run the rest of the chain. An exhausted cursor returns the request.
    pub fn run(self, request: R) -> Result<R> {
        match self.links.split_first() {
            Some((link, rest)) => link.handle(request, Next::new(rest)),
            None => Ok(request),
        }
    }

    pub fn remaining(&self) -> usize {
        self.links.len()
    }
}

impl<R> Clone for Next<'_, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R> Copy for Next<'_, R> {}

/// Cursor over the remaining nodes of an async chain.
pub struct AsyncNext<'a, R> {
    links: &'a [Arc<dyn AsyncRequestHandler<R>>],
}

impl<'a, R: Request> AsyncNext<'a, R> {
    pub(crate) fn new(links: &'a [Arc<dyn AsyncRequestHandler<R>>]) -> Self {
        Self { links }
    }

    pub async fn run(self, request: R) -> Result<R> {
        match self.links.split_first() {
            Some((link, rest)) => link.handle(request, AsyncNext::new(rest)).await,
            None => Ok(request),
        }
    }

    pub fn remaining(&self) -> usize {
        self.links.len()
    }
}

impl<R> Clone for AsyncNext<'_, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R> Copy for AsyncNext<'_, R> {}

// =============================================================================
// Core links
// =============================================================================

/// Runs the core handler, then forwards its result to the After nodes.
pub(crate) struct CoreLink<R: Request> {
    handler: Arc<dyn Handler<R>>,
}

impl<R: Request> CoreLink<R> {
    pub(crate) fn new(handler: Arc<dyn Handler<R>>) -> Self {
        Self { handler }
    }
}

impl<R: Request> RequestHandler<R> for CoreLink<R> {
    fn name(&self) -> &str {
        self.handler.name()
    }

    fn handle(&self, request: R, next: Next<'_, R>) -> Result<R> {
        let handled = self.handler.handle(request).map_err(PostboxError::from_handler)?;
        next.run(handled)
    }
}

pub(crate) struct AsyncCoreLink<R: Request> {
    handler: Arc<dyn AsyncHandler<R>>,
}

impl<R: Request> AsyncCoreLink<R> {
    pub(crate) fn new(handler: Arc<dyn AsyncHandler<R>>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<R: Request> AsyncRequestHandler<R> for AsyncCoreLink<R> {
    fn name(&self) -> &str {
        self.handler.name()
    }

    async fn handle(&self, request: R, next: AsyncNext<'_, R>) -> Result<R> {
        let handled = self
            .handler
            .handle(request)
            .await
            .map_err(PostboxError::from_handler)?;
        next.run(handled).await
    }
}

// =============================================================================
// Pipelines
// =============================================================================

/// A built blocking chain around one core handler.
pub struct Pipeline<R> {
    links: Arc<[Arc<dyn RequestHandler<R>>]>,
    handler_name: &'static str,
}

impl<R: Request> Pipeline<R> {
    pub(crate) fn new(links: Vec<Arc<dyn RequestHandler<R>>>, handler_name: &'static str) -> Self {
        Self {
            links: links.into(),
            handler_name,
        }
    }

    /// Run the request through every node, head to tail.
    pub fn handle(&self, request: R) -> Result<R> {
        Next::new(&self.links).run(request)
    }

    /// Name of the core handler.
    pub fn handler_name(&self) -> &'static str {
        self.handler_name
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Node names in execution order, e.g. `"Logging|UseInbox|GreetingHandler"`.
    pub fn describe(&self) -> String {
        self.links.iter().map(|l| l.name()).collect::<Vec<_>>().join("|")
    }
}

impl<R> Clone for Pipeline<R> {
    fn clone(&self) -> Self {
        Self {
            links: Arc::clone(&self.links),
            handler_name: self.handler_name,
        }
    }
}

/// A built async chain around one core handler.
pub struct AsyncPipeline<R> {
    links: Arc<[Arc<dyn AsyncRequestHandler<R>>]>,
    handler_name: &'static str,
}

impl<R: Request> AsyncPipeline<R> {
    pub(crate) fn new(
        links: Vec<Arc<dyn AsyncRequestHandler<R>>>,
        handler_name: &'static str,
    ) -> Self {
        Self {
            links: links.into(),
            handler_name,
        }
    }

    pub async fn handle(&self, request: R) -> Result<R> {
        AsyncNext::new(&self.links).run(request).await
    }

    pub fn handler_name(&self) -> &'static str {
        self.handler_name
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn describe(&self) -> String {
        self.links.iter().map(|l| l.name()).collect::<Vec<_>>().join("|")
    }
}

impl<R> Clone for AsyncPipeline<R> {
    fn clone(&self) -> Self {
        Self {
            links: Arc::clone(&self.links),
            handler_name: self.handler_name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RequestId;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping {
        id: RequestId,
        trail: Vec<String>,
    }

    crate::request!(Ping);

    struct Append(&'static str);

    impl RequestHandler<Ping> for Append {
        fn name(&self) -> &str {
            self.0
        }

        fn handle(&self, mut request: Ping, next: Next<'_, Ping>) -> Result<Ping> {
            request.trail.push(self.0.to_string());
            next.run(request)
        }
    }

    struct Stop;

    impl RequestHandler<Ping> for Stop {
        fn name(&self) -> &str {
            "Stop"
        }

        fn handle(&self, request: Ping, _next: Next<'_, Ping>) -> Result<Ping> {
            Ok(request)
        }
    }

    struct PongHandler {
        calls: Mutex<usize>,
    }

    impl Handler<Ping> for PongHandler {
        fn handle(&self, mut request: Ping) -> anyhow::Result<Ping> {
            *self.calls.lock().unwrap() += 1;
            request.trail.push("core".into());
            Ok(request)
        }
    }

    fn ping() -> Ping {
        Ping {
            id: RequestId::new(),
            trail: Vec::new(),
        }
    }

    #[test]
    fn test_pipeline_runs_links_in_order() {
        let core = Arc::new(PongHandler {
            calls: Mutex::new(0),
        });
        let links: Vec<Arc<dyn RequestHandler<Ping>>> = vec![
            Arc::new(Append("a")),
            Arc::new(CoreLink::new(core.clone() as Arc<dyn Handler<Ping>>)),
            Arc::new(Append("z")),
        ];
        let pipeline = Pipeline::new(links, "PongHandler");

        let result = pipeline.handle(ping()).unwrap();
        assert_eq!(result.trail, vec!["a", "core", "z"]);
        assert_eq!(*core.calls.lock().unwrap(), 1);
        assert_eq!(pipeline.describe(), "a|PongHandler|z");
    }

    #[test]
    fn test_node_can_short_circuit() {
        let core = Arc::new(PongHandler {
            calls: Mutex::new(0),
        });
        let links: Vec<Arc<dyn RequestHandler<Ping>>> = vec![
            Arc::new(Stop),
            Arc::new(CoreLink::new(core.clone() as Arc<dyn Handler<Ping>>)),
        ];
        let pipeline = Pipeline::new(links, "PongHandler");

        let result = pipeline.handle(ping()).unwrap();
        assert!(result.trail.is_empty());
        assert_eq!(*core.calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_handler_name_strips_module_path() {
        let core = PongHandler {
            calls: Mutex::new(0),
        };
        assert_eq!(Handler::<Ping>::name(&core), "PongHandler");
    }

    struct AsyncPong;

    #[async_trait]
    impl AsyncHandler<Ping> for AsyncPong {
        async fn handle(&self, mut request: Ping) -> anyhow::Result<Ping> {
            tokio::task::yield_now().await;
            request.trail.push("async-core".into());
            Ok(request)
        }
    }

    #[tokio::test]
    async fn test_async_pipeline_runs_core() {
        let links: Vec<Arc<dyn AsyncRequestHandler<Ping>>> = vec![Arc::new(AsyncCoreLink::new(
            Arc::new(AsyncPong) as Arc<dyn AsyncHandler<Ping>>,
        ))];
        let pipeline = AsyncPipeline::new(links, "AsyncPong");
        let result = pipeline.handle(ping()).await.unwrap();
        assert_eq!(result.trail, vec!["async-core"]);
    }

    #[test]
    fn test_handler_error_is_wrapped() {
        struct Failing;
        impl Handler<Ping> for Failing {
            fn handle(&self, _request: Ping) -> anyhow::Result<Ping> {
                anyhow::bail!("nope")
            }
        }

        let links: Vec<Arc<dyn RequestHandler<Ping>>> =
            vec![Arc::new(CoreLink::new(Arc::new(Failing) as Arc<dyn Handler<Ping>>))];
        let pipeline = Pipeline::new(links, "Failing");
        match pipeline.handle(ping()) {
            Err(PostboxError::Handler(e)) => assert_eq!(e.to_string(), "nope"),
            other => panic!("Expected Handler error, got {other:?}"),
        }
    }
}
