//! Assembles and caches handler chains.
//!
//! For every core handler registered for a request type the builder:
//!
//! 1. partitions the handler's descriptors into Before and After groups
//! 2. sorts each group by ascending step, keeping declaration order on ties
//! 3. puts the global inbox at the head, unless the handler has its own inbox
//!    descriptor or the `no_global_inbox` marker
//! 4. creates each node through the [`HandlerFactory`]
//! 5. splices `before.. | core | after..` into an immutable [`Pipeline`]
//!
//! Pipelines are cached per request type. The cache is read-mostly: a miss
//! builds outside any lock and the first finished build wins the insert.

use std::any::{Any, TypeId};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use smallvec::SmallVec;
use tracing::debug;

use crate::config::InboxConfiguration;
use crate::core::Request;
use crate::error::Result;
use crate::pipeline::{
    AsyncCoreLink, AsyncHandler, AsyncPipeline, AsyncRequestHandler, CoreLink,
    DecoratorDescriptor, Handler, HandlerFactory, HandlerTiming, Pipeline, RequestHandler,
    SubscriberRegistry,
};

/// Every blocking chain built for a request type, one per core handler.
pub type Pipelines<R> = Arc<[Pipeline<R>]>;

/// Every async chain built for a request type, one per core handler.
pub type AsyncPipelines<R> = Arc<[AsyncPipeline<R>]>;

type Descriptors = SmallVec<[DecoratorDescriptor; 4]>;

struct CacheEntry {
    pipelines: Box<dyn Any + Send + Sync>,
    /// Names of the nodes the factory created, released on eviction.
    created: Vec<String>,
}

/// Builds [`Pipeline`]s and [`AsyncPipeline`]s from registered handlers.
pub struct PipelineBuilder {
    registry: Arc<SubscriberRegistry>,
    factory: Arc<HandlerFactory>,
    inbox: Option<InboxConfiguration>,
    cache: DashMap<TypeId, CacheEntry>,
    async_cache: DashMap<TypeId, CacheEntry>,
}

impl PipelineBuilder {
    pub fn new(registry: Arc<SubscriberRegistry>, factory: Arc<HandlerFactory>) -> Self {
        Self {
            registry,
            factory,
            inbox: None,
            cache: DashMap::new(),
            async_cache: DashMap::new(),
        }
    }

    /// Insert an inbox node into every chain that does not declare one.
    pub fn with_global_inbox(mut self, configuration: InboxConfiguration) -> Self {
        self.inbox = Some(configuration);
        self
    }

    pub fn factory(&self) -> &Arc<HandlerFactory> {
        &self.factory
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// Blocking chains for `R`. Empty when no handler is registered.
    pub fn build<R: Request>(&self) -> Result<Pipelines<R>> {
        let key = TypeId::of::<R>();
        if let Some(cached) = cached::<Pipelines<R>>(&self.cache, key) {
            return Ok(cached);
        }

        let mut created = Vec::new();
        let mut pipelines = Vec::new();
        for handler in self.registry.handlers::<R>() {
            match self.build_pipeline(handler, &mut created) {
                Ok(pipeline) => pipelines.push(pipeline),
                Err(e) => {
                    self.release(&created);
                    return Err(e);
                }
            }
        }
        let pipelines: Pipelines<R> = pipelines.into();
        for pipeline in pipelines.iter() {
            debug!(request_type = R::request_type(), chain = %pipeline.describe(), "built pipeline");
        }

        Ok(self.insert(&self.cache, key, pipelines, created))
    }

    /// Async chains for `R`. Empty when no async handler is registered.
    pub fn build_async<R: Request>(&self) -> Result<AsyncPipelines<R>> {
        let key = TypeId::of::<R>();
        if let Some(cached) = cached::<AsyncPipelines<R>>(&self.async_cache, key) {
            return Ok(cached);
        }

        let mut created = Vec::new();
        let mut pipelines = Vec::new();
        for handler in self.registry.async_handlers::<R>() {
            match self.build_async_pipeline(handler, &mut created) {
                Ok(pipeline) => pipelines.push(pipeline),
                Err(e) => {
                    self.release(&created);
                    return Err(e);
                }
            }
        }
        let pipelines: AsyncPipelines<R> = pipelines.into();
        for pipeline in pipelines.iter() {
            debug!(request_type = R::request_type(), chain = %pipeline.describe(), "built async pipeline");
        }

        Ok(self.insert(&self.async_cache, key, pipelines, created))
    }

    /// Drop every cached chain and release its nodes. Idempotent.
    pub fn clear_cache(&self) {
        for cache in [&self.cache, &self.async_cache] {
            let keys: Vec<TypeId> = cache.iter().map(|e| *e.key()).collect();
            for key in keys {
                if let Some((_, entry)) = cache.remove(&key) {
                    self.release(&entry.created);
                }
            }
        }
    }

    /// Number of request types with cached chains, blocking and async.
    pub fn cached_count(&self) -> usize {
        self.cache.len() + self.async_cache.len()
    }

    fn build_pipeline<R: Request>(
        &self,
        handler: Arc<dyn Handler<R>>,
        created: &mut Vec<String>,
    ) -> Result<Pipeline<R>> {
        let (before, after) = self.arrange(handler.decorators(), handler.name());

        let mut links: Vec<Arc<dyn RequestHandler<R>>> = Vec::with_capacity(before.len() + after.len() + 1);
        for descriptor in &before {
            links.push(self.factory.create::<R>(descriptor)?);
            created.push(descriptor.link_type.clone());
        }
        let name = handler.name();
        links.push(Arc::new(CoreLink::new(handler)));
        for descriptor in &after {
            links.push(self.factory.create::<R>(descriptor)?);
            created.push(descriptor.link_type.clone());
        }

        Ok(Pipeline::new(links, name))
    }

    fn build_async_pipeline<R: Request>(
        &self,
        handler: Arc<dyn AsyncHandler<R>>,
        created: &mut Vec<String>,
    ) -> Result<AsyncPipeline<R>> {
        let (before, after) = self.arrange(handler.decorators(), handler.name());

        let mut links: Vec<Arc<dyn AsyncRequestHandler<R>>> =
            Vec::with_capacity(before.len() + after.len() + 1);
        for descriptor in &before {
            links.push(self.factory.create_async::<R>(descriptor)?);
            created.push(descriptor.link_type.clone());
        }
        let name = handler.name();
        links.push(Arc::new(AsyncCoreLink::new(handler)));
        for descriptor in &after {
            links.push(self.factory.create_async::<R>(descriptor)?);
            created.push(descriptor.link_type.clone());
        }

        Ok(AsyncPipeline::new(links, name))
    }

    /// Split, order and complete a handler's descriptors.
    fn arrange(
        &self,
        descriptors: Vec<DecoratorDescriptor>,
        handler_name: &str,
    ) -> (Descriptors, Descriptors) {
        let opted_out = descriptors.iter().any(DecoratorDescriptor::is_marker);
        let has_inbox = descriptors.iter().any(DecoratorDescriptor::is_inbox);

        let (mut before, mut after): (Descriptors, Descriptors) = descriptors
            .into_iter()
            .filter(|d| !d.is_marker())
            .partition(|d| d.timing == HandlerTiming::Before);
        before.sort_by_key(|d| d.step);
        after.sort_by_key(|d| d.step);

        if let Some(inbox) = &self.inbox {
            if !opted_out && !has_inbox {
                before.insert(0, inbox.descriptor_for(handler_name));
            }
        }
        (before, after)
    }

    fn insert<P>(&self, cache: &DashMap<TypeId, CacheEntry>, key: TypeId, built: P, created: Vec<String>) -> P
    where
        P: Clone + Send + Sync + 'static,
    {
        match cache.entry(key) {
            // Another build won the race; ours was never handed out.
            Entry::Occupied(existing) => {
                let winner = existing.get().pipelines.downcast_ref::<P>().cloned();
                drop(existing);
                self.release(&created);
                winner.unwrap_or(built)
            }
            Entry::Vacant(slot) => {
                slot.insert(CacheEntry {
                    pipelines: Box::new(built.clone()),
                    created,
                });
                built
            }
        }
    }

    fn release(&self, created: &[String]) {
        for name in created {
            self.factory.release(name);
        }
    }
}

fn cached<P: Clone + 'static>(cache: &DashMap<TypeId, CacheEntry>, key: TypeId) -> Option<P> {
    cache
        .get(&key)
        .and_then(|entry| entry.pipelines.downcast_ref::<P>().cloned())
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("cached", &self.cached_count())
            .field("global_inbox", &self.inbox.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RequestId;
    use crate::error::{ConfigurationError, PostboxError};
    use crate::inbox::OnceOnlyAction;
    use crate::pipeline::{link_types, Next};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Greeting {
        id: RequestId,
    }

    crate::request!(Greeting);

    /// Records its label into a shared trail when run.
    struct Step {
        label: String,
        trail: Arc<Mutex<Vec<String>>>,
    }

    impl RequestHandler<Greeting> for Step {
        fn name(&self) -> &str {
            &self.label
        }

        fn handle(&self, request: Greeting, next: Next<'_, Greeting>) -> Result<Greeting> {
            self.trail.lock().unwrap().push(self.label.clone());
            next.run(request)
        }
    }

    struct Recorded {
        trail: Arc<Mutex<Vec<String>>>,
        decorators: Vec<DecoratorDescriptor>,
    }

    impl Handler<Greeting> for Recorded {
        fn handle(&self, request: Greeting) -> anyhow::Result<Greeting> {
            self.trail.lock().unwrap().push("core".into());
            Ok(request)
        }

        fn decorators(&self) -> Vec<DecoratorDescriptor> {
            self.decorators.clone()
        }
    }

    fn step(timing: HandlerTiming, step: i32, label: &str) -> DecoratorDescriptor {
        DecoratorDescriptor::new(step, timing, "test.step").with_param(label)
    }

    fn builder(trail: &Arc<Mutex<Vec<String>>>, decorators: Vec<DecoratorDescriptor>) -> PipelineBuilder {
        let link_trail = trail.clone();
        let factory = HandlerFactory::new().with_link::<Greeting, _>("test.step", move |params| {
            let label: String = params.get(0, "label")?;
            Ok(Arc::new(Step {
                label,
                trail: link_trail.clone(),
            }) as Arc<dyn RequestHandler<Greeting>>)
        });
        let registry = SubscriberRegistry::new().with_handler::<Greeting, _>(Recorded {
            trail: trail.clone(),
            decorators,
        });
        PipelineBuilder::new(Arc::new(registry), Arc::new(factory))
    }

    fn greeting() -> Greeting {
        Greeting {
            id: RequestId::new(),
        }
    }

    #[test]
    fn test_no_descriptors_yields_single_link() {
        let trail = Arc::new(Mutex::new(Vec::new()));
        let pipelines = builder(&trail, Vec::new()).build::<Greeting>().unwrap();

        assert_eq!(pipelines.len(), 1);
        assert_eq!(pipelines[0].len(), 1);
        assert_eq!(pipelines[0].describe(), "Recorded");
    }

    #[test]
    fn test_steps_run_ascending_within_each_timing() {
        let trail = Arc::new(Mutex::new(Vec::new()));
        let decorators = vec![
            step(HandlerTiming::After, 5, "after-5"),
            step(HandlerTiming::Before, 3, "before-3"),
            step(HandlerTiming::After, 1, "after-1"),
            step(HandlerTiming::Before, -2, "before-neg"),
            step(HandlerTiming::Before, 10, "before-10"),
        ];
        let pipelines = builder(&trail, decorators).build::<Greeting>().unwrap();
        pipelines[0].handle(greeting()).unwrap();

        assert_eq!(
            *trail.lock().unwrap(),
            vec!["before-neg", "before-3", "before-10", "core", "after-1", "after-5"]
        );
    }

    #[test]
    fn test_equal_steps_keep_declaration_order() {
        let trail = Arc::new(Mutex::new(Vec::new()));
        let decorators = vec![
            step(HandlerTiming::Before, 1, "first"),
            step(HandlerTiming::Before, 1, "second"),
            step(HandlerTiming::Before, 0, "zero"),
            step(HandlerTiming::Before, 1, "third"),
        ];
        let pipelines = builder(&trail, decorators).build::<Greeting>().unwrap();
        assert_eq!(pipelines[0].describe(), "zero|first|second|third|Recorded");
    }

    #[test]
    fn test_unknown_link_type_fails_the_build() {
        let trail = Arc::new(Mutex::new(Vec::new()));
        let decorators = vec![DecoratorDescriptor::before(1, "app.unregistered")];
        match builder(&trail, decorators).build::<Greeting>() {
            Err(PostboxError::Configuration(ConfigurationError::UnknownLinkType { link_type, .. })) => {
                assert_eq!(link_type, "app.unregistered")
            }
            Err(other) => panic!("Expected UnknownLinkType, got {other:?}"),
            Ok(_) => panic!("Expected UnknownLinkType"),
        }
        assert!(trail.lock().unwrap().is_empty());
    }

    #[test]
    fn test_builds_are_cached() {
        let trail = Arc::new(Mutex::new(Vec::new()));
        let builder = builder(&trail, vec![step(HandlerTiming::Before, 1, "a")]);

        let first = builder.build::<Greeting>().unwrap();
        let second = builder.build::<Greeting>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(builder.cached_count(), 1);
    }

    #[test]
    fn test_clear_cache_is_idempotent_and_releases_nodes() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let factory = HandlerFactory::new()
            .on_release(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .with_link::<Greeting, _>("test.step", |params| {
                let label: String = params.get(0, "label")?;
                Ok(Arc::new(Step {
                    label,
                    trail: Arc::new(Mutex::new(Vec::new())),
                }) as Arc<dyn RequestHandler<Greeting>>)
            });
        let registry = SubscriberRegistry::new().with_handler::<Greeting, _>(Recorded {
            trail: Arc::new(Mutex::new(Vec::new())),
            decorators: vec![
                step(HandlerTiming::Before, 1, "a"),
                step(HandlerTiming::After, 1, "b"),
            ],
        });
        let builder = PipelineBuilder::new(Arc::new(registry), Arc::new(factory));

        let first = builder.build::<Greeting>().unwrap();
        builder.clear_cache();
        builder.clear_cache();
        assert_eq!(released.load(Ordering::SeqCst), 2);
        assert_eq!(builder.cached_count(), 0);

        let rebuilt = builder.build::<Greeting>().unwrap();
        assert!(!Arc::ptr_eq(&first, &rebuilt));
    }

    #[test]
    fn test_failed_build_releases_nodes_already_created() {
        let released = Arc::new(Mutex::new(Vec::new()));
        let names = released.clone();
        let factory = HandlerFactory::new()
            .on_release(move |name| names.lock().unwrap().push(name.to_string()))
            .with_link::<Greeting, _>("test.step", |params| {
                let label: String = params.get(0, "label")?;
                Ok(Arc::new(Step {
                    label,
                    trail: Arc::new(Mutex::new(Vec::new())),
                }) as Arc<dyn RequestHandler<Greeting>>)
            });
        let registry = SubscriberRegistry::new().with_handler::<Greeting, _>(Recorded {
            trail: Arc::new(Mutex::new(Vec::new())),
            decorators: vec![
                step(HandlerTiming::Before, 1, "a"),
                DecoratorDescriptor::after(1, "app.unregistered"),
            ],
        });
        let builder = PipelineBuilder::new(Arc::new(registry), Arc::new(factory));

        assert!(builder.build::<Greeting>().is_err());
        assert_eq!(*released.lock().unwrap(), vec!["test.step".to_string()]);
        assert_eq!(builder.cached_count(), 0);
    }

    #[test]
    fn test_unregistered_request_builds_no_pipelines() {
        let builder = PipelineBuilder::new(
            Arc::new(SubscriberRegistry::new()),
            Arc::new(HandlerFactory::new()),
        );
        assert!(builder.build::<Greeting>().unwrap().is_empty());
        assert!(builder.build_async::<Greeting>().unwrap().is_empty());
    }

    #[test]
    fn test_global_inbox_goes_first() {
        let builder = PipelineBuilder::new(
            Arc::new(SubscriberRegistry::new()),
            Arc::new(HandlerFactory::new()),
        )
        .with_global_inbox(InboxConfiguration::default());

        let (before, after) = builder.arrange(
            vec![
                DecoratorDescriptor::logging(-100, HandlerTiming::Before),
                DecoratorDescriptor::logging(0, HandlerTiming::After),
            ],
            "GreetingHandler",
        );
        assert_eq!(before.len(), 2);
        assert_eq!(before[0].link_type, link_types::INBOX);
        assert_eq!(before[0].params[1], serde_json::json!("GreetingHandler"));
        assert_eq!(after.len(), 1);
    }

    #[test]
    fn test_global_inbox_respects_own_inbox_and_opt_out() {
        let builder = PipelineBuilder::new(
            Arc::new(SubscriberRegistry::new()),
            Arc::new(HandlerFactory::new()),
        )
        .with_global_inbox(InboxConfiguration::default());

        let (own, _) = builder.arrange(
            vec![DecoratorDescriptor::use_inbox(3, "mine", true, OnceOnlyAction::Warn)],
            "GreetingHandler",
        );
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].params[1], serde_json::json!("mine"));

        let (opted_out, _) = builder.arrange(vec![DecoratorDescriptor::no_global_inbox()], "GreetingHandler");
        assert!(opted_out.is_empty());
    }
}
