//! Handlers and links that leave a trace.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use postbox_core::{
    AsyncHandler, AsyncNext, AsyncRequestHandler, ConfigurationError, DecoratorDescriptor, Handler,
    HandlerTiming, LinkParams, Next, Request, RequestHandler, Result,
};

/// Link type of the nodes built by [`StepRecorder::constructor`].
pub const RECORD_STEP: &str = "testing.record_step";

// =============================================================================
// StepRecorder
// =============================================================================

/// Shared, ordered log of the steps a chain went through.
#[derive(Debug, Clone, Default)]
pub struct StepRecorder {
    steps: Arc<Mutex<Vec<String>>>,
}

impl StepRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, step: impl Into<String>) {
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(step.into());
    }

    pub fn steps(&self) -> Vec<String> {
        self.steps.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.steps.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// A node that records `label` and forwards.
    pub fn link<R: Request>(&self, label: impl Into<String>) -> RecordStep<R> {
        RecordStep {
            label: label.into(),
            recorder: self.clone(),
            _request: PhantomData,
        }
    }

    /// Descriptor for a recording node, labelled by its step and timing.
    pub fn descriptor(step: i32, timing: HandlerTiming, label: &str) -> DecoratorDescriptor {
        DecoratorDescriptor::new(step, timing, RECORD_STEP).with_param(label)
    }

    /// Constructor for [`RECORD_STEP`] links; register it for each request
    /// type under test.
    ///
    /// ```ignore
    /// let processor = CommandProcessor::builder()
    ///     .with_link::<Ping, _>(RECORD_STEP, recorder.constructor())
    ///     .build();
    /// ```
    pub fn constructor<R: Request>(
        &self,
    ) -> impl Fn(LinkParams<'_>) -> Result<Arc<dyn RequestHandler<R>>, ConfigurationError> + Send + Sync + 'static
    {
        let recorder = self.clone();
        move |params: LinkParams<'_>| {
            let label: String = params.get(0, "label")?;
            Ok(Arc::new(recorder.link::<R>(label)) as Arc<dyn RequestHandler<R>>)
        }
    }

    pub fn async_constructor<R: Request>(
        &self,
    ) -> impl Fn(LinkParams<'_>) -> Result<Arc<dyn AsyncRequestHandler<R>>, ConfigurationError>
           + Send
           + Sync
           + 'static {
        let recorder = self.clone();
        move |params: LinkParams<'_>| {
            let label: String = params.get(0, "label")?;
            Ok(Arc::new(recorder.link::<R>(label)) as Arc<dyn AsyncRequestHandler<R>>)
        }
    }
}

/// Records its label, then forwards. Works in both execution models.
pub struct RecordStep<R> {
    label: String,
    recorder: StepRecorder,
    _request: PhantomData<fn() -> R>,
}

impl<R: Request> RequestHandler<R> for RecordStep<R> {
    fn name(&self) -> &str {
        &self.label
    }

    fn handle(&self, request: R, next: Next<'_, R>) -> Result<R> {
        self.recorder.record(self.label.clone());
        next.run(request)
    }
}

#[async_trait]
impl<R: Request> AsyncRequestHandler<R> for RecordStep<R> {
    fn name(&self) -> &str {
        &self.label
    }

    async fn handle(&self, request: R, next: AsyncNext<'_, R>) -> Result<R> {
        self.recorder.record(self.label.clone());
        next.run(request).await
    }
}

// =============================================================================
// CountingHandler
// =============================================================================

/// Core handler that counts its invocations.
///
/// The counter is shared by clones, so keep a clone (or [`counter`](Self::counter))
/// before moving the handler into a processor.
pub struct CountingHandler<R> {
    name: &'static str,
    calls: Arc<AtomicUsize>,
    decorators: Vec<DecoratorDescriptor>,
    recorder: Option<StepRecorder>,
    fail_with: Option<String>,
    _request: PhantomData<fn() -> R>,
}

impl<R: Request> CountingHandler<R> {
    pub fn new() -> Self {
        Self {
            name: "CountingHandler",
            calls: Arc::new(AtomicUsize::new(0)),
            decorators: Vec::new(),
            recorder: None,
            fail_with: None,
            _request: PhantomData,
        }
    }

    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn with_decorators(mut self, decorators: Vec<DecoratorDescriptor>) -> Self {
        self.decorators = decorators;
        self
    }

    /// Record the handler's name as a step when it runs.
    pub fn with_recorder(mut self, recorder: StepRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Count the call, then fail with `message`.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.fail_with = Some(message.into());
        self
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    fn invoke(&self, request: R) -> anyhow::Result<R> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(recorder) = &self.recorder {
            recorder.record(self.name);
        }
        match &self.fail_with {
            Some(message) => Err(anyhow::anyhow!("{message}")),
            None => Ok(request),
        }
    }
}

impl<R: Request> Default for CountingHandler<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Clone for CountingHandler<R> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            calls: Arc::clone(&self.calls),
            decorators: self.decorators.clone(),
            recorder: self.recorder.clone(),
            fail_with: self.fail_with.clone(),
            _request: PhantomData,
        }
    }
}

impl<R: Request> Handler<R> for CountingHandler<R> {
    fn handle(&self, request: R) -> anyhow::Result<R> {
        self.invoke(request)
    }

    fn decorators(&self) -> Vec<DecoratorDescriptor> {
        self.decorators.clone()
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

#[async_trait]
impl<R: Request> AsyncHandler<R> for CountingHandler<R> {
    async fn handle(&self, request: R) -> anyhow::Result<R> {
        self.invoke(request)
    }

    fn decorators(&self) -> Vec<DecoratorDescriptor> {
        self.decorators.clone()
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
