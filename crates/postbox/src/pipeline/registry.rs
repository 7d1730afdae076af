//! Explicit registration of core handlers per request type.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{short_type_name, Request};
use crate::error::ConfigurationError;
use crate::pipeline::{AsyncHandler, Handler};

struct Registration<H: ?Sized> {
    handler_type: TypeId,
    handler: Arc<H>,
}

type Registrations<R> = Vec<Registration<dyn Handler<R>>>;
type AsyncRegistrations<R> = Vec<Registration<dyn AsyncHandler<R>>>;

/// Core handlers by request type, for both execution models.
///
/// Handlers of one type may be registered for a request type once. A request
/// type may have any number of handlers of different types; the dispatcher
/// decides whether that is allowed.
///
/// # Example
///
/// ```ignore
/// let registry = SubscriberRegistry::new()
///     .with_handler::<GreetingCommand, _>(GreetingHandler)
///     .with_handler::<GreetingMade, _>(AuditHandler)
///     .with_handler::<GreetingMade, _>(MailHandler);
/// ```
#[derive(Default)]
pub struct SubscriberRegistry {
    handlers: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    async_handlers: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a blocking handler.
    ///
    /// # Panics
    ///
    /// Panics if a handler of type `H` is already registered for `R`. Use
    /// [`register`](Self::register) to handle the error instead.
    pub fn with_handler<R: Request, H: Handler<R>>(mut self, handler: H) -> Self {
        if let Err(e) = self.register::<R, H>(handler) {
            panic!("{e}");
        }
        self
    }

    /// Register an async handler.
    ///
    /// # Panics
    ///
    /// Panics if a handler of type `H` is already registered for `R`.
    pub fn with_async_handler<R: Request, H: AsyncHandler<R>>(mut self, handler: H) -> Self {
        if let Err(e) = self.register_async::<R, H>(handler) {
            panic!("{e}");
        }
        self
    }

    pub fn register<R: Request, H: Handler<R>>(&mut self, handler: H) -> Result<(), ConfigurationError> {
        let registrations = self
            .handlers
            .entry(TypeId::of::<R>())
            .or_insert_with(|| Box::new(Registrations::<R>::new()))
            .downcast_mut::<Registrations<R>>()
            .ok_or_else(|| already_registered::<R, H>())?;
        push_unique::<R, H, dyn Handler<R>>(registrations, Arc::new(handler))
    }

    pub fn register_async<R: Request, H: AsyncHandler<R>>(
        &mut self,
        handler: H,
    ) -> Result<(), ConfigurationError> {
        let registrations = self
            .async_handlers
            .entry(TypeId::of::<R>())
            .or_insert_with(|| Box::new(AsyncRegistrations::<R>::new()))
            .downcast_mut::<AsyncRegistrations<R>>()
            .ok_or_else(|| already_registered::<R, H>())?;
        push_unique::<R, H, dyn AsyncHandler<R>>(registrations, Arc::new(handler))
    }

    /// Blocking handlers of `R`, in registration order.
    pub fn handlers<R: Request>(&self) -> Vec<Arc<dyn Handler<R>>> {
        self.handlers
            .get(&TypeId::of::<R>())
            .and_then(|boxed| boxed.downcast_ref::<Registrations<R>>())
            .map(|regs| regs.iter().map(|r| Arc::clone(&r.handler)).collect())
            .unwrap_or_default()
    }

    /// Async handlers of `R`, in registration order.
    pub fn async_handlers<R: Request>(&self) -> Vec<Arc<dyn AsyncHandler<R>>> {
        self.async_handlers
            .get(&TypeId::of::<R>())
            .and_then(|boxed| boxed.downcast_ref::<AsyncRegistrations<R>>())
            .map(|regs| regs.iter().map(|r| Arc::clone(&r.handler)).collect())
            .unwrap_or_default()
    }

    pub fn handler_count<R: Request>(&self) -> usize {
        self.handlers
            .get(&TypeId::of::<R>())
            .and_then(|boxed| boxed.downcast_ref::<Registrations<R>>())
            .map_or(0, Vec::len)
    }

    pub fn async_handler_count<R: Request>(&self) -> usize {
        self.async_handlers
            .get(&TypeId::of::<R>())
            .and_then(|boxed| boxed.downcast_ref::<AsyncRegistrations<R>>())
            .map_or(0, Vec::len)
    }
}

fn push_unique<R: Request, H: 'static, D: ?Sized>(
    registrations: &mut Vec<Registration<D>>,
    handler: Arc<D>,
) -> Result<(), ConfigurationError> {
    let handler_type = TypeId::of::<H>();
    if registrations.iter().any(|r| r.handler_type == handler_type) {
        return Err(already_registered::<R, H>());
    }
    registrations.push(Registration {
        handler_type,
        handler,
    });
    Ok(())
}

fn already_registered<R: Request, H>() -> ConfigurationError {
    ConfigurationError::HandlerAlreadyRegistered {
        handler: short_type_name(type_name::<H>()),
        request_type: R::request_type(),
    }
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("request_types", &self.handlers.len())
            .field("async_request_types", &self.async_handlers.len())
            .finish()
    }
}
