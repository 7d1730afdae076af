//! Turns decorator descriptors into chain nodes.
//!
//! The factory resolves the built-in link types itself and looks everything
//! else up in a table of constructor closures registered per request type and
//! link type. A descriptor naming a link type nobody registered fails with
//! [`ConfigurationError::UnknownLinkType`] when the pipeline is built.
//!
//! # Example
//!
//! ```ignore
//! let factory = HandlerFactory::new()
//!     .with_inbox(inbox_store.clone())
//!     .with_link::<GreetingCommand, _>("app.audit", |params| {
//!         let channel: String = params.get(0, "channel")?;
//!         Ok(Arc::new(AuditLink::new(channel)))
//!     });
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::core::Request;
use crate::error::ConfigurationError;
use crate::handlers::{
    InboxLinkConfig, RequestLogging, TimeoutLink, UseInbox, UseInboxAsync, UsePolicy,
};
use crate::inbox::{AsyncInbox, AsyncInboxStore, Inbox, InboxStore};
use crate::pipeline::{
    link_types, AsyncRequestHandler, DecoratorDescriptor, LinkParams, RequestHandler,
};
use crate::policy::PolicyRegistry;

/// Builds a blocking node from descriptor parameters.
pub type LinkConstructor<R> = Arc<
    dyn Fn(LinkParams<'_>) -> Result<Arc<dyn RequestHandler<R>>, ConfigurationError>
        + Send
        + Sync,
>;

/// Builds an async node from descriptor parameters.
pub type AsyncLinkConstructor<R> = Arc<
    dyn Fn(LinkParams<'_>) -> Result<Arc<dyn AsyncRequestHandler<R>>, ConfigurationError>
        + Send
        + Sync,
>;

type LinkKey = (TypeId, String);

/// Creates and releases chain nodes.
pub struct HandlerFactory {
    links: HashMap<LinkKey, Box<dyn Any + Send + Sync>>,
    async_links: HashMap<LinkKey, Box<dyn Any + Send + Sync>>,
    inbox: Option<Arc<dyn InboxStore>>,
    async_inbox: Option<Arc<dyn AsyncInboxStore>>,
    policies: Arc<PolicyRegistry>,
    on_release: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

impl HandlerFactory {
    /// A factory with the default policy registry and no inbox.
    pub fn new() -> Self {
        Self {
            links: HashMap::new(),
            async_links: HashMap::new(),
            inbox: None,
            async_inbox: None,
            policies: Arc::new(PolicyRegistry::default()),
            on_release: None,
        }
    }

    /// Store used by blocking inbox nodes.
    pub fn with_inbox(mut self, store: Arc<dyn InboxStore>) -> Self {
        self.inbox = Some(store);
        self
    }

    /// Store used by async inbox nodes.
    pub fn with_async_inbox(mut self, store: Arc<dyn AsyncInboxStore>) -> Self {
        self.async_inbox = Some(store);
        self
    }

    /// Registry consulted by `postbox.policy` nodes.
    pub fn with_policies(mut self, policies: Arc<PolicyRegistry>) -> Self {
        self.policies = policies;
        self
    }

    /// Called with the link type of every node dropped from the pipeline cache.
    pub fn on_release<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_release = Some(Arc::new(hook));
        self
    }

    /// Register a blocking link type for request type `R`.
    pub fn with_link<R, F>(mut self, link_type: impl Into<String>, constructor: F) -> Self
    where
        R: Request,
        F: Fn(LinkParams<'_>) -> Result<Arc<dyn RequestHandler<R>>, ConfigurationError>
            + Send
            + Sync
            + 'static,
    {
        let constructor: LinkConstructor<R> = Arc::new(constructor);
        self.links
            .insert((TypeId::of::<R>(), link_type.into()), Box::new(constructor));
        self
    }

    /// Register an async link type for request type `R`.
    pub fn with_async_link<R, F>(mut self, link_type: impl Into<String>, constructor: F) -> Self
    where
        R: Request,
        F: Fn(LinkParams<'_>) -> Result<Arc<dyn AsyncRequestHandler<R>>, ConfigurationError>
            + Send
            + Sync
            + 'static,
    {
        let constructor: AsyncLinkConstructor<R> = Arc::new(constructor);
        self.async_links
            .insert((TypeId::of::<R>(), link_type.into()), Box::new(constructor));
        self
    }

    pub fn policies(&self) -> &Arc<PolicyRegistry> {
        &self.policies
    }

    pub fn has_inbox(&self) -> bool {
        self.inbox.is_some()
    }

    pub fn has_async_inbox(&self) -> bool {
        self.async_inbox.is_some()
    }

    /// Create the blocking node a descriptor describes.
    pub fn create<R: Request>(
        &self,
        descriptor: &DecoratorDescriptor,
    ) -> Result<Arc<dyn RequestHandler<R>>, ConfigurationError> {
        let params = descriptor.params();
        match descriptor.link_type.as_str() {
            link_types::INBOX => {
                let store = self
                    .inbox
                    .clone()
                    .ok_or(ConfigurationError::NoInbox { mode: "blocking" })?;
                let config = InboxLinkConfig::from_params(params)?;
                Ok(Arc::new(UseInbox::<R>::new(Inbox::new(store), config)))
            }
            link_types::LOGGING => Ok(Arc::new(RequestLogging::<R>::from_params(params)?)),
            link_types::POLICY => Ok(Arc::new(UsePolicy::<R>::from_params(
                params,
                Arc::clone(&self.policies),
            )?)),
            link_types::TIMEOUT => Err(ConfigurationError::UnsupportedLink {
                link_type: descriptor.link_type.clone(),
                mode: "blocking",
            }),
            other => {
                let constructor = self
                    .links
                    .get(&(TypeId::of::<R>(), other.to_string()))
                    .and_then(|boxed| boxed.downcast_ref::<LinkConstructor<R>>())
                    .ok_or_else(|| unknown_link::<R>(other))?;
                constructor(params)
            }
        }
    }

    /// Create the async node a descriptor describes.
    pub fn create_async<R: Request>(
        &self,
        descriptor: &DecoratorDescriptor,
    ) -> Result<Arc<dyn AsyncRequestHandler<R>>, ConfigurationError> {
        let params = descriptor.params();
        match descriptor.link_type.as_str() {
            link_types::INBOX => {
                let store = self
                    .async_inbox
                    .clone()
                    .ok_or(ConfigurationError::NoInbox { mode: "async" })?;
                let config = InboxLinkConfig::from_params(params)?;
                Ok(Arc::new(UseInboxAsync::<R>::new(AsyncInbox::new(store), config)))
            }
            link_types::LOGGING => Ok(Arc::new(RequestLogging::<R>::from_params(params)?)),
            link_types::POLICY => Ok(Arc::new(UsePolicy::<R>::from_params(
                params,
                Arc::clone(&self.policies),
            )?)),
            link_types::TIMEOUT => Ok(Arc::new(TimeoutLink::<R>::from_params(params)?)),
            other => {
                let constructor = self
                    .async_links
                    .get(&(TypeId::of::<R>(), other.to_string()))
                    .and_then(|boxed| boxed.downcast_ref::<AsyncLinkConstructor<R>>())
                    .ok_or_else(|| unknown_link::<R>(other))?;
                constructor(params)
            }
        }
    }

    /// Hand back a node of the given link type when its pipeline is dropped from the cache.
    pub fn release(&self, name: &str) {
        debug!(link = name, "releasing chain node");
        if let Some(hook) = &self.on_release {
            hook(name);
        }
    }
}

impl Default for HandlerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandlerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerFactory")
            .field("links", &self.links.len())
            .field("async_links", &self.async_links.len())
            .field("inbox", &self.inbox.is_some())
            .field("async_inbox", &self.async_inbox.is_some())
            .finish()
    }
}

fn unknown_link<R: Request>(link_type: &str) -> ConfigurationError {
    ConfigurationError::UnknownLinkType {
        link_type: link_type.to_string(),
        request_type: R::request_type(),
    }
}
