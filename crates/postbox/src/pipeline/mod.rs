//! Declarative handler pipelines.
//!
//! # Overview
//!
//! ```text
//! SubscriberRegistry ──► handlers of R ──► decorators() ──► DecoratorDescriptor[]
//!                                                                  │
//!                                        HandlerFactory::create ◄──┘
//!                                                 │
//!                                                 ▼
//!                 Pipeline<R> = [Before nodes.. | core handler | After nodes..]
//! ```
//!
//! The [`PipelineBuilder`] owns the cache; the dispatcher asks it for the
//! pipelines of a request type and decides how many it may run.

mod builder;
mod descriptor;
mod factory;
mod handler;
mod registry;

pub use builder::{AsyncPipelines, PipelineBuilder, Pipelines};
pub use descriptor::{link_types, DecoratorDescriptor, HandlerTiming, LinkParams};
pub use factory::{AsyncLinkConstructor, HandlerFactory, LinkConstructor};
pub use handler::{
    AsyncHandler, AsyncNext, AsyncPipeline, AsyncRequestHandler, Handler, Next, Pipeline,
    RequestHandler,
};
pub use registry::SubscriberRegistry;

pub(crate) use handler::{AsyncCoreLink, CoreLink};
