//! Request to message mapping.
//!
//! A request type is posted through the outbox only if a mapper and a
//! [`Publication`] are registered for it. The publication says where the
//! message goes; the mapper turns the request into bytes and back.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::core::{Request, RoutingKey};
use crate::error::{ConfigurationError, PostboxError, Result};
use crate::message::{Message, MessageBody, MessageHeader, MessageType};

/// Where and as what a request type is published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    pub topic: RoutingKey,
    pub message_type: MessageType,
}

impl Publication {
    pub fn command(topic: impl Into<RoutingKey>) -> Self {
        Self {
            topic: topic.into(),
            message_type: MessageType::Command,
        }
    }

    pub fn event(topic: impl Into<RoutingKey>) -> Self {
        Self {
            topic: topic.into(),
            message_type: MessageType::Event,
        }
    }
}

/// Converts one request type to and from a [`Message`].
///
/// Round trips must keep the request id: the header id of a wrapped message is
/// the request id, and unwrapping that message yields a request with that id.
pub trait MessageMapper<R: Request>: Send + Sync {
    fn wrap(&self, request: &R, publication: &Publication) -> anyhow::Result<Message>;

    fn unwrap(&self, message: &Message) -> anyhow::Result<R>;
}

/// Maps a request to a JSON body.
pub struct JsonMessageMapper<R>(PhantomData<fn() -> R>);

impl<R> JsonMessageMapper<R> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<R> Default for JsonMessageMapper<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Request> MessageMapper<R> for JsonMessageMapper<R> {
    fn wrap(&self, request: &R, publication: &Publication) -> anyhow::Result<Message> {
        let header = MessageHeader::new(
            request.id().clone(),
            publication.topic.clone(),
            publication.message_type,
        );
        let body = MessageBody::json(request)
            .with_context(|| format!("failed to serialize {}", R::request_type()))?;
        Ok(Message::new(header, body))
    }

    fn unwrap(&self, message: &Message) -> anyhow::Result<R> {
        serde_json::from_slice(&message.body.bytes)
            .with_context(|| format!("failed to deserialize message {} as {}", message.id(), R::request_type()))
    }
}

struct MapperRegistration<R> {
    publication: Publication,
    mapper: Arc<dyn MessageMapper<R>>,
}

/// Mappers and publications by request type.
///
/// # Example
///
/// ```ignore
/// let mappers = MapperRegistry::new()
///     .with_json::<GreetingCommand>(Publication::command("greetings"));
/// let message = mappers.wrap(&GreetingCommand::new("Ada"))?;
/// ```
#[derive(Default)]
pub struct MapperRegistry {
    mappers: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl MapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mapper<R: Request>(
        mut self,
        publication: Publication,
        mapper: Arc<dyn MessageMapper<R>>,
    ) -> Self {
        self.register(publication, mapper);
        self
    }

    /// Register the [`JsonMessageMapper`] for `R`.
    pub fn with_json<R: Request>(self, publication: Publication) -> Self {
        self.with_mapper::<R>(publication, Arc::new(JsonMessageMapper::<R>::new()))
    }

    /// Register or replace the mapper for `R`.
    pub fn register<R: Request>(&mut self, publication: Publication, mapper: Arc<dyn MessageMapper<R>>) {
        self.mappers.insert(
            TypeId::of::<R>(),
            Box::new(MapperRegistration { publication, mapper }),
        );
    }

    pub fn contains<R: Request>(&self) -> bool {
        self.mappers.contains_key(&TypeId::of::<R>())
    }

    pub fn publication<R: Request>(&self) -> Result<&Publication> {
        Ok(&self.registration::<R>()?.publication)
    }

    /// Map `request` to the message it is posted as.
    pub fn wrap<R: Request>(&self, request: &R) -> Result<Message> {
        let registration = self.registration::<R>()?;
        registration
            .mapper
            .wrap(request, &registration.publication)
            .map_err(PostboxError::Mapping)
    }

    /// Map a message back to the request it was posted from.
    pub fn unwrap<R: Request>(&self, message: &Message) -> Result<R> {
        self.registration::<R>()?
            .mapper
            .unwrap(message)
            .map_err(PostboxError::Mapping)
    }

    fn registration<R: Request>(&self) -> Result<&MapperRegistration<R>> {
        self.mappers
            .get(&TypeId::of::<R>())
            .and_then(|boxed| boxed.downcast_ref::<MapperRegistration<R>>())
            .ok_or_else(|| {
                ConfigurationError::MissingMapper {
                    request_type: R::request_type(),
                }
                .into()
            })
    }
}

impl std::fmt::Debug for MapperRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapperRegistry")
            .field("registered", &self.mappers.len())
            .finish()
    }
}
