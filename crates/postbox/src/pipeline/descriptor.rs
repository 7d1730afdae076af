//! Declarative descriptions of chain links.
//!
//! A handler lists its decorators as [`DecoratorDescriptor`]s. Each names a
//! link type, says whether it runs before or after the handler, gives its
//! position within that group (`step`, ascending) and carries the
//! parameters the link is constructed with. Descriptors are plain data and
//! can be loaded from configuration as well as written in code.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ConfigurationError;
use crate::inbox::OnceOnlyAction;

/// Link types the handler factory provides without registration.
pub mod link_types {
    pub const INBOX: &str = "postbox.inbox";
    pub const LOGGING: &str = "postbox.logging";
    pub const POLICY: &str = "postbox.policy";
    pub const TIMEOUT: &str = "postbox.timeout";
    /// Marker: no node, only suppresses the global inbox.
    pub const NO_GLOBAL_INBOX: &str = "postbox.no_global_inbox";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerTiming {
    Before,
    After,
}

/// One link of a handler's chain, described as data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoratorDescriptor {
    /// Ordering key within the timing group. Ties keep declaration order.
    pub step: i32,
    pub timing: HandlerTiming,
    pub link_type: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl DecoratorDescriptor {
    pub fn new(step: i32, timing: HandlerTiming, link_type: impl Into<String>) -> Self {
        Self {
            step,
            timing,
            link_type: link_type.into(),
            params: Vec::new(),
        }
    }

    pub fn before(step: i32, link_type: impl Into<String>) -> Self {
        Self::new(step, HandlerTiming::Before, link_type)
    }

    pub fn after(step: i32, link_type: impl Into<String>) -> Self {
        Self::new(step, HandlerTiming::After, link_type)
    }

    /// Append one constructor parameter.
    pub fn with_param(mut self, param: impl Into<Value>) -> Self {
        self.params.push(param.into());
        self
    }

    /// An inbox node recording the request under `context_key`.
    pub fn use_inbox(
        step: i32,
        context_key: impl Into<String>,
        once_only: bool,
        action: OnceOnlyAction,
    ) -> Self {
        Self::before(step, link_types::INBOX)
            .with_param(once_only)
            .with_param(context_key.into())
            .with_param(json!(action))
    }

    /// Give inbox records written by this node a time-to-live.
    pub fn with_expire_after(self, ttl: Duration) -> Self {
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self.with_param(millis)
    }

    pub fn logging(step: i32, timing: HandlerTiming) -> Self {
        Self::new(step, timing, link_types::LOGGING).with_param(json!(timing))
    }

    /// Run the rest of the chain under the named retry policy.
    pub fn use_policy(step: i32, policy: impl Into<String>) -> Self {
        Self::before(step, link_types::POLICY).with_param(policy.into())
    }

    /// Bound the rest of the chain. Only valid in async pipelines.
    pub fn timeout(step: i32, limit: Duration) -> Self {
        let millis = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
        Self::before(step, link_types::TIMEOUT).with_param(millis)
    }

    /// Opt this handler out of the global inbox.
    pub fn no_global_inbox() -> Self {
        Self::before(0, link_types::NO_GLOBAL_INBOX)
    }

    pub fn is_inbox(&self) -> bool {
        self.link_type == link_types::INBOX
    }

    /// Markers configure the builder and produce no node.
    pub fn is_marker(&self) -> bool {
        self.link_type == link_types::NO_GLOBAL_INBOX
    }

    pub fn params(&self) -> LinkParams<'_> {
        LinkParams {
            link_type: &self.link_type,
            values: &self.params,
        }
    }
}

/// Typed, positional access to a descriptor's parameters.
///
/// Every accessor reports a missing or mistyped value as
/// [`ConfigurationError::InvalidLinkParams`], so link constructors can use `?`.
#[derive(Debug, Clone, Copy)]
pub struct LinkParams<'a> {
    link_type: &'a str,
    values: &'a [Value],
}

impl<'a> LinkParams<'a> {
    pub fn new(link_type: &'a str, values: &'a [Value]) -> Self {
        Self { link_type, values }
    }

    pub fn link_type(&self) -> &'a str {
        self.link_type
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn raw(&self, index: usize) -> Option<&'a Value> {
        self.values.get(index)
    }

    /// Deserialize the parameter at `index`.
    pub fn get<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T, ConfigurationError> {
        let value = self
            .values
            .get(index)
            .ok_or_else(|| self.invalid(format!("missing parameter {index} ({name})")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| self.invalid(format!("parameter {index} ({name}): {e}")))
    }

    /// Like [`get`](Self::get), but a missing or null parameter is `None`.
    pub fn optional<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
    ) -> Result<Option<T>, ConfigurationError> {
        match self.values.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.get(index, name).map(Some),
        }
    }

    pub fn invalid(&self, reason: impl Into<String>) -> ConfigurationError {
        ConfigurationError::InvalidLinkParams {
            link_type: self.link_type.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_use_inbox_params() {
        let descriptor = DecoratorDescriptor::use_inbox(1, "ctx", true, OnceOnlyAction::Throw);
        assert_eq!(descriptor.timing, HandlerTiming::Before);
        assert!(descriptor.is_inbox());
        assert_eq!(descriptor.params, vec![json!(true), json!("ctx"), json!("throw")]);

        let with_ttl = descriptor.with_expire_after(Duration::from_secs(2));
        assert_eq!(with_ttl.params[3], json!(2000));
    }

    #[test]
    fn test_typed_param_access() {
        let descriptor = DecoratorDescriptor::use_inbox(1, "ctx", false, OnceOnlyAction::Warn);
        let params = descriptor.params();

        let once_only: bool = params.get(0, "once_only").unwrap();
        let context: String = params.get(1, "context_key").unwrap();
        let action: OnceOnlyAction = params.get(2, "action").unwrap();
        let ttl: Option<u64> = params.optional(3, "expire_after").unwrap();

        assert!(!once_only);
        assert_eq!(context, "ctx");
        assert_eq!(action, OnceOnlyAction::Warn);
        assert_eq!(ttl, None);
    }

    #[test]
    fn test_missing_param_is_configuration_error() {
        let descriptor = DecoratorDescriptor::before(1, link_types::POLICY);
        let err = descriptor.params().get::<String>(0, "policy").unwrap_err();
        match err {
            ConfigurationError::InvalidLinkParams { link_type, reason } => {
                assert_eq!(link_type, link_types::POLICY);
                assert!(reason.contains("policy"));
            }
            other => panic!("Expected InvalidLinkParams, got {other:?}"),
        }
    }

    #[test]
    fn test_mistyped_param_is_configuration_error() {
        let descriptor = DecoratorDescriptor::before(1, "custom").with_param("not a number");
        assert!(descriptor.params().get::<u64>(0, "millis").is_err());
    }

    #[test]
    fn test_descriptor_from_config() {
        let descriptor: DecoratorDescriptor = serde_json::from_value(json!({
            "step": 2,
            "timing": "after",
            "link_type": "postbox.logging"
        }))
        .unwrap();
        assert_eq!(descriptor.timing, HandlerTiming::After);
        assert!(descriptor.params.is_empty());
    }

    #[test]
    fn test_marker() {
        assert!(DecoratorDescriptor::no_global_inbox().is_marker());
        assert!(!DecoratorDescriptor::logging(0, HandlerTiming::Before).is_marker());
    }
}
