//! Macros for reducing request boilerplate.

/// Implement [`Request`](crate::Request) for structs that carry their identifier
/// in a field of type [`RequestId`](crate::RequestId).
///
/// The field defaults to `id`; name another one as the second argument.
///
/// # Example
///
/// ```ignore
/// use postbox_core::{request, RequestId};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct SendEmailCommand {
///     id: RequestId,
///     template: String,
/// }
///
/// request!(SendEmailCommand);
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct OrderShipped {
///     event_id: RequestId,
///     tracking_number: String,
/// }
///
/// request!(OrderShipped, event_id);
/// ```
#[macro_export]
macro_rules! request {
    ($ty:ty) => {
        $crate::request!($ty, id);
    };
    ($ty:ty, $field:ident) => {
        impl $crate::Request for $ty {
            fn id(&self) -> &$crate::RequestId {
                &self.$field
            }
        }
    };
}
