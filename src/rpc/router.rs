//! Route table of the RPC server.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde_json::Value;

use super::frame::ErrorCode;
use crate::error::{AppError, AppResult};
use crate::models::{GreetingRequest, Principal};
use crate::services::GreetingService;
use crate::validation::validate_greeting_name;

/// Route of the unbounded greeting stream.
pub const GREETINGS_ROUTE: &str = "greetings";

/// Route answering with a single greeting.
pub const GREETING_ONCE_ROUTE: &str = "greetings.once";

/// Values a route handler produces, already serialized.
pub type ResponseStream = BoxStream<'static, AppResult<Value>>;

/// What a route handler gets to work with.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    /// The request's `data`, `Value::Null` when absent
    pub data: Value,
    /// The authenticated caller, if any
    pub principal: Option<Principal>,
}

type RouteHandler = Arc<dyn Fn(RouteRequest) -> AppResult<ResponseStream> + Send + Sync>;

/// Maps route names to handlers.
#[derive(Clone, Default)]
pub struct MessageRouter {
    routes: HashMap<String, RouteHandler>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any earlier handler.
    pub fn route<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(RouteRequest) -> AppResult<ResponseStream> + Send + Sync + 'static,
    {
        self.routes.insert(name.to_string(), Arc::new(handler));
        self
    }

    /// Start the handler for `route`.
    ///
    /// The error carries the code to report to the requester.
    pub fn dispatch(
        &self,
        route: &str,
        request: RouteRequest,
    ) -> Result<ResponseStream, (ErrorCode, String)> {
        let handler = self
            .routes
            .get(route)
            .ok_or_else(|| (ErrorCode::InvalidRoute, format!("no handler for route '{route}'")))?;

        handler(request).map_err(|e| match e {
            AppError::BadRequest(msg) => (ErrorCode::InvalidData, msg),
            AppError::SerializationError(e) => (ErrorCode::InvalidData, e.to_string()),
            other => (ErrorCode::ApplicationError, other.to_string()),
        })
    }

    pub fn has_route(&self, route: &str) -> bool {
        self.routes.contains_key(route)
    }
}

/// Routes served by the reservation service.
pub fn greeting_routes(greetings: GreetingService) -> MessageRouter {
    let once = greetings.clone();

    MessageRouter::new()
        .route(GREETINGS_ROUTE, move |request| {
            let request = greeting_request(request)?;
            Ok(serialize_each(greetings.greet(request)))
        })
        .route(GREETING_ONCE_ROUTE, move |request| {
            let request = greeting_request(request)?;
            Ok(serialize_each(once.greet(request).take(1)))
        })
}

/// Work out who to greet.
///
/// Accepts `{"name": "Jane"}` or a bare `"Jane"`. Without a name, the
/// authenticated caller is greeted.
pub fn greeting_request(request: RouteRequest) -> AppResult<GreetingRequest> {
    let name = match request.data {
        Value::Null => None,
        Value::String(name) => Some(name),
        Value::Object(_) => {
            let parsed: PartialGreeting = serde_json::from_value(request.data)?;
            parsed.name
        }
        other => {
            return Err(AppError::BadRequest(format!(
                "expected a greeting request, got {other}"
            )));
        }
    };

    let name = match name.filter(|n| !n.is_empty()) {
        Some(name) => name,
        None => match request.principal {
            Some(principal) => principal.username,
            None => {
                return Err(AppError::BadRequest(
                    "a name is required when not authenticated".to_string(),
                ));
            }
        },
    };

    validate_greeting_name(&name)?;
    Ok(GreetingRequest::new(name))
}

#[derive(serde::Deserialize)]
struct PartialGreeting {
    #[serde(default)]
    name: Option<String>,
}

fn serialize_each<S, T>(stream: S) -> ResponseStream
where
    S: futures_util::Stream<Item = T> + Send + 'static,
    T: serde::Serialize,
{
    stream
        .map(|item| serde_json::to_value(item).map_err(AppError::from))
        .boxed()
}
