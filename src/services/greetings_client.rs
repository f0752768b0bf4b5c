use tracing::instrument;

use crate::error::AppResult;
use crate::models::{Credentials, GreetingRequest, GreetingResponse};
use crate::rpc::{GREETING_ONCE_ROUTE, GREETINGS_ROUTE, RpcRequester, RpcStream};

/// Greetings over the RPC channel, as consumed by the edge.
#[derive(Clone)]
pub struct GreetingsClient {
    requester: RpcRequester,
    credentials: Option<Credentials>,
}

impl GreetingsClient {
    /// `credentials` go out as metadata on every request.
    pub fn new(requester: RpcRequester, credentials: Option<Credentials>) -> Self {
        Self {
            requester,
            credentials,
        }
    }

    pub fn requester(&self) -> &RpcRequester {
        &self.requester
    }

    /// Open an unbounded greeting stream. Dropping it cancels it upstream.
    #[instrument(skip(self), fields(name = %request.name))]
    pub async fn greet(&self, request: GreetingRequest) -> AppResult<RpcStream<GreetingResponse>> {
        self.requester
            .route(GREETINGS_ROUTE)
            .metadata(self.credentials.clone())
            .data(&request)
            .retrieve_stream()
            .await
    }

    /// A single greeting.
    #[instrument(skip(self), fields(name = %request.name))]
    pub async fn greet_once(&self, request: GreetingRequest) -> AppResult<GreetingResponse> {
        self.requester
            .route(GREETING_ONCE_ROUTE)
            .metadata(self.credentials.clone())
            .data(&request)
            .retrieve_one()
            .await
    }
}
