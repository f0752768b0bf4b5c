use serde::{Deserialize, Serialize};

/// Who to greet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetingRequest {
    pub name: String,
}

impl GreetingRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// One element of a greeting stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetingResponse {
    /// e.g. `Hello Jane @ 2024-01-15T10:30:00.123Z!`
    pub message: String,
}
