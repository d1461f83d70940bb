//! Wire DTOs of the JSON RPC envelope spoken by `JsonCodec`.
//!
//! # Design
//! These mirror the mock-server's schema but are defined independently;
//! integration tests catch any drift between the two crates.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One remote call: a method name and its parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Call {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Call {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Protocol-level error returned in place of a result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fault {
    pub code: i64,
    pub message: String,
}

/// Reply envelope: exactly one of `result` or `error` is expected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Fault>,
}
