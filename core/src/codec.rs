//! Protocol codecs: turn call arguments into a request body and a response
//! body back into a result.
//!
//! The multiplexer never looks inside payloads. A `Client` asks its codec to
//! encode when a call is submitted and to decode once the terminal response
//! has been collected, so encoding without sending (`Client::prepare`) and
//! decoding a payload obtained elsewhere (`Client::decode`) are ordinary calls.

use std::fmt;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::{Call, Reply};

/// Serialized outbound payload plus what the transport needs to send it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub body: Vec<u8>,
    /// Appended to the client's location when set.
    pub path: Option<String>,
    pub content_type: String,
    /// Protocol headers, sent before the client's configured extras.
    pub headers: Vec<(String, String)>,
}

/// Encodes calls and decodes their replies for one wire protocol.
pub trait Codec {
    type Args: fmt::Debug;
    type Output;

    fn encode(&self, args: &Self::Args) -> Result<Envelope>;

    fn decode(&self, body: &[u8], args: &Self::Args) -> Result<Self::Output>;
}

/// JSON RPC: `{"method", "params"}` out, `{"result"}` or `{"error"}` back.
/// The method name also travels in the `X-Rpc-Method` header.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

pub const METHOD_HEADER: &str = "X-Rpc-Method";

impl Codec for JsonCodec {
    type Args = Call;
    type Output = Value;

    fn encode(&self, call: &Call) -> Result<Envelope> {
        if call.method.is_empty() {
            return Err(Error::encode("method name is empty"));
        }
        Ok(Envelope {
            body: serde_json::to_vec(call)?,
            path: None,
            content_type: "application/json".to_string(),
            headers: vec![(METHOD_HEADER.to_string(), call.method.clone())],
        })
    }

    fn decode(&self, body: &[u8], call: &Call) -> Result<Value> {
        let reply: Reply = serde_json::from_slice(body)
            .map_err(|e| Error::decode(format!("{} reply is not a valid envelope: {e}", call.method)))?;
        match reply {
            Reply { error: Some(fault), .. } => Err(Error::Remote {
                code: fault.code,
                message: fault.message,
            }),
            Reply { result: Some(result), .. } => Ok(result),
            Reply { result: None, .. } => Ok(Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn encode_produces_json_envelope() {
        let call = Call::new("echo", json!({"id": 1}));
        let envelope = JsonCodec.encode(&call).unwrap();
        let body: Value = serde_json::from_slice(&envelope.body).unwrap();
        assert_eq!(body, json!({"method": "echo", "params": {"id": 1}}));
        assert_eq!(envelope.content_type, "application/json");
        assert_eq!(envelope.headers, vec![(METHOD_HEADER.to_string(), "echo".to_string())]);
    }

    #[test]
    fn encode_rejects_empty_method() {
        let err = JsonCodec.encode(&Call::new("", Value::Null)).unwrap_err();
        assert!(matches!(err, Error::Encode(_)));
    }

    #[test]
    fn decode_returns_result() {
        let call = Call::new("echo", Value::Null);
        let value = JsonCodec.decode(br#"{"result": {"message": "hi"}}"#, &call).unwrap();
        assert_eq!(value, json!({"message": "hi"}));
    }

    #[test]
    fn decode_maps_fault_to_remote_error() {
        let call = Call::new("fail", Value::Null);
        let err = JsonCodec
            .decode(br#"{"error": {"code": 42, "message": "boom"}}"#, &call)
            .unwrap_err();
        assert!(matches!(err, Error::Remote { code: 42, ref message } if message == "boom"));
    }

    #[test]
    fn decode_rejects_garbage() {
        let call = Call::new("echo", Value::Null);
        let err = JsonCodec.decode(b"<html>", &call).unwrap_err();
        assert!(matches!(err, Error::Decode(ref m) if m.starts_with("echo reply")));
    }
}
