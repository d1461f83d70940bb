//! Retry policy: the caller-supplied response validator.
//!
//! A validator is consulted after every completed attempt that did not end in
//! a data timeout. It can accept the response, ask for another attempt, or
//! abort with its own failure. `MAX_TRIES` caps attempts regardless of what
//! the validator answers.

use crate::http::Response;

/// Hard ceiling on attempts per logical request.
pub const MAX_TRIES: u32 = 5;

/// Answer of a validator for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Retry,
    /// Stop retrying and fail the call with this reason.
    Abort(String),
}

/// Decides whether a completed attempt is good enough.
///
/// `attempt` is 1-based. Validators run inside the multiplexer's completion
/// loop and must not call back into the multiplexer.
pub trait Validator {
    fn validate(&self, response: &Response, attempt: u32) -> Verdict;
}

impl<F> Validator for F
where
    F: Fn(&Response, u32) -> Verdict,
{
    fn validate(&self, response: &Response, attempt: u32) -> Verdict {
        self(response, attempt)
    }
}

/// What the validator concluded about a terminal response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// No validator configured, or the attempt ended in a data timeout.
    Unchecked,
    Accepted,
    /// The validator still wanted a retry when the attempt ceiling was hit.
    Exhausted,
    Aborted(String),
}

/// Retries attempts that came back without a body or with a 5xx status.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryOnFailure;

impl Validator for RetryOnFailure {
    fn validate(&self, response: &Response, _attempt: u32) -> Verdict {
        match response.status_code() {
            _ if response.is_empty() => Verdict::Retry,
            Some(code) if code >= 500 => Verdict::Retry,
            _ => Verdict::Accept,
        }
    }
}
