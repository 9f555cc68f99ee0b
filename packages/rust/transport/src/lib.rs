//! Outbound call plumbing: the Retrier and HTTP response classification.
//!
//! No other crate implements its own retry loop; every provider call is run
//! through [`Retrier::execute`] or [`Retrier::execute_authenticated`].

pub mod http;
pub mod retry;

pub use http::{USER_AGENT, build_client, check_response, classify_send_error, read_json};
pub use retry::{CallState, Retrier, RetryPolicy, TokenSource};
