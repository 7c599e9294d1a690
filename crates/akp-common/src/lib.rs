//! Common kernels for akp: errors, call context, RPC classification, retry,
//! status waits, keyed locks, diagnostics and YAML helpers

#![deny(missing_docs)]

pub mod context;
pub mod diagnostics;
pub mod error;
pub mod keyed_mutex;
pub mod retry;
pub mod rpc;
pub mod telemetry;
pub mod wait;
pub mod yaml;

pub use context::CallContext;
pub use diagnostics::{DiagContext, Diagnostic, Diagnostics, Severity};
pub use error::Error;
pub use keyed_mutex::KeyedMutex;
pub use retry::{retry_rpc, RetryConfig};
pub use rpc::{RpcCode, RpcError};
pub use wait::{wait_for_status, WaitConfig};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default platform endpoint
pub const DEFAULT_SERVER_URL: &str = "https://akuity.cloud";

/// Environment variable overriding the platform endpoint
pub const ENV_SERVER_URL: &str = "AKUITY_SERVER_URL";

/// Environment variable holding the API key id
pub const ENV_API_KEY_ID: &str = "AKUITY_API_KEY_ID";

/// Environment variable holding the API key secret
pub const ENV_API_KEY_SECRET: &str = "AKUITY_API_KEY_SECRET";
