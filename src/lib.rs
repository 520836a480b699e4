//! chanrpc - In-process mailbox RPC between single-threaded modules, on top of Tokio.

pub mod error;
pub mod message;
pub mod module;
pub mod rpc;
pub mod runtime;

// Re-export core types for user convenience
pub use error::{CallResult, RpcError};
pub use message::{Args, Call, CallId, Reply, Value};
pub use module::{CommandInfo, Module, ModuleConfig, ModuleContext, ModuleHandle};
pub use rpc::{call_once, Client, Server, ServerRef, Submission};
pub use runtime::{CronExpr, Timer};

// --- Top-Level Functions ---

const VERSION_MAJOR: i32 = 0;
const VERSION_MINOR: i32 = 1;
const VERSION_PATCH: i32 = 0;

/// Returns the library version as a tuple (major, minor, patch).
pub fn version() -> (i32, i32, i32) {
  (VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
}
