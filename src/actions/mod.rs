//! The `do(...)` / `finish(...)` action language and its ADB execution.

mod handler;
mod parser;

pub use handler::{to_absolute, ActionHandler, ActionResult, HandlerError, RELATIVE_SCALE};
pub use parser::{parse_action, Action, ActionError, RelativePoint};
