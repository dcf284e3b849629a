//! Static configuration: app packages and system prompts.

mod apps;
mod prompts;

pub use apps::{find_app_in, get_package, APP_PACKAGES};
pub use prompts::{get_system_prompt, SYSTEM_PROMPT_EN, SYSTEM_PROMPT_ZH};
