//! Service configuration.
//!
//! All settings are read once at startup from an optional `config` file and
//! `OPTICIA__SECTION__KEY` environment variables. Policy constants (timeouts,
//! handoff budgets, directive delays) live here rather than in code.

mod loader;
mod static_config;

pub use loader::load_config;
pub use static_config::{HandoffPolicy, ServiceConfig, SessionPolicy, UpstreamConfig};
