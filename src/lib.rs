pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod rate_limit;
pub mod rbac;
pub mod server;
pub mod state;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use error::{AuthError, StateError};
pub use types::{AuthFlowState, AuthResult, EventMessage, OAuthTokenSet, UserSession, WidgetRecord};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
