/*!
 * Prelude module for zigdrive core.
 *
 * Re-exports the types most device code needs in one import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{Id, Value};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder, HostConfig, ZoneConfig};

// Re-export utility functions
pub use crate::utils::{spawn_delayed, with_timeout};

// Re-export logging helpers
pub use crate::logging::{component_span, operation_span};
pub use tracing::{debug, error, info, trace, warn};
