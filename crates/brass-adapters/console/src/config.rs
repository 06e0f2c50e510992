//! Configuration for the console adapter.
//!
//! ```toml
//! [adapters.console]
//! conversation = "console"
//! user = "operator"
//! reply_prefix = "bot> "
//! ```

use serde::{Deserialize, Serialize};

/// Console adapter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Conversation id attached to every line read.
    pub conversation: String,

    /// Sender id reported in the event payload.
    pub user: String,

    /// Written before every outgoing message.
    pub reply_prefix: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            conversation: "console".into(),
            user: "user".into(),
            reply_prefix: String::new(),
        }
    }
}
