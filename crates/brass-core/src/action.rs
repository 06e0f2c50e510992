//! Outbound actions.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ApiError, ApiResult};

/// A protocol-neutral outbound request handed to an adapter's `call_api`.
///
/// Actions are a name plus a JSON object of parameters. Adapters decide which
/// names they support and reply with [`ApiError::UnsupportedAction`] for the
/// rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Action name, e.g. `send_message`.
    pub name: String,
    /// Action parameters.
    #[serde(default)]
    pub params: Value,
}

impl Action {
    /// Action name used by [`OutboundCaller::send_message`](crate::OutboundCaller::send_message).
    ///
    /// Parameters: `conversation_id` (string) and `message` (string).
    pub const SEND_MESSAGE: &'static str = "send_message";

    /// Creates an action with an empty parameter object.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Value::Object(Map::new()),
        }
    }

    /// Creates an action from any serializable parameter value.
    pub fn with_params<P: Serialize>(name: impl Into<String>, params: P) -> ApiResult<Self> {
        Ok(Self {
            name: name.into(),
            params: serde_json::to_value(params)?,
        })
    }

    /// Adds one parameter. Non-object parameter values are replaced by an object.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if !self.params.is_object() {
            self.params = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut self.params {
            map.insert(key.into(), value.into());
        }
        self
    }

    /// Reads a string parameter, failing with [`ApiError::InvalidParams`].
    pub fn str_param(&self, key: &str) -> ApiResult<&str> {
        self.params
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::InvalidParams {
                action: self.name.clone(),
                reason: format!("missing string parameter '{key}'"),
            })
    }

    /// Deserializes the parameters into `T`.
    pub fn params_as<T: DeserializeOwned>(&self) -> ApiResult<T> {
        T::deserialize(&self.params).map_err(|e| ApiError::InvalidParams {
            action: self.name.clone(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_param_builder() {
        let action = Action::new(Action::SEND_MESSAGE)
            .param("conversation_id", "group:1")
            .param("message", "hi");

        assert_eq!(action.str_param("message").unwrap(), "hi");
        assert_eq!(
            action.params,
            json!({"conversation_id": "group:1", "message": "hi"})
        );
    }

    #[test]
    fn test_missing_param() {
        let action = Action::new("kick");
        let err = action.str_param("user_id").unwrap_err();
        assert!(matches!(err, ApiError::InvalidParams { action, .. } if action == "kick"));
    }

    #[test]
    fn test_params_as() {
        #[derive(Deserialize)]
        struct Kick {
            user_id: u64,
        }

        let action = Action::with_params("kick", json!({"user_id": 7})).unwrap();
        let kick: Kick = action.params_as().unwrap();
        assert_eq!(kick.user_id, 7);
    }
}
