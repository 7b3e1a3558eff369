//! Request validation gates applied before a command reaches the internal bus.

use std::collections::BTreeMap;

use cmdbridge_types::{BridgeError, Method};
use serde_json::Value;

/// Query parameter asking the device service to publish the reading as an event.
pub const PUSH_EVENT: &str = "ds-pushevent";
/// Query parameter asking the device service to return the reading.
pub const RETURN_EVENT: &str = "ds-returnevent";

const VALUE_TRUE: &str = "true";
const VALUE_FALSE: &str = "false";

/// Accept exactly the case-insensitive strings `get` and `set`.
pub fn validate_method(method: &str) -> Result<Method, BridgeError> {
    method.parse()
}

/// Check the query parameters of a `get` request: a flat mapping of
/// non-empty names to string values.
///
/// `set` requests carry their values in the payload, which the device service
/// validates, so they pass unconditionally.
pub fn validate_query_params(
    method: Method,
    params: &BTreeMap<String, Value>,
) -> Result<(), BridgeError> {
    if method == Method::Set {
        return Ok(());
    }
    for (name, value) in params {
        if name.trim().is_empty() {
            return Err(BridgeError::Validation(
                "invalid query parameter: empty parameter name".to_string(),
            ));
        }
        let Some(value) = value.as_str() else {
            return Err(BridgeError::Validation(format!(
                "invalid query parameter {name}: expected a string value, got {value}"
            )));
        };
        if (name == PUSH_EVENT || name == RETURN_EVENT) && value != VALUE_TRUE && value != VALUE_FALSE {
            return Err(BridgeError::Validation(format!(
                "invalid query parameter, {name} has to be '{VALUE_TRUE}' or '{VALUE_FALSE}', got '{value}'"
            )));
        }
    }
    Ok(())
}
