//! Transport-neutral request and response values.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

/// Request method.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    /// Read
    Get,
    /// Create or trigger
    Post,
    /// Modify
    Put,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
        };
        f.write_str(name)
    }
}

/// An incoming request: query parameters plus an optional body.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApiRequest {
    /// Query string parameters
    pub params: BTreeMap<String, String>,
    /// Raw request body
    pub body: Option<Vec<u8>>,
}

impl ApiRequest {
    /// Creates an empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a query parameter.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Sets a JSON body.
    pub fn json(mut self, body: &Value) -> Self {
        self.body = Some(body.to_string().into_bytes());
        self
    }

    /// Sets a raw body.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Looks up a query parameter.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// JSON content type.
pub const CONTENT_JSON: &str = "application/json";
/// CSV content type.
pub const CONTENT_CSV: &str = "text/csv";

/// An outgoing response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiResponse {
    /// Status code
    pub status: u16,
    /// Body media type
    pub content_type: String,
    /// Suggested download name for attachments
    pub attachment: Option<String>,
    /// Response body
    pub body: String,
}

impl ApiResponse {
    /// JSON response.
    pub fn json(status: u16, body: &Value) -> Self {
        Self {
            status,
            content_type: CONTENT_JSON.to_string(),
            attachment: None,
            body: body.to_string(),
        }
    }

    /// `{"message": ...}` response.
    pub fn message(status: u16, message: impl Into<String>) -> Self {
        Self::json(status, &serde_json::json!({ "message": message.into() }))
    }

    /// CSV attachment.
    pub fn csv(body: String, filename: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: CONTENT_CSV.to_string(),
            attachment: Some(filename.into()),
            body,
        }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parses the body as JSON.
    pub fn json_body(&self) -> serde_json::Result<Value> {
        serde_json::from_str(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = ApiRequest::new().param("short_name", "MOD09").param("version", "6.1");
        assert_eq!(request.get("short_name"), Some("MOD09"));
        assert_eq!(request.get("tolerance"), None);
        assert!(request.body.is_none());
    }

    #[test]
    fn test_message_response() {
        let response = ApiResponse::message(404, "gone");
        assert_eq!(response.content_type, CONTENT_JSON);
        assert!(!response.is_success());
        assert_eq!(response.json_body().unwrap()["message"], "gone");
    }
}
