//! GraphQL sink.
//!
//! Jobs that import third-party data push it to the site's GraphQL API as
//! mutations. A response carrying an `errors` array counts as a failure even
//! when the HTTP status is 200.

use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::JobError;

/// Default GraphQL endpoint.
pub const DEFAULT_GRAPHQL_ENDPOINT: &str = "https://graphql.natwelch.com/graphql";

#[derive(Debug, Serialize)]
struct GraphQlRequest<'a> {
    query: &'a str,
    variables: &'a Value,
}

/// Authenticated client for the GraphQL API.
pub struct GraphQlClient {
    http_client: Client,
    endpoint: String,
    token: String,
}

impl GraphQlClient {
    /// Create a client sending `token` as a bearer token.
    pub fn new(http_client: Client, endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http_client,
            endpoint: endpoint.into(),
            token: token.into(),
        }
    }

    /// Runs one mutation and returns its `data` member.
    ///
    /// # Errors
    ///
    /// - `JobError::Http` if the request cannot be sent
    /// - `JobError::Api` for non-success statuses
    /// - `JobError::GraphQl` if the response lists errors
    pub async fn mutate(&self, query: &str, variables: Value) -> Result<Value, JobError> {
        let response = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&GraphQlRequest {
                query,
                variables: &variables,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(JobError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| JobError::Parse(format!("Failed to parse GraphQL response: {}", e)))?;

        let data = response_data(body)?;
        debug!(endpoint = %self.endpoint, "GraphQL mutation applied");
        Ok(data)
    }
}

/// Splits a GraphQL response into its data or an error.
fn response_data(mut body: Value) -> Result<Value, JobError> {
    if let Some(errors) = body.get("errors").and_then(Value::as_array) {
        if !errors.is_empty() {
            let messages: Vec<&str> = errors
                .iter()
                .map(|e| e.get("message").and_then(Value::as_str).unwrap_or("unknown error"))
                .collect();
            return Err(JobError::GraphQl(messages.join("; ")));
        }
    }

    Ok(body.get_mut("data").map(Value::take).unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_data() {
        let data = response_data(json!({ "data": { "upsertLink": { "id": "1" } } }))
            .expect("no errors");
        assert_eq!(data, json!({ "upsertLink": { "id": "1" } }));
    }

    #[test]
    fn test_response_errors_are_failures() {
        let err = response_data(json!({
            "data": null,
            "errors": [{ "message": "unauthorized" }, { "message": "bad input" }]
        }))
        .unwrap_err();

        assert!(matches!(err, JobError::GraphQl(ref m) if m == "unauthorized; bad input"));
    }

    #[test]
    fn test_empty_errors_array_is_success() {
        assert!(response_data(json!({ "data": {}, "errors": [] })).is_ok());
    }

    #[test]
    fn test_request_shape() {
        let variables = json!({ "input": { "uri": "https://example.com" } });
        let body = serde_json::to_value(GraphQlRequest {
            query: "mutation { x }",
            variables: &variables,
        })
        .expect("serializes");

        assert_eq!(body["query"], "mutation { x }");
        assert_eq!(body["variables"]["input"]["uri"], "https://example.com");
    }
}
