//! Pinboard bookmark import.

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::error::JobError;

use super::graphql::GraphQlClient;

/// Pinboard API base URL.
const PINBOARD_API_BASE: &str = "https://api.pinboard.in/v1";

/// Number of recent bookmarks requested per run; the API maximum.
const RECENT_COUNT: u32 = 100;

const UPSERT_LINK: &str = r#"mutation SaveLink($input: NewLink!) {
  upsertLink(input: $input) {
    id
  }
}"#;

/// A bookmark as returned by `posts/recent`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Pin {
    pub href: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub extended: String,
    #[serde(default)]
    pub hash: String,
    pub time: DateTime<Utc>,
    /// Space separated.
    #[serde(default)]
    pub tags: String,
}

impl Pin {
    /// Input object for the `upsertLink` mutation.
    pub fn to_link_input(&self) -> Value {
        json!({
            "title": self.description,
            "uri": self.href,
            "description": self.extended,
            "tags": self.tags.split_whitespace().collect::<Vec<_>>(),
            "created": self.time.to_rfc3339(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RecentPosts {
    #[serde(default)]
    posts: Vec<Pin>,
}

/// Copies recent bookmarks into the GraphQL sink.
pub struct Pinboard {
    http_client: Client,
    token: String,
    graphql: GraphQlClient,
}

impl Pinboard {
    /// Create an importer using the `user:hex` API token.
    pub fn new(http_client: Client, token: impl Into<String>, graphql: GraphQlClient) -> Self {
        Self {
            http_client,
            token: token.into(),
            graphql,
        }
    }

    /// Fetches recent bookmarks.
    pub async fn recent_pins(&self) -> Result<Vec<Pin>, JobError> {
        let url = format!(
            "{}/posts/recent?auth_token={}&format=json&count={}",
            PINBOARD_API_BASE,
            urlencoding::encode(&self.token),
            RECENT_COUNT
        );

        let response = self.http_client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(JobError::Api {
                code: status.as_u16(),
                message: "Pinboard request failed".to_string(),
            });
        }

        let body = response.text().await?;
        parse_recent(&body)
    }

    /// Upserts every recent bookmark. Returns how many were saved.
    pub async fn update_pins(&self) -> Result<usize, JobError> {
        let pins = self.recent_pins().await?;

        for pin in &pins {
            self.graphql
                .mutate(UPSERT_LINK, json!({ "input": pin.to_link_input() }))
                .await?;
        }

        info!(count = pins.len(), "Saved pins");
        Ok(pins.len())
    }
}

fn parse_recent(body: &str) -> Result<Vec<Pin>, JobError> {
    let recent: RecentPosts = serde_json::from_str(body)
        .map_err(|e| JobError::Parse(format!("Failed to parse recent posts: {}", e)))?;
    Ok(recent.posts)
}
