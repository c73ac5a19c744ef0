//! Tweet import.
//!
//! Reads timelines from the Twitter v1.1 REST API, signing each request with
//! OAuth 1.0a (HMAC-SHA1), and caches the posts in the GraphQL sink.

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::seq::SliceRandom;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{json, Value};
use sha1::Sha1;
use tracing::info;

use crate::error::JobError;
use crate::scheduler::job::{Credential, Credentials};

use super::graphql::GraphQlClient;

/// Twitter REST API base URL.
const TWITTER_API_BASE: &str = "https://api.twitter.com/1.1";

/// Timestamp format of `created_at`, e.g. `Wed Oct 10 20:19:24 +0000 2018`.
const TWITTER_TIME_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

const UPSERT_TWEET: &str = r#"mutation SaveTweet($input: NewTweet!) {
  upsertTweet(input: $input) {
    id
  }
}"#;

/// OAuth 1.0a credentials for one user.
#[derive(Clone)]
pub struct TwitterAuth {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub access_token: String,
    pub access_secret: String,
}

impl fmt::Debug for TwitterAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwitterAuth")
            .field("consumer_key", &self.consumer_key)
            .finish_non_exhaustive()
    }
}

impl TwitterAuth {
    /// Reads the four OAuth credentials.
    pub fn from_credentials(credentials: &Credentials) -> Result<Self, JobError> {
        Ok(Self {
            consumer_key: credentials.require(Credential::TwitterConsumerKey)?.to_string(),
            consumer_secret: credentials
                .require(Credential::TwitterConsumerSecret)?
                .to_string(),
            access_token: credentials.require(Credential::TwitterAccessToken)?.to_string(),
            access_secret: credentials.require(Credential::TwitterAccessSecret)?.to_string(),
        })
    }

    /// Builds the `Authorization` header for a request.
    ///
    /// `params` are the query (or form) parameters of the request; they take
    /// part in the signature but not in the header.
    pub fn authorization_header(
        &self,
        method: &Method,
        url: &str,
        params: &[(&str, &str)],
        nonce: &str,
        timestamp: i64,
    ) -> String {
        let timestamp = timestamp.to_string();
        let mut oauth: BTreeMap<&str, &str> = BTreeMap::new();
        oauth.insert("oauth_consumer_key", &self.consumer_key);
        oauth.insert("oauth_nonce", nonce);
        oauth.insert("oauth_signature_method", "HMAC-SHA1");
        oauth.insert("oauth_timestamp", &timestamp);
        oauth.insert("oauth_token", &self.access_token);
        oauth.insert("oauth_version", "1.0");

        let all_params: Vec<(&str, &str)> = oauth
            .iter()
            .map(|(k, v)| (*k, *v))
            .chain(params.iter().copied())
            .collect();
        let base = signature_base_string(method, url, &all_params);
        let signature = sign(&self.consumer_secret, &self.access_secret, &base);

        let mut header = String::from("OAuth ");
        let mut fields: Vec<String> = oauth
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", percent_encode(k), percent_encode(v)))
            .collect();
        fields.push(format!("oauth_signature=\"{}\"", percent_encode(&signature)));
        fields.sort();
        header.push_str(&fields.join(", "));
        header
    }
}

/// RFC 3986 percent-encoding as OAuth requires.
fn percent_encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// `METHOD&enc(url)&enc(sorted, encoded params)`.
fn signature_base_string(method: &Method, url: &str, params: &[(&str, &str)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (percent_encode(k), percent_encode(v)))
        .collect();
    encoded.sort();

    let param_string = encoded
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    format!(
        "{}&{}&{}",
        method.as_str().to_uppercase(),
        percent_encode(url),
        percent_encode(&param_string)
    )
}

/// Base64 HMAC-SHA1 of `base` keyed with both secrets.
fn sign(consumer_secret: &str, token_secret: &str, base: &str) -> String {
    let key = format!(
        "{}&{}",
        percent_encode(consumer_secret),
        percent_encode(token_secret)
    );

    // HMAC accepts keys of any length.
    let mut mac = match Hmac::<Sha1>::new_from_slice(key.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(base.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

#[derive(Debug, Clone, Deserialize)]
struct Hashtag {
    text: String,
}

#[derive(Debug, Clone, Deserialize)]
struct UrlEntity {
    expanded_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Mention {
    screen_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Entities {
    #[serde(default)]
    hashtags: Vec<Hashtag>,
    #[serde(default)]
    symbols: Vec<Hashtag>,
    #[serde(default)]
    urls: Vec<UrlEntity>,
    #[serde(default)]
    user_mentions: Vec<Mention>,
}

#[derive(Debug, Clone, Deserialize)]
struct TwitterUser {
    screen_name: String,
}

/// A post as returned by the timeline endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct Tweet {
    id_str: String,
    #[serde(default)]
    full_text: Option<String>,
    #[serde(default)]
    text: Option<String>,
    created_at: String,
    #[serde(default)]
    favorite_count: u64,
    #[serde(default)]
    retweet_count: u64,
    #[serde(default)]
    entities: Entities,
    user: TwitterUser,
}

impl Tweet {
    /// Post id.
    pub fn id(&self) -> &str {
        &self.id_str
    }

    /// Post text, preferring the untruncated form.
    pub fn text(&self) -> &str {
        self.full_text
            .as_deref()
            .or(self.text.as_deref())
            .unwrap_or_default()
    }

    /// Input object for the `upsertTweet` mutation.
    pub fn to_tweet_input(&self) -> Result<Value, JobError> {
        let posted = DateTime::parse_from_str(&self.created_at, TWITTER_TIME_FORMAT)
            .map_err(|e| JobError::Parse(format!("Bad created_at '{}': {}", self.created_at, e)))?
            .with_timezone(&Utc);

        Ok(json!({
            "id": self.id_str,
            "text": self.text(),
            "hashtags": self.entities.hashtags.iter().map(|h| &h.text).collect::<Vec<_>>(),
            "symbols": self.entities.symbols.iter().map(|s| &s.text).collect::<Vec<_>>(),
            "user_mentions": self
                .entities
                .user_mentions
                .iter()
                .map(|m| &m.screen_name)
                .collect::<Vec<_>>(),
            "urls": self
                .entities
                .urls
                .iter()
                .filter_map(|u| u.expanded_url.as_deref())
                .collect::<Vec<_>>(),
            "screen_name": self.user.screen_name,
            "favorite_count": self.favorite_count,
            "retweet_count": self.retweet_count,
            "posted": posted.to_rfc3339(),
        }))
    }
}

/// Twitter client caching timelines into the GraphQL sink.
pub struct Twitter {
    http_client: Client,
    auth: TwitterAuth,
    graphql: GraphQlClient,
    /// Posts kept by `cache_random_tweets`.
    sample_size: usize,
}

impl Twitter {
    /// Create a client.
    pub fn new(
        http_client: Client,
        auth: TwitterAuth,
        graphql: GraphQlClient,
        sample_size: usize,
    ) -> Self {
        Self {
            http_client,
            auth,
            graphql,
            sample_size,
        }
    }

    /// Saves the authenticated user's recent posts.
    pub async fn save_user_tweets(&self) -> Result<usize, JobError> {
        let tweets = self.timeline("statuses/user_timeline.json").await?;
        self.save(&tweets).await?;
        info!(count = tweets.len(), "Saved user tweets");
        Ok(tweets.len())
    }

    /// Saves a random sample of the home timeline.
    pub async fn cache_random_tweets(&self) -> Result<usize, JobError> {
        let mut tweets = self.timeline("statuses/home_timeline.json").await?;
        tweets.shuffle(&mut rand::rng());
        tweets.truncate(self.sample_size);

        self.save(&tweets).await?;
        info!(count = tweets.len(), "Cached random tweets");
        Ok(tweets.len())
    }

    async fn save(&self, tweets: &[Tweet]) -> Result<(), JobError> {
        for tweet in tweets {
            self.graphql
                .mutate(UPSERT_TWEET, json!({ "input": tweet.to_tweet_input()? }))
                .await?;
        }
        Ok(())
    }

    async fn timeline(&self, path: &str) -> Result<Vec<Tweet>, JobError> {
        let url = format!("{}/{}", TWITTER_API_BASE, path);
        let params = [("count", "200"), ("tweet_mode", "extended")];

        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let authorization = self.auth.authorization_header(
            &Method::GET,
            &url,
            &params,
            &nonce,
            Utc::now().timestamp(),
        );

        let response = self
            .http_client
            .get(&url)
            .query(&params)
            .header("Authorization", authorization)
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

        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| JobError::Parse(format!("Failed to parse timeline: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> TwitterAuth {
        TwitterAuth {
            consumer_key: "xvz1evFS4wEEPTGEFPHBog".to_string(),
            consumer_secret: "kAcSOqF21Fu85e7zjz7ZN2U4ZRhfV3WpwPAoE3Z7kBw".to_string(),
            access_token: "370773112-GmHxMAgYyLbNEtIKZeRNFsMKPR9EyMZeS9weJAEb".to_string(),
            access_secret: "LswwdoUaIvS8ltyTt5jkRh4J50vUPVVHtR2YPi5kE".to_string(),
        }
    }

    #[test]
    fn test_signature_base_string() {
        let auth = auth();
        let params = [
            ("status", "Hello Ladies + Gentlemen, a signed OAuth request!"),
            ("include_entities", "true"),
            ("oauth_consumer_key", auth.consumer_key.as_str()),
            ("oauth_nonce", "kYjzVBB8Y0ZFabxSWbWovY3uYSQ2pTgmZeNu2VS4cg"),
            ("oauth_signature_method", "HMAC-SHA1"),
            ("oauth_timestamp", "1318622958"),
            ("oauth_token", auth.access_token.as_str()),
            ("oauth_version", "1.0"),
        ];

        let base = signature_base_string(
            &Method::POST,
            "https://api.twitter.com/1.1/statuses/update.json",
            &params,
        );

        assert_eq!(
            base,
            "POST&https%3A%2F%2Fapi.twitter.com%2F1.1%2Fstatuses%2Fupdate.json&\
             include_entities%3Dtrue%26\
             oauth_consumer_key%3Dxvz1evFS4wEEPTGEFPHBog%26\
             oauth_nonce%3DkYjzVBB8Y0ZFabxSWbWovY3uYSQ2pTgmZeNu2VS4cg%26\
             oauth_signature_method%3DHMAC-SHA1%26\
             oauth_timestamp%3D1318622958%26\
             oauth_token%3D370773112-GmHxMAgYyLbNEtIKZeRNFsMKPR9EyMZeS9weJAEb%26\
             oauth_version%3D1.0%26\
             status%3DHello%2520Ladies%2520%252B%2520Gentlemen%252C%2520a%2520signed%2520OAuth%2520request%2521"
        );
    }

    #[test]
    fn test_sign_is_deterministic() {
        let a = sign("consumer", "token", "GET&x&y");
        let b = sign("consumer", "token", "GET&x&y");
        let c = sign("consumer", "other", "GET&x&y");

        assert_eq!(a, b);
        assert_ne!(a, c);
        // 20-byte digest in padded base64.
        assert_eq!(a.len(), 28);
        assert!(a.ends_with('='));
    }

    #[test]
    fn test_authorization_header() {
        let header = auth().authorization_header(
            &Method::GET,
            "https://api.twitter.com/1.1/statuses/user_timeline.json",
            &[("count", "200")],
            "abc",
            1318622958,
        );

        assert!(header.starts_with("OAuth "));
        assert!(header.contains("oauth_consumer_key=\"xvz1evFS4wEEPTGEFPHBog\""));
        assert!(header.contains("oauth_nonce=\"abc\""));
        assert!(header.contains("oauth_timestamp=\"1318622958\""));
        assert!(header.contains("oauth_signature=\""));
        assert!(!header.contains("count="));
    }

    #[test]
    fn test_from_credentials_requires_all_four() {
        let credentials = Credentials::new()
            .with(Credential::TwitterConsumerKey, Some("k".to_string()))
            .with(Credential::TwitterConsumerSecret, Some("s".to_string()))
            .with(Credential::TwitterAccessToken, Some("t".to_string()));

        let err = TwitterAuth::from_credentials(&credentials).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: TWITTER_ACCESS_SECRET is unset"
        );
    }

    #[test]
    fn test_tweet_input() {
        let tweet: Tweet = serde_json::from_value(json!({
            "id_str": "1050118621198921728",
            "full_text": "Writing some #rust today https://t.co/x",
            "created_at": "Wed Oct 10 20:19:24 +0000 2018",
            "favorite_count": 3,
            "retweet_count": 1,
            "entities": {
                "hashtags": [{ "text": "rust" }],
                "urls": [{ "expanded_url": "https://natwelch.com" }],
                "user_mentions": []
            },
            "user": { "screen_name": "icco" }
        }))
        .expect("valid tweet");

        let input = tweet.to_tweet_input().expect("valid date");
        assert_eq!(input["id"], "1050118621198921728");
        assert_eq!(input["hashtags"], json!(["rust"]));
        assert_eq!(input["urls"], json!(["https://natwelch.com"]));
        assert_eq!(input["screen_name"], "icco");
        assert_eq!(input["posted"], "2018-10-10T20:19:24+00:00");
        assert_eq!(tweet.text(), "Writing some #rust today https://t.co/x");
    }
}
