//! Goodreads shelf import.
//!
//! The Goodreads API only speaks XML. The shelf document is flat enough that
//! the handful of fields needed are pulled out with patterns rather than a
//! full XML parser.

use std::sync::LazyLock;

use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::JobError;

use super::graphql::GraphQlClient;

/// Goodreads API base URL.
const GOODREADS_API_BASE: &str = "https://www.goodreads.com";

/// Shelf imported on each run.
const SHELF: &str = "read";

const UPSERT_BOOK: &str = r#"mutation SaveBook($input: EditBook!) {
  upsertBook(input: $input) {
    id
  }
}"#;

static REVIEW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<review>(.*?)</review>").expect("Invalid regex for review"));

static BOOK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<book>(.*?)</book>").expect("Invalid regex for book"));

/// A book on the shelf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Book {
    pub goodreads_id: String,
    pub title: String,
    pub isbn: Option<String>,
    pub link: Option<String>,
    pub authors: Vec<String>,
}

impl Book {
    /// Input object for the `upsertBook` mutation.
    pub fn to_book_input(&self) -> Value {
        json!({
            "goodreads_id": self.goodreads_id,
            "title": self.title,
            "isbn": self.isbn,
            "link": self.link,
            "authors": self.authors,
        })
    }
}

/// Copies the read shelf into the GraphQL sink.
pub struct Goodreads {
    http_client: Client,
    token: String,
    user_id: String,
    graphql: GraphQlClient,
}

impl Goodreads {
    /// Create an importer for `user_id` using the developer key `token`.
    pub fn new(
        http_client: Client,
        token: impl Into<String>,
        user_id: impl Into<String>,
        graphql: GraphQlClient,
    ) -> Self {
        Self {
            http_client,
            token: token.into(),
            user_id: user_id.into(),
            graphql,
        }
    }

    /// Fetches the books on the read shelf.
    pub async fn read_shelf(&self) -> Result<Vec<Book>, JobError> {
        let url = format!(
            "{}/review/list/{}.xml?key={}&v=2&shelf={}&per_page=200",
            GOODREADS_API_BASE,
            urlencoding::encode(&self.user_id),
            urlencoding::encode(&self.token),
            SHELF
        );

        let response = self.http_client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(JobError::Api {
                code: status.as_u16(),
                message: "Goodreads request failed".to_string(),
            });
        }

        let body = response.text().await?;
        Ok(parse_shelf(&body))
    }

    /// Upserts every book on the shelf. Returns how many were saved.
    pub async fn upsert_books(&self) -> Result<usize, JobError> {
        let books = self.read_shelf().await?;

        for book in &books {
            debug!(title = %book.title, "Saving book");
            self.graphql
                .mutate(UPSERT_BOOK, json!({ "input": book.to_book_input() }))
                .await?;
        }

        info!(count = books.len(), "Saved books");
        Ok(books.len())
    }
}

/// Extracts the books of a `review/list` document. Reviews without a book id
/// or title are dropped.
fn parse_shelf(xml: &str) -> Vec<Book> {
    REVIEW
        .captures_iter(xml)
        .filter_map(|review| {
            let review = review.get(1)?.as_str();
            let book = BOOK.captures(review)?.get(1)?.as_str();
            parse_book(book)
        })
        .collect()
}

fn parse_book(book: &str) -> Option<Book> {
    let goodreads_id = element(book, "id")?;
    let title = element(book, "title")?;

    let authors = element_block(book, "authors")
        .map(|block| {
            element_blocks(block, "author")
                .into_iter()
                .filter_map(|author| element(author, "name"))
                .collect()
        })
        .unwrap_or_default();

    Some(Book {
        goodreads_id,
        title,
        isbn: element(book, "isbn13").or_else(|| element(book, "isbn")),
        link: element(book, "link"),
        authors,
    })
}

/// Text of the first `<tag>`, trimmed, CDATA unwrapped and entities
/// decoded. `None` when missing or empty.
fn element(xml: &str, tag: &str) -> Option<String> {
    let inner = element_block(xml, tag)?;
    let inner = inner.trim();
    let inner = inner
        .strip_prefix("<![CDATA[")
        .and_then(|s| s.strip_suffix("]]>"))
        .unwrap_or(inner)
        .trim();

    let text = decode_entities(inner);
    (!text.is_empty()).then_some(text)
}

/// Raw content of the first `<tag>` or `<tag attr="...">` element.
fn element_block<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    element_blocks(xml, tag).into_iter().next()
}

/// Raw content of every `<tag>` element, in document order. Self-closing
/// elements yield an empty string.
fn element_blocks<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);
    let mut blocks = Vec::new();
    let mut rest = xml;

    while let Some(start) = rest.find(&open) {
        let after_name = &rest[start + open.len()..];

        // Skip longer tag names sharing the prefix, e.g. <isbn13> for <isbn>.
        if !after_name.starts_with('>') && !after_name.starts_with(char::is_whitespace) {
            rest = after_name;
            continue;
        }

        let Some(tag_end) = after_name.find('>') else {
            break;
        };
        let content = &after_name[tag_end + 1..];

        if after_name[..tag_end].ends_with('/') {
            blocks.push("");
            rest = content;
            continue;
        }

        let Some(end) = content.find(&close) else {
            break;
        };
        blocks.push(&content[..end]);
        rest = &content[end + close.len()..];
    }

    blocks
}

fn decode_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
