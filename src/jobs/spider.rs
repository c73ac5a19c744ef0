//! Broken-link crawler.
//!
//! Walks a site breadth-first from a start URL, staying on the start host,
//! and reports pages that do not answer with a success status.

use std::collections::{HashSet, VecDeque};
use std::sync::LazyLock;

use regex::Regex;
use reqwest::{Client, Url};
use tracing::{debug, info, warn};

use crate::error::JobError;

/// Default crawl start.
pub const DEFAULT_SPIDER_URL: &str = "https://writing.natwelch.com/";

/// Summary of a crawl.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlReport {
    /// Pages fetched.
    pub visited: usize,
    /// Pages answering with a non-success status, with that status.
    pub broken: Vec<(String, u16)>,
}

/// Same-host breadth-first crawler.
pub struct Spider {
    http_client: Client,
    start: Url,
    max_pages: usize,
}

impl Spider {
    /// Create a crawler.
    ///
    /// # Errors
    ///
    /// Returns `JobError::Parse` if `start` is not an absolute URL.
    pub fn new(http_client: Client, start: &str, max_pages: usize) -> Result<Self, JobError> {
        let start = Url::parse(start)
            .map_err(|e| JobError::Parse(format!("Invalid start URL '{}': {}", start, e)))?;

        Ok(Self {
            http_client,
            start,
            max_pages: max_pages.max(1),
        })
    }

    /// Crawls the site.
    ///
    /// Broken pages are logged and reported, not returned as errors. Only a
    /// failing start page fails the crawl.
    pub async fn crawl(&self) -> Result<CrawlReport, JobError> {
        let mut report = CrawlReport::default();
        let mut queue = VecDeque::from([self.start.clone()]);
        let mut seen: HashSet<String> = HashSet::from([self.start.to_string()]);

        while let Some(url) = queue.pop_front() {
            if report.visited >= self.max_pages {
                debug!(max_pages = self.max_pages, "Page limit reached");
                break;
            }
            report.visited += 1;

            let response = match self.http_client.get(url.clone()).send().await {
                Ok(response) => response,
                Err(e) if report.visited == 1 => return Err(e.into()),
                Err(e) => {
                    warn!(url = %url, error = %e, "Could not fetch page");
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                warn!(url = %url, status = status.as_u16(), "Broken page");
                report.broken.push((url.to_string(), status.as_u16()));
                continue;
            }

            let is_html = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|ct| ct.contains("text/html"))
                .unwrap_or(true);
            if !is_html {
                continue;
            }

            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    warn!(url = %url, error = %e, "Could not read page");
                    continue;
                }
            };

            for link in same_host_links(&url, &body) {
                if seen.insert(link.to_string()) {
                    queue.push_back(link);
                }
            }
        }

        info!(
            start = %self.start,
            visited = report.visited,
            broken = report.broken.len(),
            "Crawl finished"
        );

        Ok(report)
    }
}

static HREF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)href\s*=\s*["']([^"'#]*)(?:#[^"']*)?["']"#).expect("Invalid regex for href")
});

/// Resolves the links in `body` against `base`, keeping http(s) links on the
/// same host, fragments removed.
fn same_host_links(base: &Url, body: &str) -> Vec<Url> {
    HREF
        .captures_iter(body)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|href| !href.is_empty())
        .filter_map(|href| base.join(href).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .filter(|url| url.host_str() == base.host_str())
        .map(|mut url| {
            url.set_fragment(None);
            url
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn links(base: &str, body: &str) -> Vec<String> {
        let base = Url::parse(base).expect("valid base");
        same_host_links(&base, body)
            .into_iter()
            .map(|u| u.to_string())
            .collect()
    }

    #[test]
    fn test_same_host_links() {
        let body = r##"
            <a href="/posts/1">one</a>
            <a href='posts/2#comments'>two</a>
            <a HREF="https://writing.natwelch.com/about">about</a>
            <a href="https://twitter.com/icco">elsewhere</a>
            <a href="mailto:nat@natwelch.com">mail</a>
            <a href="#top">top</a>
        "##;

        assert_eq!(
            links("https://writing.natwelch.com/tags/", body),
            vec![
                "https://writing.natwelch.com/posts/1",
                "https://writing.natwelch.com/tags/posts/2",
                "https://writing.natwelch.com/about",
            ]
        );
    }

    #[test]
    fn test_invalid_start_url() {
        let err = Spider::new(Client::new(), "not a url", 10).err().expect("rejected");
        assert!(matches!(err, JobError::Parse(_)));
    }

    #[test]
    fn test_page_limit_floor() {
        let spider = Spider::new(Client::new(), DEFAULT_SPIDER_URL, 0).expect("valid url");
        assert_eq!(spider.max_pages, 1);
    }
}
