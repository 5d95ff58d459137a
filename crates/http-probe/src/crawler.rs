//! Same-host link crawler and the worker pool that bounds it.
//!
//! Every crawl is a tracked task. [`CrawlerPool::wait`] resolves only once
//! all of them have finished, which is what the probe engine waits on
//! before reporting completion.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream;
use metrics::{counter, gauge};
use reqwest::Url;
use scraper::{Html, Selector};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use slimprobe_core::config::HttpProbeConfig;
use slimprobe_core::metrics::{CRAWLER_ACTIVE_WORKERS, CRAWLER_PAGES_TOTAL};
use slimprobe_core::types::ProbeProtocol;

use crate::error::HttpProbeError;

pub const CRAWLER_USER_AGENT: &str = "ds.crawler";
pub const CRAWL_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const SKIPPED_LINK_RELS: [&str; 3] = ["dns-prefetch", "preconnect", "alternate"];

/// Bounds for a single crawl.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrawlLimits {
    /// Link levels to visit, the seed being level 1. 0 is unbounded.
    pub max_depth: u32,
    /// `None` is unbounded
    pub max_page_count: Option<u64>,
    /// Parallel requests inside one crawl
    pub concurrency: usize,
}

impl CrawlLimits {
    pub fn from_config(cfg: &HttpProbeConfig) -> Self {
        Self {
            max_depth: cfg.crawl_max_depth,
            max_page_count: u64::try_from(cfg.crawl_max_page_count)
                .ok()
                .filter(|n| *n > 0),
            concurrency: cfg.crawl_concurrency.max(1),
        }
    }
}

impl Default for CrawlLimits {
    fn default() -> Self {
        Self::from_config(&HttpProbeConfig::default())
    }
}

/// Crawl workers owned by one probe session.
pub struct CrawlerPool {
    limits: CrawlLimits,
    /// `None` when the number of concurrent crawlers is unbounded
    semaphore: Option<Arc<Semaphore>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    active: Arc<AtomicUsize>,
    pages: Arc<AtomicU64>,
}

impl CrawlerPool {
    /// `max_concurrent_crawlers <= 0` disables the crawler limit.
    pub fn new(limits: CrawlLimits, max_concurrent_crawlers: i64, cancel: CancellationToken) -> Self {
        let semaphore = usize::try_from(max_concurrent_crawlers)
            .ok()
            .filter(|n| *n > 0)
            .map(|n| Arc::new(Semaphore::new(n)));
        Self {
            limits,
            semaphore,
            tracker: TaskTracker::new(),
            cancel,
            active: Arc::new(AtomicUsize::new(0)),
            pages: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Starts crawling `seed`, restricted to `domain`.
    ///
    /// Waits for a free crawler slot first when the pool is bounded.
    pub async fn crawl(&self, protocol: ProbeProtocol, domain: &str, seed: &str) {
        let client = match crawl_client(protocol) {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "crawler client setup failed");
                return;
            }
        };
        let seed = match Url::parse(seed) {
            Ok(url) => url,
            Err(e) => {
                warn!(seed, error = %e, "invalid crawl seed");
                return;
            }
        };

        let permit = match &self.semaphore {
            Some(semaphore) => {
                let acquired = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    permit = Arc::clone(semaphore).acquire_owned() => permit,
                };
                match acquired {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                }
            }
            None => None,
        };

        let limits = self.limits;
        let domain = domain.trim_start_matches('[').trim_end_matches(']').to_owned();
        let cancel = self.cancel.clone();
        let active = Arc::clone(&self.active);
        let pages = Arc::clone(&self.pages);

        active.fetch_add(1, Ordering::SeqCst);
        gauge!(CRAWLER_ACTIVE_WORKERS).increment(1.0);
        self.tracker.spawn(async move {
            let addr = seed.to_string();
            let visited = run_crawl(client, seed, &domain, limits, &cancel).await;
            pages.fetch_add(visited, Ordering::Relaxed);
            info!(state = "probe.crawler.done", addr = %addr, pages = visited, "crawl finished");

            active.fetch_sub(1, Ordering::SeqCst);
            gauge!(CRAWLER_ACTIVE_WORKERS).decrement(1.0);
            drop(permit);
        });
    }

    /// Crawls still running.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Pages fetched by finished crawls.
    pub fn pages_visited(&self) -> u64 {
        self.pages.load(Ordering::Relaxed)
    }

    /// Stops accepting crawls and waits for the running ones.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

fn crawl_client(protocol: ProbeProtocol) -> Result<reqwest::Client, HttpProbeError> {
    let mut builder = reqwest::Client::builder()
        .user_agent(CRAWLER_USER_AGENT)
        .timeout(CRAWL_REQUEST_TIMEOUT)
        .danger_accept_invalid_certs(true);
    if matches!(protocol, ProbeProtocol::Http2 | ProbeProtocol::Http2c) {
        builder = builder.http2_prior_knowledge();
    }
    builder
        .build()
        .map_err(|e| HttpProbeError::Client(e.to_string()))
}

/// Level by level crawl. Returns the number of pages requested.
async fn run_crawl(
    client: reqwest::Client,
    seed: Url,
    domain: &str,
    limits: CrawlLimits,
    cancel: &CancellationToken,
) -> u64 {
    let mut visited: HashSet<Url> = HashSet::new();
    let mut frontier = vec![without_fragment(seed)];
    visited.extend(frontier.iter().cloned());

    let mut requested = 0u64;
    let mut depth = 1u32;
    while !frontier.is_empty() && !cancel.is_cancelled() {
        if let Some(max) = limits.max_page_count {
            let remaining = max.saturating_sub(requested);
            if remaining == 0 {
                info!(state = "http.probe.crawler.stop", reason = "reached max visits", "crawler stopped");
                break;
            }
            frontier.truncate(usize::try_from(remaining).unwrap_or(usize::MAX));
        }

        let follow = limits.max_depth == 0 || depth < limits.max_depth;
        let level: Vec<Url> = std::mem::take(&mut frontier);
        for url in &level {
            requested += 1;
            info!(state = "http.probe.crawler", page = requested, url = %url, "crawling");
        }
        counter!(CRAWLER_PAGES_TOTAL).increment(level.len() as u64);

        let found: Vec<Vec<Url>> = stream::iter(level)
            .map(|url| fetch_links(&client, url, follow))
            .buffer_unordered(limits.concurrency)
            .collect()
            .await;

        if !follow {
            break;
        }
        for link in found.into_iter().flatten() {
            if same_host(&link, domain) && visited.insert(link.clone()) {
                frontier.push(link);
            }
        }
        depth += 1;
    }
    requested
}

async fn fetch_links(client: &reqwest::Client, url: Url, follow: bool) -> Vec<Url> {
    let response = match client.get(url.clone()).send().await {
        Ok(response) => response,
        Err(e) => {
            trace!(url = %url, error = %e, "crawl request failed");
            return Vec::new();
        }
    };
    let is_html = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_none_or(|ct| ct.contains("html"));
    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => {
            trace!(url = %url, error = %e, "crawl body read failed");
            return Vec::new();
        }
    };
    if !follow || !is_html {
        return Vec::new();
    }
    extract_links(&url, &body)
}

/// Followable links in an HTML document, resolved against `base`.
///
/// Covers `a[href]`, `link[href]` (minus hint rels), `src` on scripts,
/// sources and images, `source[srcset]` and `data-src`.
pub fn extract_links(base: &Url, html: &str) -> Vec<Url> {
    let doc = Html::parse_document(html);
    let mut raw: Vec<String> = Vec::new();

    if let Ok(sel) = Selector::parse("a[href]") {
        raw.extend(doc.select(&sel).filter_map(|e| e.value().attr("href")).map(str::to_owned));
    }
    if let Ok(sel) = Selector::parse("link[href]") {
        raw.extend(
            doc.select(&sel)
                .filter(|e| {
                    e.value()
                        .attr("rel")
                        .is_none_or(|rel| !SKIPPED_LINK_RELS.contains(&rel.trim()))
                })
                .filter_map(|e| e.value().attr("href"))
                .map(str::to_owned),
        );
    }
    if let Ok(sel) = Selector::parse("script[src], source[src], img[src]") {
        raw.extend(doc.select(&sel).filter_map(|e| e.value().attr("src")).map(str::to_owned));
    }
    if let Ok(sel) = Selector::parse("source[srcset]") {
        for srcset in doc.select(&sel).filter_map(|e| e.value().attr("srcset")) {
            raw.extend(
                srcset
                    .split(',')
                    .filter_map(|candidate| candidate.split_whitespace().next())
                    .map(str::to_owned),
            );
        }
    }
    if let Ok(sel) = Selector::parse("[data-src]") {
        raw.extend(doc.select(&sel).filter_map(|e| e.value().attr("data-src")).map(str::to_owned));
    }

    let mut links = Vec::new();
    for href in raw {
        let href = href.trim();
        if href.is_empty() {
            continue;
        }
        match base.join(href) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => links.push(without_fragment(url)),
            Ok(_) => {}
            Err(e) => debug!(href, error = %e, "skipping unparsable link"),
        }
    }
    links
}

fn same_host(url: &Url, domain: &str) -> bool {
    url.host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
        == Some(domain)
}

fn without_fragment(mut url: Url) -> Url {
    url.set_fragment(None);
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("http://127.0.0.1:8080/docs/index.html").unwrap()
    }

    #[test]
    fn extracts_every_link_kind() {
        let html = r#"
            <html><head>
              <link rel="stylesheet" href="/style.css">
              <link rel="preconnect" href="http://cdn.example.com">
              <link rel="dns-prefetch" href="//dns.example.com">
              <script src="app.js"></script>
            </head><body>
              <a href="/about#team">about</a>
              <img src="/logo.png">
              <picture><source srcset="/small.webp 1x, /large.webp 2x"></picture>
              <div data-src="/lazy.jpg"></div>
              <a href="mailto:ops@example.com">mail</a>
            </body></html>"#;
        let links: Vec<String> = extract_links(&base(), html)
            .into_iter()
            .map(|u| u.path().to_owned())
            .collect();

        for expected in [
            "/about",
            "/style.css",
            "/docs/app.js",
            "/logo.png",
            "/small.webp",
            "/large.webp",
            "/lazy.jpg",
        ] {
            assert!(links.iter().any(|l| l == expected), "missing {expected} in {links:?}");
        }
        assert_eq!(links.len(), 7);
    }

    #[test]
    fn host_filter_ignores_brackets() {
        let v6 = Url::parse("http://[::1]:8080/").unwrap();
        assert!(same_host(&v6, "::1"));
        assert!(same_host(&base(), "127.0.0.1"));
        assert!(!same_host(&base(), "localhost"));
    }

    #[test]
    fn non_positive_limits_are_unbounded() {
        let cfg = HttpProbeConfig {
            crawl_max_page_count: 0,
            ..HttpProbeConfig::default()
        };
        assert_eq!(CrawlLimits::from_config(&cfg).max_page_count, None);
        assert_eq!(CrawlLimits::default().max_page_count, Some(1000));

        let pool = CrawlerPool::new(CrawlLimits::default(), -1, CancellationToken::new());
        assert!(pool.semaphore.is_none());
        let pool = CrawlerPool::new(CrawlLimits::default(), 2, CancellationToken::new());
        assert_eq!(pool.semaphore.as_ref().map(|s| s.available_permits()), Some(2));
    }

    #[tokio::test]
    async fn wait_with_no_crawls_returns() {
        let pool = CrawlerPool::new(CrawlLimits::default(), 1, CancellationToken::new());
        pool.wait().await;
        assert_eq!(pool.active_workers(), 0);
    }
}
