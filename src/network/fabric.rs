//! Resilient fetch layer: retrying requests with exponential backoff,
//! 429 back-pressure, domain rotation across the interchangeable host
//! lists, anti-ban pacing and optional proxy failover.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, REFERER, USER_AGENT};
use reqwest::Proxy;
use tracing::{debug, info, warn};
use url::Url;

use super::pool::ProxyPool;
use super::proxy::ProxyDescriptor;

pub const PRIMARY_DOMAINS: [&str; 3] = ["docln.net", "ln.hako.vn", "docln.sbs"];
pub const IMAGE_DOMAINS: [&str; 5] = [
    "i.hako.vip",
    "i.docln.net",
    "ln.hako.vn",
    "i2.docln.net",
    "i2.hako.vip",
];

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("http status {0}")]
    HttpStatus(u16),
    #[error("rate limited: 429 budget exhausted")]
    RateLimited,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("proxy connection failed: {host}:{port}")]
    ProxyConnection { host: String, port: u16 },
    #[error("proxy authentication failed: {host}:{port}")]
    ProxyAuth { host: String, port: u16 },
    #[error("proxy timed out: {host}:{port}")]
    ProxyTimeout { host: String, port: u16 },
    #[error("all {count} proxies failed")]
    AllProxiesFailed {
        count: usize,
        #[source]
        last: Box<NetworkError>,
    },
}

#[derive(Debug, Clone)]
pub struct FabricConfig {
    pub primary_domains: Vec<String>,
    pub image_domains: Vec<String>,
    pub user_agent: String,
    pub request_timeout: Duration,
    /// A mandatory pause is inserted every this many counted requests.
    pub anti_ban_interval: u64,
    pub anti_ban_pause: Duration,
    pub max_retries: u32,
    pub rate_limit_retries: u32,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            primary_domains: PRIMARY_DOMAINS.iter().map(|d| d.to_string()).collect(),
            image_domains: IMAGE_DOMAINS.iter().map(|d| d.to_string()).collect(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_timeout: Duration::from_secs(30),
            anti_ban_interval: 100,
            anti_ban_pause: Duration::from_secs(30),
            max_retries: 3,
            rate_limit_retries: 5,
        }
    }
}

pub struct NetworkFabric {
    client: Client,
    proxy_clients: Vec<Client>,
    pool: Option<ProxyPool>,
    config: FabricConfig,
    request_count: AtomicU64,
}

impl NetworkFabric {
    pub fn new(config: FabricConfig) -> anyhow::Result<Self> {
        Self::build(config, None)
    }

    pub fn with_pool(config: FabricConfig, pool: ProxyPool) -> anyhow::Result<Self> {
        Self::build(config, Some(pool))
    }

    fn build(config: FabricConfig, pool: Option<ProxyPool>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        let mut proxy_clients = Vec::new();
        if let Some(pool) = &pool {
            for descriptor in pool.all() {
                let proxy = Proxy::all(descriptor.reconstruct())?;
                let client = Client::builder()
                    .proxy(proxy)
                    .timeout(config.request_timeout)
                    .build()?;
                proxy_clients.push(client);
            }
        }

        Ok(Self {
            client,
            proxy_clients,
            pool,
            config,
            request_count: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn reset_count(&self) {
        self.request_count.store(0, Ordering::Relaxed);
    }

    pub fn has_proxy(&self) -> bool {
        self.pool.is_some()
    }

    pub fn proxy_count(&self) -> usize {
        self.pool.as_ref().map(|p| p.size()).unwrap_or(0)
    }

    /// True iff the URL parses and its host is one of the interchangeable
    /// primary or image hosts, or a subdomain of one.
    pub fn is_internal(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let Some(host) = parsed.host_str() else {
            return false;
        };
        self.config
            .primary_domains
            .iter()
            .chain(self.config.image_domains.iter())
            .any(|d| host_matches(host, d))
    }

    pub fn fetch_with_retry(&self, url: &str) -> Result<Response, NetworkError> {
        self.fetch_with_options(url, None, None)
    }

    pub fn fetch_with_options(
        &self,
        url: &str,
        extra_headers: Option<HeaderMap>,
        timeout: Option<Duration>,
    ) -> Result<Response, NetworkError> {
        let target = normalize_url(url);
        let parsed = Url::parse(&target).map_err(|_| NetworkError::InvalidUrl(url.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(NetworkError::InvalidUrl(url.to_string()));
        }

        self.anti_ban_gate();

        let headers = self.request_headers(&parsed, extra_headers);
        let timeout = timeout.unwrap_or(self.config.request_timeout);
        let internal = self.is_internal(parsed.as_str());

        let mut rate_hits: u32 = 0;
        let mut last_err = NetworkError::Transport("no attempt issued".to_string());
        let mut attempt: u32 = 0;

        while attempt < self.config.max_retries {
            let dispatched = match &self.pool {
                Some(pool) => self.fetch_with_failover(pool, parsed.as_str(), &headers, timeout),
                None => self
                    .direct_fetch(&self.client, parsed.as_str(), &headers, timeout)
                    .map_err(|e| categorize_transport(&e, None)),
            };

            match dispatched {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        if self.pool.is_none() {
                            self.request_count.fetch_add(1, Ordering::Relaxed);
                        }
                        return Ok(resp);
                    }
                    if status.as_u16() == 429 {
                        if rate_hits < self.config.rate_limit_retries {
                            rate_hits += 1;
                            let wait = Duration::from_secs((30 * u64::from(rate_hits)).min(120));
                            warn!(
                                "rate limited (hit {}/{}), waiting {}s: {}",
                                rate_hits,
                                self.config.rate_limit_retries,
                                wait.as_secs(),
                                parsed
                            );
                            thread::sleep(wait);
                            // 429 waits do not consume a retry attempt.
                            continue;
                        }
                        last_err = NetworkError::RateLimited;
                        break;
                    }
                    if internal && self.pool.is_none() {
                        if let Some(resp) = self.rotate_domains(&parsed, &headers, timeout) {
                            return Ok(resp);
                        }
                    }
                    last_err = NetworkError::HttpStatus(status.as_u16());
                }
                Err(err @ NetworkError::AllProxiesFailed { .. }) => {
                    last_err = err;
                }
                Err(err) => {
                    if internal && self.pool.is_none() {
                        if let Some(resp) = self.rotate_domains(&parsed, &headers, timeout) {
                            return Ok(resp);
                        }
                    }
                    last_err = err;
                }
            }

            if attempt + 1 < self.config.max_retries {
                let backoff = Duration::from_secs(1 << attempt);
                debug!("retrying {} in {}s", parsed, backoff.as_secs());
                thread::sleep(backoff);
            }
            attempt += 1;
        }

        Err(last_err)
    }

    /// Streams a GET response to `path`. Returns true when the target
    /// already exists with non-zero size (no network call) or the download
    /// completed; false otherwise.
    pub fn download_to_file(&self, url: &str, path: &Path) -> bool {
        if url.trim().is_empty() {
            return false;
        }
        if path.exists() {
            match fs::metadata(path) {
                Ok(meta) if meta.len() > 0 => return true,
                _ => {
                    let _ = fs::remove_file(path);
                }
            }
        }

        let mut target = url.to_string();
        // Imgur links without an extension serve HTML; force the image.
        let tail: String = target.chars().rev().take(5).collect();
        if target.contains("imgur.com") && !tail.contains('.') {
            target.push_str(".jpg");
        }

        match self.fetch_with_retry(&target) {
            Ok(mut resp) => {
                if let Some(parent) = path.parent() {
                    if let Err(e) = fs::create_dir_all(parent) {
                        warn!("could not create {}: {}", parent.display(), e);
                        return false;
                    }
                }
                let tmp = match path.file_name().and_then(|n| n.to_str()) {
                    Some(name) => path.with_file_name(format!("{name}.part")),
                    None => return false,
                };
                let written = fs::File::create(&tmp)
                    .map_err(|e| e.to_string())
                    .and_then(|mut file| resp.copy_to(&mut file).map_err(|e| e.to_string()));
                match written {
                    Ok(_) => match fs::rename(&tmp, path) {
                        Ok(_) => true,
                        Err(e) => {
                            warn!("could not move {} into place: {}", tmp.display(), e);
                            let _ = fs::remove_file(&tmp);
                            false
                        }
                    },
                    Err(e) => {
                        warn!("download failed: {} | {}", url, e);
                        let _ = fs::remove_file(&tmp);
                        false
                    }
                }
            }
            Err(e) => {
                warn!("download failed: {} | {}", url, e);
                false
            }
        }
    }

    fn anti_ban_gate(&self) {
        let count = self.request_count.load(Ordering::Relaxed);
        if count > 0 && count % self.config.anti_ban_interval == 0 {
            info!(
                "anti-ban: pausing for {}s after {} requests",
                self.config.anti_ban_pause.as_secs(),
                count
            );
            thread::sleep(self.config.anti_ban_pause);
        }
    }

    fn request_headers(&self, url: &Url, extra: Option<HeaderMap>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.config.user_agent)
                .unwrap_or(HeaderValue::from_static("Mozilla/5.0")),
        );
        if let Some(primary) = self.config.primary_domains.first() {
            let referer = format!("https://{primary}/");
            if let Ok(v) = HeaderValue::from_str(&referer) {
                headers.insert(REFERER, v);
            }
        }
        if let Some(extra) = extra {
            for (name, value) in extra.iter() {
                headers.insert(name.clone(), value.clone());
            }
        }
        if !self.is_internal(url.as_str()) {
            headers.remove(REFERER);
        }
        headers
    }

    fn direct_fetch(
        &self,
        client: &Client,
        url: &str,
        headers: &HeaderMap,
        timeout: Duration,
    ) -> Result<Response, reqwest::Error> {
        client
            .get(url)
            .headers(headers.clone())
            .timeout(timeout)
            .send()
    }

    /// Walks the pool in rotation order, trying each proxy once. The first
    /// transport-level success wins; the response status is judged by the
    /// caller.
    fn fetch_with_failover(
        &self,
        pool: &ProxyPool,
        url: &str,
        headers: &HeaderMap,
        timeout: Duration,
    ) -> Result<Response, NetworkError> {
        let count = pool.size();
        let mut last: Option<NetworkError> = None;

        for _ in 0..count {
            let (idx, descriptor) = pool.next_indexed();
            match self.direct_fetch(&self.proxy_clients[idx], url, headers, timeout) {
                Ok(resp) => {
                    self.request_count.fetch_add(1, Ordering::Relaxed);
                    return Ok(resp);
                }
                Err(e) => {
                    let err = categorize_transport(&e, Some(descriptor));
                    warn!(
                        "proxy {}://{}:{} failed: {}",
                        descriptor.protocol, descriptor.host, descriptor.port, err
                    );
                    last = Some(err);
                }
            }
        }

        Err(NetworkError::AllProxiesFailed {
            count,
            last: Box::new(last.unwrap_or(NetworkError::Transport("empty pool".to_string()))),
        })
    }

    /// Swaps the host across the interchangeable domain list. Only used
    /// for internal URLs when no proxy pool is configured.
    fn rotate_domains(
        &self,
        url: &Url,
        headers: &HeaderMap,
        timeout: Duration,
    ) -> Option<Response> {
        let host = url.host_str()?.to_string();
        let list = if self
            .config
            .image_domains
            .iter()
            .any(|d| host_matches(&host, d))
        {
            &self.config.image_domains
        } else {
            &self.config.primary_domains
        };

        for domain in list {
            if *domain == host {
                continue;
            }
            let mut candidate = url.clone();
            if candidate.set_host(Some(domain.as_str())).is_err() {
                continue;
            }
            self.request_count.fetch_add(1, Ordering::Relaxed);
            debug!("domain rotation: trying {}", candidate);
            match self.direct_fetch(&self.client, candidate.as_str(), headers, timeout) {
                Ok(resp) if resp.status().is_success() => {
                    info!("domain rotation succeeded via {}", domain);
                    return Some(resp);
                }
                Ok(resp) => {
                    debug!("rotation to {} returned {}", domain, resp.status());
                }
                Err(e) => {
                    debug!("rotation to {} failed: {}", domain, e);
                }
            }
        }
        None
    }
}

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{domain}"))
}

/// Scheme-less URLs get https, and the legacy image host is rewritten to
/// its current alias.
fn normalize_url(url: &str) -> String {
    let mut out = url.trim().to_string();
    if out.contains("i2.docln.net") {
        out = out.replace("i2.docln.net", "i2.hako.vip");
    }
    if !out.starts_with("http://") && !out.starts_with("https://") {
        if out.starts_with("//") {
            out = format!("https:{out}");
        } else if !out.contains("://") {
            out = format!("https://{out}");
        }
    }
    out
}

fn categorize_transport(err: &reqwest::Error, proxy: Option<&ProxyDescriptor>) -> NetworkError {
    let text = error_chain_text(err);
    let lower = text.to_lowercase();
    match proxy {
        Some(p) => {
            if lower.contains("econnrefused")
                || lower.contains("enotfound")
                || lower.contains("connection refused")
                || lower.contains("dns error")
            {
                NetworkError::ProxyConnection {
                    host: p.host.clone(),
                    port: p.port,
                }
            } else if lower.contains("407") || lower.contains("authentication") {
                NetworkError::ProxyAuth {
                    host: p.host.clone(),
                    port: p.port,
                }
            } else if err.is_timeout() || lower.contains("timeout") || lower.contains("aborted") {
                NetworkError::ProxyTimeout {
                    host: p.host.clone(),
                    port: p.port,
                }
            } else {
                NetworkError::Transport(text)
            }
        }
        None => {
            if err.is_timeout() {
                NetworkError::Timeout
            } else {
                NetworkError::Transport(text)
            }
        }
    }
}

fn error_chain_text(err: &reqwest::Error) -> String {
    let mut text = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fabric() -> NetworkFabric {
        NetworkFabric::new(FabricConfig::default()).unwrap()
    }

    #[test]
    fn internal_domains_are_classified() {
        let f = fabric();
        assert!(f.is_internal("https://docln.net/truyen/5"));
        assert!(f.is_internal("https://www.docln.net/truyen/5"));
        assert!(f.is_internal("https://ln.hako.vn/x"));
        assert!(f.is_internal("https://i2.hako.vip/a.jpg"));
        assert!(!f.is_internal("https://example.com/x"));
        assert!(!f.is_internal("https://notdocln.net.evil.com/x"));
        assert!(!f.is_internal("not a url"));
    }

    #[test]
    fn subdomain_match_requires_dot_boundary() {
        let f = fabric();
        assert!(!f.is_internal("https://fakedocln.net/x"));
        assert!(f.is_internal("https://cdn.docln.net/x"));
    }

    #[test]
    fn existing_file_skips_network() {
        let f = fabric();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exist.jpg");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(b"twelve bytes").unwrap();

        assert!(f.download_to_file("http://i.hako.vip/a.jpg", &path));
        assert_eq!(f.request_count(), 0);
    }

    #[test]
    fn empty_url_is_rejected() {
        let f = fabric();
        let dir = tempfile::tempdir().unwrap();
        assert!(!f.download_to_file("", &dir.path().join("x.jpg")));
    }

    #[test]
    fn scheme_less_urls_are_normalized() {
        assert_eq!(
            normalize_url("//i.hako.vip/a.jpg"),
            "https://i.hako.vip/a.jpg"
        );
        assert_eq!(normalize_url("docln.net/t/5"), "https://docln.net/t/5");
        assert_eq!(
            normalize_url("https://i2.docln.net/b.png"),
            "https://i2.hako.vip/b.png"
        );
    }

    #[test]
    fn invalid_scheme_fails_fast() {
        let f = fabric();
        let err = f.fetch_with_retry("ftp://docln.net/x").unwrap_err();
        assert!(matches!(err, NetworkError::InvalidUrl(_)));
    }

    #[test]
    fn introspection_reflects_pool() {
        let f = fabric();
        assert!(!f.has_proxy());
        assert_eq!(f.proxy_count(), 0);

        let pool = ProxyPool::new(["http://p1:8080", "http://p2:8080"]).unwrap();
        let pooled = NetworkFabric::with_pool(FabricConfig::default(), pool).unwrap();
        assert!(pooled.has_proxy());
        assert_eq!(pooled.proxy_count(), 2);
    }
}
