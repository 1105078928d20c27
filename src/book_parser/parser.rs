//! Catalog parser: novel landing page HTML into a [`Novel`].

use std::sync::OnceLock;

use scraper::{ElementRef, Html, Selector};
use tracing::{error, info};
use url::Url;

use crate::book_parser::html_utils::{self, re_style_url};
use crate::book_parser::models::{ChapterRef, Novel, Volume};
use crate::network::{NetworkError, NetworkFabric};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Invalid domain: {host}. Must be a Hako domain ({supported})")]
    InvalidDomain { host: String, supported: String },
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("parse failed: {0}")]
    ParseFailed(String),
    #[error(transparent)]
    Network(#[from] NetworkError),
}

fn sel(cache: &'static OnceLock<Selector>, css: &str) -> &'static Selector {
    cache.get_or_init(|| Selector::parse(css).unwrap())
}

fn sel_series_name() -> &'static Selector {
    static S: OnceLock<Selector> = OnceLock::new();
    sel(&S, "span.series-name")
}

fn sel_info_item() -> &'static Selector {
    static S: OnceLock<Selector> = OnceLock::new();
    sel(&S, "div.series-information div.info-item")
}

fn sel_info_name() -> &'static Selector {
    static S: OnceLock<Selector> = OnceLock::new();
    sel(&S, "span.info-name")
}

fn sel_info_value() -> &'static Selector {
    static S: OnceLock<Selector> = OnceLock::new();
    sel(&S, "span.info-value")
}

fn sel_summary() -> &'static Selector {
    static S: OnceLock<Selector> = OnceLock::new();
    sel(&S, "div.summary-content")
}

fn sel_summary_noise() -> &'static Selector {
    static S: OnceLock<Selector> = OnceLock::new();
    sel(
        &S,
        "a.see-more, div.less-state, div.more-state, span.see-more, span.less-state, span.more-state",
    )
}

fn sel_main_cover() -> &'static Selector {
    static S: OnceLock<Selector> = OnceLock::new();
    sel(&S, "div.series-cover div.img-in-ratio")
}

fn sel_genres() -> &'static Selector {
    static S: OnceLock<Selector> = OnceLock::new();
    sel(&S, "div.series-gernes a, div.series-genres a")
}

fn sel_volume_section() -> &'static Selector {
    static S: OnceLock<Selector> = OnceLock::new();
    sel(&S, "section.volume-list")
}

fn sel_volume_title() -> &'static Selector {
    static S: OnceLock<Selector> = OnceLock::new();
    sel(&S, "span.sect-title")
}

fn sel_volume_cover_link() -> &'static Selector {
    static S: OnceLock<Selector> = OnceLock::new();
    sel(&S, "div.volume-cover a[href]")
}

fn sel_volume_cover_img() -> &'static Selector {
    static S: OnceLock<Selector> = OnceLock::new();
    sel(&S, "div.volume-cover div.img-in-ratio")
}

fn sel_chapter_links() -> &'static Selector {
    static S: OnceLock<Selector> = OnceLock::new();
    sel(&S, "ul.list-chapters li a")
}

pub struct CatalogParser;

impl CatalogParser {
    /// Checks that the candidate URL is http(s) on a primary host.
    pub fn validate_url(url: &str, primary_domains: &[String]) -> Result<Url, CatalogError> {
        let parsed = Url::parse(url).map_err(|_| CatalogError::InvalidUrl(url.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(CatalogError::InvalidUrl(url.to_string()));
        }
        let host = parsed.host_str().unwrap_or_default().to_string();
        let supported = primary_domains.join(", ");
        let ok = primary_domains
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{d}")));
        if !ok {
            return Err(CatalogError::InvalidDomain { host, supported });
        }
        Ok(parsed)
    }

    /// Fetches and parses a novel landing page.
    pub fn parse(fabric: &NetworkFabric, url: &str) -> Result<Novel, CatalogError> {
        Self::validate_url(url, &fabric.config().primary_domains)?;

        info!("fetching novel info: {}", url);
        let resp = fabric.fetch_with_retry(url)?;
        let html = resp
            .text()
            .map_err(|e| CatalogError::ParseFailed(e.to_string()))?;

        let novel = Self::parse_document(&html, url, &fabric.config().primary_domains);
        info!("parsed: {} | tags: {}", novel.name, novel.tags.len());
        Ok(novel)
    }

    /// Pure extraction over already-fetched HTML.
    pub fn parse_document(html: &str, base_url: &str, primary_domains: &[String]) -> Novel {
        let doc = Html::parse_document(html);
        let mut novel = Novel {
            url: base_url.to_string(),
            ..Novel::default()
        };

        novel.name = doc
            .select(sel_series_name())
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "Unknown".to_string());

        for item in doc.select(sel_info_item()) {
            let label = item
                .select(sel_info_name())
                .next()
                .map(|el| el.text().collect::<String>())
                .unwrap_or_default();
            if label.contains("Tác giả") {
                if let Some(value) = item.select(sel_info_value()).next() {
                    novel.author = value.text().collect::<String>().trim().to_string();
                }
            }
        }

        if let Some(summary) = doc.select(sel_summary()).next() {
            novel.summary = summary_inner_html(summary);
        }

        if let Some(cover) = doc.select(sel_main_cover()).next() {
            novel.main_cover = style_background_url(cover).unwrap_or_default();
        }

        for a in doc.select(sel_genres()) {
            let tag = a.text().collect::<String>().trim().to_string();
            if !tag.is_empty() && !novel.tags.contains(&tag) {
                novel.tags.push(tag);
            }
        }

        for section in doc.select(sel_volume_section()) {
            let mut volume = Volume {
                name: section
                    .select(sel_volume_title())
                    .next()
                    .map(|el| el.text().collect::<String>().trim().to_string())
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| "Unknown Volume".to_string()),
                ..Volume::default()
            };

            if let Some(link) = section.select(sel_volume_cover_link()).next() {
                if let Some(href) = link.value().attr("href") {
                    volume.url = reformat_url(base_url, href, primary_domains);
                }
            }
            if let Some(img) = section.select(sel_volume_cover_img()).next() {
                volume.cover_img = style_background_url(img).unwrap_or_default();
            }

            for a in section.select(sel_chapter_links()) {
                let Some(href) = a.value().attr("href") else {
                    continue;
                };
                volume.chapters.push(ChapterRef {
                    name: a.text().collect::<String>().trim().to_string(),
                    url: reformat_url(base_url, href, primary_domains),
                });
            }

            novel.volumes.push(volume);
        }

        novel
    }
}

/// Inner HTML of the summary block with the expand/collapse widgets
/// stripped out.
fn summary_inner_html(summary: ElementRef<'_>) -> String {
    let mut fragment = Html::parse_fragment(&summary.inner_html());
    html_utils::remove_selected(&mut fragment, sel_summary_noise());
    fragment.root_element().inner_html().trim().to_string()
}

/// Pulls the image URL out of an inline `background-image: url(...)`.
fn style_background_url(el: ElementRef<'_>) -> Option<String> {
    let style = el.value().attr("style")?;
    re_style_url()
        .captures(style)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Expands a relative href against the canonical primary host seen in the
/// base URL (first primary when none matches).
pub fn reformat_url(base_url: &str, href: &str, primary_domains: &[String]) -> String {
    if href.starts_with("http") {
        return href.to_string();
    }
    let domain = primary_domains
        .iter()
        .find(|d| base_url.contains(d.as_str()))
        .cloned()
        .or_else(|| primary_domains.first().cloned())
        .unwrap_or_else(|| "docln.net".to_string());
    if href.starts_with('/') {
        format!("https://{domain}{href}")
    } else {
        format!("https://{domain}/{href}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn primaries() -> Vec<String> {
        crate::network::fabric::PRIMARY_DOMAINS
            .iter()
            .map(|d| d.to_string())
            .collect()
    }

    #[test]
    fn rejects_foreign_domain() {
        let err = CatalogParser::validate_url("https://example.com/x", &primaries()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("Invalid domain: example.com"));
        assert!(msg.contains("docln.net"));
    }

    #[test]
    fn accepts_primary_hosts_and_subdomains() {
        assert!(CatalogParser::validate_url("https://docln.net/truyen/5", &primaries()).is_ok());
        assert!(CatalogParser::validate_url("https://ln.hako.vn/truyen/5", &primaries()).is_ok());
        assert!(
            CatalogParser::validate_url("https://www.docln.sbs/truyen/5", &primaries()).is_ok()
        );
        assert!(CatalogParser::validate_url("ftp://docln.net/x", &primaries()).is_err());
    }

    #[test]
    fn parses_minimal_landing_page() {
        let html = r#"<html><body>
            <span class="series-name"> T </span>
            <div class="series-information">
              <div class="info-item"><span class="info-name">Tác giả:</span><span class="info-value"> A </span></div>
              <div class="info-item"><span class="info-name">Tình trạng:</span><span class="info-value">Đang tiến hành</span></div>
            </div>
        </body></html>"#;
        let novel = CatalogParser::parse_document(html, "https://docln.net/truyen/5", &primaries());
        assert_eq!(novel.name, "T");
        assert_eq!(novel.author, "A");
        assert_eq!(novel.url, "https://docln.net/truyen/5");
        assert!(novel.volumes.is_empty());

        let json = novel.to_json().unwrap();
        let back = Novel::from_json(&json).unwrap();
        assert_eq!(back, novel);
    }

    #[test]
    fn parses_volumes_and_chapters_in_order() {
        let html = r#"
            <span class="series-name">N</span>
            <div class="series-cover"><div class="img-in-ratio" style="background-image: url('https://i.hako.vip/main.jpg')"></div></div>
            <div class="series-gernes"><a>Action</a><a> Action </a><a>Drama</a><a></a></div>
            <div class="summary-content"> <p>tóm tắt</p><a class="see-more">xem thêm</a> </div>
            <section class="volume-list">
              <span class="sect-title">Tập 1</span>
              <div class="volume-cover"><a href="/truyen/5/tap-1"><div class="img-in-ratio" style="background-image: url(&quot;https://i.hako.vip/v1.jpg&quot;)"></div></a></div>
              <ul class="list-chapters">
                <li><a href="/truyen/5/c1">Chương 1</a></li>
                <li><a href="https://docln.net/truyen/5/c2">Chương 2</a></li>
              </ul>
            </section>
            <section class="volume-list"><ul class="list-chapters"></ul></section>
        "#;
        let novel = CatalogParser::parse_document(html, "https://ln.hako.vn/truyen/5", &primaries());
        assert_eq!(novel.main_cover, "https://i.hako.vip/main.jpg");
        assert_eq!(novel.tags, vec!["Action".to_string(), "Drama".to_string()]);
        assert_eq!(novel.summary, "<p>tóm tắt</p>");
        assert_eq!(novel.volumes.len(), 2);

        let vol = &novel.volumes[0];
        assert_eq!(vol.name, "Tập 1");
        assert_eq!(vol.url, "https://ln.hako.vn/truyen/5/tap-1");
        assert_eq!(vol.cover_img, "https://i.hako.vip/v1.jpg");
        assert_eq!(vol.chapters.len(), 2);
        assert_eq!(vol.chapters[0].url, "https://ln.hako.vn/truyen/5/c1");
        assert_eq!(vol.chapters[1].url, "https://docln.net/truyen/5/c2");

        assert_eq!(novel.volumes[1].name, "Unknown Volume");
    }

    #[test]
    fn relative_urls_expand_against_observed_host() {
        let p = primaries();
        assert_eq!(
            reformat_url("https://docln.sbs/truyen/9", "/t/9/c1", &p),
            "https://docln.sbs/t/9/c1"
        );
        assert_eq!(
            reformat_url("https://other.example/x", "t/1", &p),
            "https://docln.net/t/1"
        );
        assert_eq!(
            reformat_url("https://docln.net/x", "https://i.hako.vip/a.jpg", &p),
            "https://i.hako.vip/a.jpg"
        );
    }
}
