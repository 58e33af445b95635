//! Outbound web access for the agent: rate-limited search and fetch with
//! SSRF validation on every hop. Redirects are never followed blindly; the
//! client disables automatic redirects and re-validates each `Location`
//! target itself.

use castellan_core::WebConfig;
use rand::seq::SliceRandom;
use regex::Regex;
use reqwest::Url;
use reqwest::blocking::Client;
use reqwest::header;
use scraper::{Html, Selector};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

mod checker;
mod rate_limit;

pub use checker::{SafeUrlChecker, UrlPolicy};
pub use rate_limit::RateLimiter;

const SEARCH_ENDPOINT: &str = "https://html.duckduckgo.com/html/";
const MAX_REDIRECTS: usize = 5;
const RATE_WAIT: Duration = Duration::from_secs(10);
const SNIPPET_CHAR_CAP: usize = 300;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:126.0) Gecko/20100101 Firefox/126.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
];

#[derive(thiserror::Error, Debug)]
pub enum WebError {
    #[error("empty search query")]
    EmptyQuery,
    #[error("empty URL")]
    EmptyUrl,
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("rate limit exceeded, try again shortly")]
    RateLimited,
    #[error("URL blocked by security policy: {0}")]
    Blocked(String),
    #[error("redirect target blocked by security policy: {0}")]
    RedirectBlocked(String),
    #[error("too many redirects (limit {0})")]
    TooManyRedirects(usize),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("request failed: {0}")]
    Transport(String),
    #[error("HTTP error status {0}")]
    HttpStatus(u16),
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
    #[error("no readable content at {0}")]
    EmptyBody(String),
}

#[derive(Debug, Clone, PartialEq)]
struct SearchResult {
    title: String,
    url: String,
    snippet: String,
}

pub struct WebClient {
    http: Client,
    policy: Arc<dyn UrlPolicy>,
    limiter: Arc<RateLimiter>,
    max_fetch_bytes: usize,
}

impl WebClient {
    pub fn new(
        cfg: &WebConfig,
        policy: Arc<dyn UrlPolicy>,
        limiter: Arc<RateLimiter>,
    ) -> anyhow::Result<Self> {
        let http = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(cfg.request_timeout_seconds))
            .build()?;
        Ok(Self {
            http,
            policy,
            limiter,
            max_fetch_bytes: cfg.max_fetch_bytes,
        })
    }

    /// Search the web and render numbered title/URL/snippet blocks.
    pub fn search(&self, query: &str, max_results: usize) -> Result<String, WebError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(WebError::EmptyQuery);
        }
        if !self.limiter.wait(RATE_WAIT) {
            return Err(WebError::RateLimited);
        }

        let response = self
            .http
            .get(search_endpoint_url(query)?)
            .header(header::USER_AGENT, random_user_agent())
            .header(
                header::ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .header(header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .send()
            .map_err(classify_transport)?;

        if !response.status().is_success() {
            return Err(WebError::HttpStatus(response.status().as_u16()));
        }
        let body = response.text().map_err(classify_transport)?;
        let results = parse_search_results(&body, max_results);
        Ok(render_search_results(query, &results))
    }

    /// Fetch a URL and return readable text, prefixed with the final URL.
    pub fn fetch(&self, url: &str) -> Result<String, WebError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(WebError::EmptyUrl);
        }
        let mut current = Url::parse(url).map_err(|e| WebError::InvalidUrl(e.to_string()))?;
        if !self.policy.allows(&current) {
            return Err(WebError::Blocked(current.to_string()));
        }
        if !self.limiter.wait(RATE_WAIT) {
            return Err(WebError::RateLimited);
        }

        let mut hops = 0usize;
        loop {
            let response = self
                .http
                .get(current.clone())
                .header(header::USER_AGENT, random_user_agent())
                .send()
                .map_err(classify_transport)?;

            if response.status().is_redirection() {
                let location = response
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        WebError::Transport("redirect without Location header".to_string())
                    })?;
                let next = current
                    .join(location)
                    .map_err(|e| WebError::InvalidUrl(e.to_string()))?;
                if !self.policy.allows(&next) {
                    return Err(WebError::RedirectBlocked(next.to_string()));
                }
                hops += 1;
                if hops > MAX_REDIRECTS {
                    return Err(WebError::TooManyRedirects(MAX_REDIRECTS));
                }
                current = next;
                continue;
            }

            if !response.status().is_success() {
                return Err(WebError::HttpStatus(response.status().as_u16()));
            }

            let content_type = response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            if !is_textual_content_type(&content_type) {
                return Err(WebError::UnsupportedContentType(content_type));
            }

            // Stream at most one byte past the cap so truncation is
            // detectable without buffering an unbounded body.
            let mut buf: Vec<u8> = Vec::new();
            response
                .take(self.max_fetch_bytes as u64 + 1)
                .read_to_end(&mut buf)
                .map_err(|e| WebError::Transport(e.to_string()))?;
            let truncated = buf.len() > self.max_fetch_bytes;
            buf.truncate(self.max_fetch_bytes);
            let body = String::from_utf8_lossy(&buf).into_owned();

            let text = if content_type.contains("html") || body.trim_start().starts_with('<') {
                extract_text(&body)
            } else {
                body.trim().to_string()
            };
            if text.is_empty() {
                return Err(WebError::EmptyBody(current.to_string()));
            }

            let mut out = format!("Content from {current}:\n\n{text}");
            if truncated {
                out.push_str("\n\n[truncated]");
            }
            return Ok(out);
        }
    }
}

fn search_endpoint_url(query: &str) -> Result<Url, WebError> {
    Url::parse_with_params(SEARCH_ENDPOINT, &[("q", query)])
        .map_err(|e| WebError::InvalidUrl(e.to_string()))
}

fn classify_transport(err: reqwest::Error) -> WebError {
    if err.is_timeout() {
        WebError::Timeout(err.to_string())
    } else {
        WebError::Transport(err.to_string())
    }
}

fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// Accepts textual payloads only. Matching by substring keeps parameters
/// and vendor subtypes ("application/ld+json") without a MIME parser.
/// A missing header is treated as textual.
fn is_textual_content_type(content_type: &str) -> bool {
    if content_type.trim().is_empty() {
        return true;
    }
    let lowered = content_type.to_ascii_lowercase();
    ["text", "html", "json", "xml", "javascript"]
        .iter()
        .any(|marker| lowered.contains(marker))
}

fn parse_search_results(html: &str, max_results: usize) -> Vec<SearchResult> {
    let doc = Html::parse_document(html);
    let result_sel = Selector::parse("div.result").expect("valid selector");
    let title_sel = Selector::parse("a.result__a").expect("valid selector");
    let snippet_sel = Selector::parse("a.result__snippet, .result__snippet")
        .expect("valid selector");

    let mut results = Vec::new();
    for container in doc.select(&result_sel) {
        let Some(anchor) = container.select(&title_sel).next() else {
            continue;
        };
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let title = collapse_whitespace(&anchor.text().collect::<String>());
        if title.is_empty() {
            continue;
        }
        let snippet = container
            .select(&snippet_sel)
            .next()
            .map(|s| collapse_whitespace(&s.text().collect::<String>()))
            .unwrap_or_default();
        results.push(SearchResult {
            title,
            url: resolve_result_url(href),
            snippet: cap_chars(&snippet, SNIPPET_CHAR_CAP),
        });
        if results.len() >= max_results {
            return results;
        }
    }

    if !results.is_empty() {
        return results;
    }

    // Provider markup drifts; fall back to a plain anchor scan so a selector
    // change degrades to lower-quality results instead of zero results.
    let anchor_sel = Selector::parse("a[href]").expect("valid selector");
    for anchor in doc.select(&anchor_sel) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        if !href.contains("uddg=") && !href.starts_with("http") {
            continue;
        }
        let title = collapse_whitespace(&anchor.text().collect::<String>());
        if title.is_empty() {
            continue;
        }
        results.push(SearchResult {
            title,
            url: resolve_result_url(href),
            snippet: String::new(),
        });
        if results.len() >= max_results {
            break;
        }
    }
    results
}

/// DuckDuckGo wraps result links in a redirect whose `uddg` query parameter
/// carries the real destination.
fn resolve_result_url(href: &str) -> String {
    let absolute = if href.starts_with("//") {
        format!("https:{href}")
    } else {
        href.to_string()
    };
    if let Ok(parsed) = Url::parse(&absolute) {
        if let Some((_, target)) = parsed.query_pairs().find(|(key, _)| key == "uddg") {
            return target.into_owned();
        }
    }
    absolute
}

fn render_search_results(query: &str, results: &[SearchResult]) -> String {
    if results.is_empty() {
        return format!("No search results found for '{query}'.");
    }
    let mut out = format!("Search results for '{query}':\n\n");
    for (index, result) in results.iter().enumerate() {
        out.push_str(&format!("{}. {}\n   {}\n", index + 1, result.title, result.url));
        if !result.snippet.is_empty() {
            out.push_str(&format!("   {}\n", result.snippet));
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}

/// Strip markup and return readable text with paragraph structure kept.
fn extract_text(html: &str) -> String {
    let without_scripts = strip_regex(html, r"(?is)<script[^>]*>.*?</script>", " ");
    let without_styles = strip_regex(&without_scripts, r"(?is)<style[^>]*>.*?</style>", " ");
    let without_noscript = strip_regex(&without_styles, r"(?is)<noscript[^>]*>.*?</noscript>", " ");
    let with_line_breaks = strip_regex(
        &without_noscript,
        r"(?i)</?(p|div|h[1-6]|li|tr|td|th|br)\b[^>]*>",
        "\n",
    );
    let without_tags = strip_regex(&with_line_breaks, r"(?is)<[^>]+>", " ");
    normalize_text(&decode_common_html_entities(&without_tags))
}

fn strip_regex(input: &str, pattern: &str, replacement: &str) -> String {
    match Regex::new(pattern) {
        Ok(regex) => regex.replace_all(input, replacement).into_owned(),
        Err(_) => input.to_string(),
    }
}

fn decode_common_html_entities(input: &str) -> String {
    let mut decoded = input.replace("&nbsp;", " ");
    decoded = decoded.replace("&amp;", "&");
    decoded = decoded.replace("&lt;", "<");
    decoded = decoded.replace("&gt;", ">");
    decoded = decoded.replace("&quot;", "\"");
    decoded.replace("&#39;", "'")
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Collapse horizontal whitespace per line and squeeze blank-line runs.
fn normalize_text(input: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut blank_run = 0usize;
    for line in input.lines() {
        let collapsed = collapse_whitespace(line);
        if collapsed.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        lines.push(collapsed);
    }
    lines.join("\n").trim().to_string()
}

fn cap_chars(input: &str, cap: usize) -> String {
    if input.chars().count() <= cap {
        return input.to_string();
    }
    input.chars().take(cap).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;

    /// Policy that admits everything; used so fixtures on 127.0.0.1 are
    /// reachable while redirect handling is under test.
    struct AllowAll;
    impl UrlPolicy for AllowAll {
        fn allows(&self, _url: &Url) -> bool {
            true
        }
    }

    /// Policy that admits everything except one hostname.
    struct BlockHost(&'static str);
    impl UrlPolicy for BlockHost {
        fn allows(&self, url: &Url) -> bool {
            url.host_str() != Some(self.0)
        }
    }

    fn serve_once(response: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fixture");
        let addr = listener.local_addr().expect("fixture addr");
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut request = [0u8; 2048];
                let _ = std::io::Read::read(&mut stream, &mut request);
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}/")
    }

    fn test_client(policy: Arc<dyn UrlPolicy>, max_fetch_bytes: usize) -> WebClient {
        let cfg = WebConfig {
            max_requests_per_minute: 100,
            request_timeout_seconds: 5,
            max_fetch_bytes,
        };
        let limiter = Arc::new(RateLimiter::new(100, Duration::from_secs(60)));
        WebClient::new(&cfg, policy, limiter).expect("client")
    }

    #[test]
    fn search_endpoint_url_encodes_the_query() {
        let url = search_endpoint_url("borrow checker & lifetimes").expect("url");
        assert_eq!(url.host_str(), Some("html.duckduckgo.com"));
        assert_eq!(
            url.query_pairs().next(),
            Some(("q".into(), "borrow checker & lifetimes".into()))
        );
    }

    #[test]
    fn search_rejects_empty_query_without_network() {
        let client = test_client(Arc::new(AllowAll), 1_000);
        assert!(matches!(client.search("   ", 5), Err(WebError::EmptyQuery)));
    }

    #[test]
    fn fetch_rejects_empty_url_without_network() {
        let client = test_client(Arc::new(AllowAll), 1_000);
        assert!(matches!(client.fetch(""), Err(WebError::EmptyUrl)));
    }

    #[test]
    fn fetch_blocks_unsafe_initial_url() {
        let client = test_client(Arc::new(SafeUrlChecker::new()), 1_000);
        assert!(matches!(
            client.fetch("http://169.254.169.254/latest/meta-data/"),
            Err(WebError::Blocked(_))
        ));
    }

    #[test]
    fn fetch_blocks_redirect_target() {
        let url = serve_once(
            "HTTP/1.1 302 Found\r\nLocation: http://internal.example/secret\r\nContent-Length: 0\r\n\r\n"
                .to_string(),
        );
        let client = test_client(Arc::new(BlockHost("internal.example")), 1_000);
        let err = client.fetch(&url).expect_err("redirect must be blocked");
        assert!(matches!(err, WebError::RedirectBlocked(_)));
        assert!(err.to_string().contains("redirect target blocked"));
    }

    #[test]
    fn fetch_truncates_oversized_body() {
        let body = "A".repeat(200);
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let client = test_client(Arc::new(AllowAll), 64);
        let out = client.fetch(&serve_once(response)).expect("fetch");
        assert!(out.ends_with("[truncated]"));
        assert!(out.contains("AAAA"));
    }

    #[test]
    fn fetch_rejects_binary_content_type() {
        let response = "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: 4\r\n\r\n\x7fELF".to_string();
        let client = test_client(Arc::new(AllowAll), 1_000);
        assert!(matches!(
            client.fetch(&serve_once(response)),
            Err(WebError::UnsupportedContentType(_))
        ));
    }

    #[test]
    fn fetch_extracts_html_and_prefixes_final_url() {
        let body = "<html><body><h1>Hello</h1><p>World</p><script>alert('x')</script></body></html>";
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let url = serve_once(response);
        let client = test_client(Arc::new(AllowAll), 10_000);
        let out = client.fetch(&url).expect("fetch");
        assert!(out.starts_with(&format!("Content from {url}")));
        assert!(out.contains("Hello"));
        assert!(out.contains("World"));
        assert!(!out.contains("alert"));
    }

    #[test]
    fn fetch_reports_empty_extracted_text() {
        let body = "<html><body><script>only_code()</script></body></html>";
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let client = test_client(Arc::new(AllowAll), 10_000);
        assert!(matches!(
            client.fetch(&serve_once(response)),
            Err(WebError::EmptyBody(_))
        ));
    }

    #[test]
    fn parses_provider_results_and_unwraps_redirect_param() {
        let html = r##"
            <html><body>
              <div class="result results_links web-result">
                <h2 class="result__title">
                  <a rel="nofollow" class="result__a"
                     href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fexample.com%2Fdocs&rut=abc">
                    Example Docs
                  </a>
                </h2>
                <a class="result__snippet" href="#">Documentation &amp; guides</a>
              </div>
              <div class="result">
                <a class="result__a" href="https://second.example/page">Second Page</a>
              </div>
            </body></html>
        "##;
        let results = parse_search_results(html, 5);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].title, "Example Docs");
        assert_eq!(results[0].url, "https://example.com/docs");
        assert_eq!(results[0].snippet, "Documentation & guides");
        assert_eq!(results[1].url, "https://second.example/page");
    }

    #[test]
    fn falls_back_to_anchor_scan_when_markup_drifts() {
        let html = r##"
            <html><body>
              <a href="https://example.com/a">Alpha</a>
              <a href="/relative/ignored">Skip</a>
              <a href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fexample.com%2Fb">Beta</a>
            </body></html>
        "##;
        let results = parse_search_results(html, 5);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].url, "https://example.com/a");
        assert_eq!(results[1].url, "https://example.com/b");
    }

    #[test]
    fn caps_results_at_requested_maximum() {
        let mut html = String::from("<html><body>");
        for i in 0..10 {
            html.push_str(&format!(
                r#"<div class="result"><a class="result__a" href="https://example.com/{i}">R{i}</a></div>"#
            ));
        }
        html.push_str("</body></html>");
        let results = parse_search_results(&html, 3);
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn renders_no_results_message() {
        let rendered = render_search_results("obscure query", &[]);
        assert_eq!(rendered, "No search results found for 'obscure query'.");
    }

    #[test]
    fn renders_numbered_blocks() {
        let results = vec![SearchResult {
            title: "Title".into(),
            url: "https://example.com".into(),
            snippet: "Snippet".into(),
        }];
        let rendered = render_search_results("q", &results);
        assert!(rendered.starts_with("Search results for 'q':"));
        assert!(rendered.contains("1. Title"));
        assert!(rendered.contains("   https://example.com"));
        assert!(rendered.contains("   Snippet"));
    }

    #[test]
    fn content_type_gate_accepts_textual_variants() {
        assert!(is_textual_content_type("text/html; charset=utf-8"));
        assert!(is_textual_content_type("application/json"));
        assert!(is_textual_content_type("application/ld+json"));
        assert!(is_textual_content_type("application/xml"));
        assert!(is_textual_content_type(""));
        assert!(!is_textual_content_type("application/octet-stream"));
        assert!(!is_textual_content_type("image/png"));
    }

    #[test]
    fn normalize_text_squeezes_blank_runs() {
        let input = "a   b\n\n\n\nc\td";
        assert_eq!(normalize_text(input), "a b\n\nc d");
    }

    #[test]
    fn entities_are_decoded() {
        assert_eq!(
            decode_common_html_entities("a &amp; b &lt;c&gt; &quot;d&quot; &#39;e&#39;&nbsp;f"),
            "a & b <c> \"d\" 'e' f"
        );
    }
}
