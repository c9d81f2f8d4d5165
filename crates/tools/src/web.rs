//! Web access and the two web tools.
//!
//! Both tools turn what they fetch into new files of the chat: the text is saved
//! under the upload directory, indexed under the new file's identity, and
//! attached, so later turns can retrieve it like any uploaded document.

use async_trait::async_trait;
use docchat_config::WebConfig;
use docchat_core::chat::ChatFile;
use docchat_core::error::{Error, StoreError, ToolError};
use docchat_core::store::RelationalStore;
use docchat_core::tool::{Tool, ToolResult, text_input, text_input_schema};
use docchat_core::web::{FetchedPage, SearchHit, WebFetcher, WebSearcher};
use docchat_memory::{DocumentIndexer, TextChunker};
use regex::Regex;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, info, warn};

static SCRIPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b.*?</script\s*>").expect("script regex is valid"));
static STYLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style\b.*?</style\s*>").expect("style regex is valid"));
static COMMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("comment regex is valid"));
static BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)</?(p|div|br|h[1-6]|li|tr|section|article|header|footer|table)\b[^>]*>")
        .expect("block tag regex is valid")
});
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("tag regex is valid"));
static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("title regex is valid"));
static RESULT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<a[^>]*class="result__a"[^>]*href="([^"]+)"[^>]*>(.*?)</a>"#)
        .expect("result link regex is valid")
});
static SNIPPET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)class="result__snippet"[^>]*>(.*?)</a>"#).expect("snippet regex is valid")
});

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&amp;", "&")
}

/// Visible text of an HTML document, one block per line.
pub fn html_to_text(html: &str) -> String {
    let s = SCRIPT_RE.replace_all(html, " ");
    let s = STYLE_RE.replace_all(&s, " ");
    let s = COMMENT_RE.replace_all(&s, " ");
    let s = BLOCK_RE.replace_all(&s, "\n");
    let s = TAG_RE.replace_all(&s, "");
    decode_entities(&s)
        .lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn page_title(html: &str) -> Option<String> {
    TITLE_RE
        .captures(html)
        .map(|c| decode_entities(c[1].trim()))
        .filter(|t| !t.is_empty())
}

fn hex_nibble(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let escaped = bytes
                    .get(i + 1)
                    .zip(bytes.get(i + 2))
                    .and_then(|(&hi, &lo)| Some(hex_nibble(hi)? << 4 | hex_nibble(lo)?));
                match escaped {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Resolve DuckDuckGo's redirect links to the target URL.
fn resolve_result_url(href: &str) -> String {
    let href = decode_entities(href);
    match href.split_once("uddg=") {
        Some((_, rest)) => percent_decode(rest.split('&').next().unwrap_or(rest)),
        None if href.starts_with("//") => format!("https:{href}"),
        None => href,
    }
}

/// Parse the result list of DuckDuckGo's HTML endpoint.
pub fn parse_search_results(html: &str, limit: usize) -> Vec<SearchHit> {
    let snippets: Vec<String> = SNIPPET_RE
        .captures_iter(html)
        .map(|c| html_to_text(&c[1]))
        .collect();
    RESULT_RE
        .captures_iter(html)
        .enumerate()
        .map(|(i, c)| SearchHit {
            title: html_to_text(&c[2]),
            url: resolve_result_url(&c[1]),
            snippet: snippets.get(i).cloned().unwrap_or_default(),
        })
        .filter(|h| h.url.starts_with("http"))
        .take(limit)
        .collect()
}

fn build_client(config: &WebConfig) -> Result<reqwest::Client, ToolError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.fetch_timeout_secs))
        .user_agent(concat!("docchat/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ToolError::ConstructionFailed {
            tool_name: "web".into(),
            reason: e.to_string(),
        })
}

fn fetch_err(url: &str, e: impl std::fmt::Display) -> ToolError {
    ToolError::ExecutionFailed {
        tool_name: "web_fetch".into(),
        reason: format!("{url}: {e}"),
    }
}

/// Fetches pages over HTTP and reduces HTML to text.
pub struct HttpWebFetcher {
    client: reqwest::Client,
}

impl HttpWebFetcher {
    pub fn new(config: &WebConfig) -> Result<Self, ToolError> {
        Ok(Self {
            client: build_client(config)?,
        })
    }
}

#[async_trait]
impl WebFetcher for HttpWebFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, ToolError> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ToolError::InvalidArguments(format!("not an http(s) URL: {url}")));
        }
        let response = self.client.get(url).send().await.map_err(|e| fetch_err(url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(fetch_err(url, format!("HTTP {status}")));
        }
        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_none_or(|ct| ct.contains("html"));
        let body = response.text().await.map_err(|e| fetch_err(url, e))?;

        let (title, text) = if is_html {
            (page_title(&body), html_to_text(&body))
        } else {
            (None, body)
        };
        debug!(url, chars = text.len(), "Fetched page");
        Ok(FetchedPage {
            url: url.to_string(),
            title,
            text,
        })
    }
}

/// Web search through DuckDuckGo's HTML endpoint.
pub struct DuckDuckGoSearcher {
    client: reqwest::Client,
    endpoint: String,
}

impl DuckDuckGoSearcher {
    pub fn new(config: &WebConfig) -> Result<Self, ToolError> {
        Ok(Self {
            client: build_client(config)?,
            endpoint: "https://html.duckduckgo.com/html/".into(),
        })
    }
}

#[async_trait]
impl WebSearcher for DuckDuckGoSearcher {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, ToolError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query)])
            .send()
            .await
            .map_err(|e| fetch_err(&self.endpoint, e))?;
        if !response.status().is_success() {
            return Err(fetch_err(&self.endpoint, format!("HTTP {}", response.status())));
        }
        let html = response.text().await.map_err(|e| fetch_err(&self.endpoint, e))?;
        Ok(parse_search_results(&html, limit))
    }
}

/// Truncate to at most `max` characters on a char boundary.
fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Turns fetched pages into indexed files of one chat.
pub struct WebArtifactSink {
    chat_id: String,
    store: Arc<dyn RelationalStore>,
    indexer: Arc<DocumentIndexer>,
    chunker: TextChunker,
    upload_dir: PathBuf,
}

impl WebArtifactSink {
    pub fn new(
        chat_id: impl Into<String>,
        store: Arc<dyn RelationalStore>,
        indexer: Arc<DocumentIndexer>,
        chunker: TextChunker,
        upload_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            chat_id: chat_id.into(),
            store,
            indexer,
            chunker,
            upload_dir: upload_dir.into(),
        }
    }

    /// Save, attach and index one page. A URL already attached to the chat is
    /// returned as is.
    pub async fn attach(&self, page: &FetchedPage) -> Result<ChatFile, Error> {
        let dir = self.upload_dir.join(&self.chat_id);
        let mut file = ChatFile::web_artifact(&self.chat_id, &page.url, "");
        let path = dir.join(format!("{}.txt", file.id));
        file.path_name = path.to_string_lossy().into_owned();

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Internal(format!("create {}: {e}", dir.display())))?;
        tokio::fs::write(&path, &page.text)
            .await
            .map_err(|e| Error::Internal(format!("write {}: {e}", path.display())))?;

        let mut file = match self.store.add_file(file).await {
            Ok(file) => file,
            Err(StoreError::AlreadyExists { .. }) => {
                let _ = tokio::fs::remove_file(&path).await;
                let existing = self
                    .store
                    .list_files(&self.chat_id)
                    .await?
                    .into_iter()
                    .find(|f| f.file_name == page.url)
                    .ok_or_else(|| StoreError::file_not_found(&page.url))?;
                debug!(file_id = %existing.id, url = %page.url, "URL already attached");
                return Ok(existing);
            }
            Err(e) => return Err(e.into()),
        };

        match self.indexer.index_text(&file, &page.text, &self.chunker).await {
            Ok(rows) => {
                file.mark_indexed();
                info!(chat_id = %self.chat_id, file_id = %file.id, url = %page.url, rows, "Web page attached");
            }
            Err(e) => {
                warn!(file_id = %file.id, url = %page.url, error = %e, "Indexing web page failed");
                file.mark_failed(e.to_string());
            }
        }
        self.store.update_file(&file).await?;
        Ok(file)
    }
}

/// Fetch one URL, attach it to the chat, and return its text.
pub struct WebScrapeTool {
    fetcher: Arc<dyn WebFetcher>,
    sink: Arc<WebArtifactSink>,
    max_chars: usize,
}

impl WebScrapeTool {
    pub fn new(fetcher: Arc<dyn WebFetcher>, sink: Arc<WebArtifactSink>, max_chars: usize) -> Self {
        Self {
            fetcher,
            sink,
            max_chars,
        }
    }
}

#[async_trait]
impl Tool for WebScrapeTool {
    fn name(&self) -> &str {
        "web_scrape"
    }

    fn description(&self) -> &str {
        "Fetches a web page by URL and returns its text. The page is also saved to this chat's files."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        text_input_schema("The full http(s) URL to fetch")
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let url = text_input(&arguments)?;
        let page = match self.fetcher.fetch(url.trim()).await {
            Ok(page) => page,
            Err(e) => return Ok(ToolResult::error(format!("Error: {e}"))),
        };
        let file = self.sink.attach(&page).await.map_err(|e| ToolError::ExecutionFailed {
            tool_name: "web_scrape".into(),
            reason: e.to_string(),
        })?;
        Ok(ToolResult::ok(truncate_chars(&page.text, self.max_chars))
            .with_data(serde_json::json!({ "file_id": file.id, "url": page.url })))
    }
}

/// Search the web, attach the top results to the chat, and return their text.
pub struct WebSearchTool {
    searcher: Arc<dyn WebSearcher>,
    fetcher: Arc<dyn WebFetcher>,
    sink: Arc<WebArtifactSink>,
    limit: usize,
    max_chars: usize,
}

impl WebSearchTool {
    pub fn new(
        searcher: Arc<dyn WebSearcher>,
        fetcher: Arc<dyn WebFetcher>,
        sink: Arc<WebArtifactSink>,
        config: &WebConfig,
    ) -> Self {
        Self {
            searcher,
            fetcher,
            sink,
            limit: config.max_search_results,
            max_chars: config.max_fetch_chars,
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Searches the web and returns the text of the top results. The result pages are also saved to this chat's files."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        text_input_schema("The search query")
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let query = text_input(&arguments)?;
        let hits = match self.searcher.search(&query, self.limit).await {
            Ok(hits) => hits,
            Err(e) => return Ok(ToolResult::error(format!("Error: {e}"))),
        };
        if hits.is_empty() {
            return Ok(ToolResult::ok("No web results found."));
        }

        let mut sections = Vec::with_capacity(hits.len());
        let mut file_ids = Vec::with_capacity(hits.len());
        for hit in hits.iter().take(self.limit) {
            let page = match self.fetcher.fetch(&hit.url).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(url = %hit.url, error = %e, "Search result fetch failed; using snippet");
                    sections.push(format!("## {} ({})\n{}", hit.title, hit.url, hit.snippet));
                    continue;
                }
            };
            match self.sink.attach(&page).await {
                Ok(file) => file_ids.push(file.id),
                Err(e) => warn!(url = %hit.url, error = %e, "Attaching search result failed"),
            }
            sections.push(format!(
                "## {} ({})\n{}",
                hit.title,
                hit.url,
                truncate_chars(&page.text, self.max_chars)
            ));
        }
        Ok(ToolResult::ok(sections.join("\n\n")).with_data(serde_json::json!({ "file_ids": file_ids })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::ScriptedLlm;
    use docchat_core::chat::{Chat, FileKind, IndexStatus};
    use docchat_core::vector::{Predicate, VectorStore};
    use docchat_memory::InMemoryVectorStore;
    use docchat_store::InMemoryStore;
    use std::collections::HashMap;

    struct StaticFetcher(HashMap<String, String>);

    #[async_trait]
    impl WebFetcher for StaticFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedPage, ToolError> {
            self.0
                .get(url)
                .map(|text| FetchedPage {
                    url: url.to_string(),
                    title: None,
                    text: text.clone(),
                })
                .ok_or_else(|| fetch_err(url, "HTTP 404"))
        }
    }

    struct StaticSearcher(Vec<SearchHit>);

    #[async_trait]
    impl WebSearcher for StaticSearcher {
        async fn search(&self, _query: &str, limit: usize) -> Result<Vec<SearchHit>, ToolError> {
            Ok(self.0.iter().take(limit).cloned().collect())
        }
    }

    fn hit(n: usize) -> SearchHit {
        SearchHit {
            title: format!("Result {n}"),
            url: format!("https://site{n}.test/"),
            snippet: format!("snippet {n}"),
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<InMemoryStore>,
        vectors: Arc<InMemoryVectorStore>,
        sink: Arc<WebArtifactSink>,
        chat_id: String,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let chat = store.create_chat(Chat::new("alice", "t")).await.unwrap();
        let vectors = Arc::new(InMemoryVectorStore::new());
        let indexer = Arc::new(DocumentIndexer::new(
            Arc::new(ScriptedLlm::new(vec![])),
            vectors.clone(),
            "embed",
        ));
        let sink = Arc::new(WebArtifactSink::new(
            &chat.id,
            store.clone(),
            indexer,
            TextChunker::new(64, 8),
            dir.path(),
        ));
        Fixture {
            _dir: dir,
            store,
            vectors,
            sink,
            chat_id: chat.id,
        }
    }

    fn web_config(max_search_results: usize) -> WebConfig {
        WebConfig {
            max_search_results,
            fetch_timeout_secs: 5,
            max_fetch_chars: 1000,
        }
    }

    #[test]
    fn html_reduces_to_visible_text() {
        let html = "<html><head><title>T &amp; C</title><style>p{}</style></head>\
                    <body><script>var x = 1;</script><h1>Hello</h1><p>World &lt;3</p><!-- hidden --></body></html>";
        assert_eq!(html_to_text(html), "T & C\nHello\nWorld <3");
        assert_eq!(page_title(html).as_deref(), Some("T & C"));
    }

    #[test]
    fn parses_duckduckgo_results() {
        let html = r##"
            <a rel="nofollow" class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fexample.com%2Fa%3Fb%3D1&amp;rut=x">Example <b>A</b></a>
            <a class="result__snippet" href="#">First snippet</a>
            <a rel="nofollow" class="result__a" href="https://example.org/">Example B</a>
            <a class="result__snippet" href="#">Second</a>"##;
        let hits = parse_search_results(html, 5);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].url, "https://example.com/a?b=1");
        assert_eq!(hits[0].title, "Example A");
        assert_eq!(hits[0].snippet, "First snippet");
        assert_eq!(parse_search_results(html, 1).len(), 1);
    }

    #[test]
    fn malformed_escapes_next_to_multibyte_text_pass_through() {
        assert_eq!(percent_decode("%aé"), "%aé");
        assert_eq!(percent_decode("caf%C3%A9%"), "café%");
        assert_eq!(percent_decode("%zz+x"), "%zz x");

        let html = r#"<a class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fx.com%2F%aé&amp;rut=y">Odd</a>"#;
        let hits = parse_search_results(html, 5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].url, "https://x.com/%aé");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }

    #[tokio::test]
    async fn scrape_attaches_and_indexes_a_new_file() {
        let fx = fixture().await;
        let fetcher = Arc::new(StaticFetcher(HashMap::from([(
            "https://docs.test/page".to_string(),
            "Rust ownership rules explained in detail".to_string(),
        )])));
        let tool = WebScrapeTool::new(fetcher, fx.sink.clone(), 10);

        let result = tool.execute(serde_json::json!({"input": "https://docs.test/page"})).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output, "Rust owner");

        let files = fx.store.list_files(&fx.chat_id).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].kind, FileKind::WebArtifact);
        assert_eq!(files[0].index_status, IndexStatus::Done);
        assert_eq!(fx.vectors.count(&[Predicate::file(&files[0].id)]).await.unwrap(), 1);
        assert!(std::path::Path::new(&files[0].path_name).exists());

        // Scraping the same URL again reuses the attached file.
        tool.execute(serde_json::json!("https://docs.test/page")).await.unwrap();
        assert_eq!(fx.store.list_files(&fx.chat_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn scrape_fetch_failure_is_an_observation() {
        let fx = fixture().await;
        let tool = WebScrapeTool::new(Arc::new(StaticFetcher(HashMap::new())), fx.sink.clone(), 10);
        let result = tool.execute(serde_json::json!("https://missing.test/")).await.unwrap();
        assert!(!result.success);
        assert!(result.output.starts_with("Error: "));
        assert!(fx.store.list_files(&fx.chat_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_attaches_top_results_and_falls_back_to_snippets() {
        let fx = fixture().await;
        let searcher = Arc::new(StaticSearcher((1..=5).map(hit).collect()));
        let fetcher = Arc::new(StaticFetcher(HashMap::from([
            ("https://site1.test/".to_string(), "page one text".to_string()),
            ("https://site3.test/".to_string(), "page three text".to_string()),
        ])));
        let tool = WebSearchTool::new(searcher, fetcher, fx.sink.clone(), &web_config(3));

        let result = tool.execute(serde_json::json!({"input": "anything"})).await.unwrap();
        assert!(result.output.contains("page one text"));
        assert!(result.output.contains("snippet 2"));
        assert!(result.output.contains("page three text"));
        assert!(!result.output.contains("Result 4"));
        assert_eq!(result.data.unwrap()["file_ids"].as_array().unwrap().len(), 2);
        assert_eq!(fx.store.list_files(&fx.chat_id).await.unwrap().len(), 2);
    }
}
