//! End-to-end tests for DocChat turns.
//!
//! These wire the real store, ingestion, tool factory, memory, agent and
//! streaming coordinator together; only the LLM is scripted.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use docchat_agent::{ERROR_SUFFIX, GENERIC_STREAM_ERROR, Persisted, RunEnd, TurnRunner, WireEvent};
use docchat_config::AppConfig;
use docchat_core::chat::{Chat, ChatFile, ChatMessage, IndexStatus, SqlDialect};
use docchat_core::error::ProviderError;
use docchat_core::message::{Message, MessageToolCall, Role};
use docchat_core::provider::{
    EmbeddingRequest, EmbeddingResponse, Provider, ProviderRequest, ProviderResponse, StreamChunk,
};
use docchat_core::store::RelationalStore;
use docchat_core::tool::ToolCall;
use docchat_ingest::Ingestor;
use docchat_memory::{DocumentIndexer, InMemoryVectorStore, MemorySettings, TextChunker, create_memory};
use docchat_store::InMemoryStore;
use docchat_tools::{FileSelection, MemorySqlServers, ToolEnv, ToolFactory, detect_sql_dump_type};
use futures::StreamExt;
use tokio::sync::mpsc;

// ── Scripted provider ────────────────────────────────────────────────────

#[derive(Clone)]
enum Reply {
    Text(String),
    Tools(Vec<MessageToolCall>),
    /// Stream this text, then fail.
    Broken(String),
}

/// Plays back replies in order; when the script runs out, `fallback` repeats.
struct ScriptedProvider {
    script: Mutex<VecDeque<Reply>>,
    fallback: Option<Reply>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    fn new(replies: Vec<Reply>) -> Self {
        Self {
            script: Mutex::new(replies.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    fn text(text: &str) -> Self {
        Self::new(vec![Reply::Text(text.into())])
    }

    fn always(reply: Reply) -> Self {
        Self {
            fallback: Some(reply),
            ..Self::new(Vec::new())
        }
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn next(&self, request: ProviderRequest) -> Result<Reply, ProviderError> {
        self.requests.lock().unwrap().push(request);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| ProviderError::NotConfigured("script exhausted".into()))
    }
}

fn response(message: Message) -> ProviderResponse {
    ProviderResponse {
        message,
        usage: None,
        model: "e2e-model".into(),
        metadata: serde_json::Map::new(),
    }
}

fn deltas(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(4).map(|c| c.iter().collect()).collect()
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "e2e_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        match self.next(request)? {
            Reply::Text(text) => Ok(response(Message::assistant(text))),
            Reply::Tools(calls) => Ok(response(Message::assistant("").with_tool_calls(calls))),
            Reply::Broken(_) => Err(ProviderError::StreamInterrupted("connection reset".into())),
        }
    }

    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> Result<mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError> {
        let (text, tool_calls, broken) = match self.next(request)? {
            Reply::Text(text) => (text, Vec::new(), false),
            Reply::Tools(calls) => (String::new(), calls, false),
            Reply::Broken(text) => (text, Vec::new(), true),
        };

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            for delta in deltas(&text) {
                let chunk = StreamChunk {
                    content: Some(delta),
                    tool_calls: Vec::new(),
                    done: false,
                    usage: None,
                };
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
            let last = if broken {
                Err(ProviderError::StreamInterrupted("connection reset".into()))
            } else {
                Ok(StreamChunk {
                    content: None,
                    tool_calls,
                    done: true,
                    usage: None,
                })
            };
            let _ = tx.send(last).await;
        });
        Ok(rx)
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, ProviderError> {
        Ok(EmbeddingResponse {
            embeddings: request.inputs.iter().map(|t| bag_of_words(t)).collect(),
            model: request.model,
            usage: None,
        })
    }

    fn supports_embeddings(&self) -> bool {
        true
    }
}

/// A 32-bucket bag of words; similar wording lands close together.
fn bag_of_words(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; 32];
    for word in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let h = word.bytes().fold(17u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        v[(h % 32) as usize] += 1.0;
    }
    v
}

fn tool_call(name: &str, input: &str) -> MessageToolCall {
    MessageToolCall {
        id: format!("call_{name}"),
        name: name.into(),
        arguments: serde_json::json!({ "input": input }).to_string(),
    }
}

// ── Harness ──────────────────────────────────────────────────────────────

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<InMemoryStore>,
    vectors: Arc<InMemoryVectorStore>,
    indexer: Arc<DocumentIndexer>,
    sql: MemorySqlServers,
    ingestor: Arc<Ingestor>,
    provider: Arc<ScriptedProvider>,
    runner: TurnRunner,
}

fn harness(provider: ScriptedProvider) -> Harness {
    harness_with(provider, |_| {})
}

fn harness_with(provider: ScriptedProvider, configure: impl FnOnce(&mut AppConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.memory.vector_recall = false;
    config.ingest.upload_dir = dir.path().to_path_buf();
    configure(&mut config);
    let config = Arc::new(config);

    let store = Arc::new(InMemoryStore::new());
    let vectors = Arc::new(InMemoryVectorStore::new());
    let provider = Arc::new(provider);
    let indexer = Arc::new(DocumentIndexer::new(provider.clone(), vectors.clone(), "embed"));
    let sql = MemorySqlServers::new();
    let ingestor = Arc::new(Ingestor::new(
        &config.ingest,
        store.clone(),
        indexer.clone(),
        Arc::new(sql.clone()),
    ));
    let runner = TurnRunner::new(config, store.clone(), provider.clone(), indexer.clone()).with_sql(Arc::new(sql.clone()));

    Harness {
        _dir: dir,
        store,
        vectors,
        indexer,
        sql,
        ingestor,
        provider,
        runner,
    }
}

impl Harness {
    async fn chat(&self, user: &str) -> Chat {
        self.store.create_chat(Chat::new(user, "e2e")).await.unwrap()
    }

    /// Attach a document whose text is indexed directly, as if extraction succeeded.
    async fn indexed_document(&self, chat_id: &str, name: &str, text: &str) -> ChatFile {
        let mut file = ChatFile::new(chat_id, name, format!("/nonexistent/{name}"), "application/pdf");
        file.mark_indexed();
        let file = self.store.add_file(file).await.unwrap();
        self.indexer
            .index_text(&file, text, &TextChunker::new(120, 10))
            .await
            .unwrap();
        file
    }

    async fn upload(&self, chat_id: &str, name: &str, mime: &str, body: &str) -> ChatFile {
        let file = self
            .ingestor
            .store_upload(chat_id, name, mime, body.as_bytes())
            .await
            .unwrap();
        let file = self.ingestor.ingest(file).await;
        assert_eq!(file.index_status, IndexStatus::Done, "{:?}", file.index_error);
        file
    }

    fn tool_env(&self) -> ToolEnv {
        ToolEnv::new(self.provider.clone(), "e2e-model", "embed", self.vectors.clone())
    }

    async fn message_count(&self, chat_id: &str) -> usize {
        self.store.count_messages(chat_id).await.unwrap()
    }

    async fn stored(&self, chat_id: &str) -> Vec<ChatMessage> {
        self.store.recent_messages(chat_id, 100).await.unwrap()
    }

    async fn assistant_text(&self, chat_id: &str) -> String {
        self.stored(chat_id)
            .await
            .into_iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.text)
            .unwrap_or_default()
    }

    async fn wait_for_messages(&self, chat_id: &str, expected: usize) -> usize {
        for _ in 0..200 {
            if self.message_count(chat_id).await >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.message_count(chat_id).await
    }
}

fn streamed_text(events: &[WireEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            WireEvent::Value(delta) => Some(delta.as_str()),
            _ => None,
        })
        .collect()
}

const MYSQL_DUMP: &str = "CREATE DATABASE shop;\nUSE shop;\n\
    CREATE TABLE `orders` (`id` int NOT NULL AUTO_INCREMENT, `total` int) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4;\n\
    LOCK TABLES `orders` WRITE;\nINSERT INTO `orders` VALUES (1,10),(2,32);\nUNLOCK TABLES;\n";

const POSTGRES_DUMP: &str = "SET search_path = public;\n\
    CREATE TABLE people (id bigserial, name text);\nINSERT INTO people VALUES (1, 'Ada'), (2, 'Grace');\n";

// ── Isolation ────────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_document_tools_never_return_another_chats_content() {
    let h = harness(ScriptedProvider::new(Vec::new()));
    let alice = h.chat("alice").await;
    let bob = h.chat("bob").await;
    h.indexed_document(&alice.id, "alpha.pdf", "The alpha project ships in March with a small budget.")
        .await;
    h.indexed_document(&bob.id, "beta.pdf", "The beta launch code is 7741. Beta ships in June.")
        .await;

    let files = h.store.list_files(&alice.id).await.unwrap();
    let tools = ToolFactory::new(h.tool_env()).build(&files, None).await;
    assert_eq!(tools.names(), vec!["document_tool_0"]);

    for query in ["beta launch code", "When does beta ship in June?", "7741", "alpha project"] {
        let call = ToolCall {
            id: "c1".into(),
            name: "document_tool_0".into(),
            arguments: serde_json::json!({ "input": query }),
        };
        let result = tools.execute(&call).await.unwrap();
        assert!(!result.output.contains("7741"), "query {query:?} leaked: {}", result.output);
        assert!(!result.output.contains("June"), "query {query:?} leaked: {}", result.output);
    }
}

// ── Exactly-once persistence and stream reassembly ───────────────────────

#[tokio::test]
async fn e2e_successful_stream_persists_one_pair_matching_the_deltas() {
    let answer = "  The report covers three regions and two quarters.  ";
    let h = harness(ScriptedProvider::text(answer));
    let chat = h.chat("alice").await;

    let events: Vec<WireEvent> = h.runner.stream(&chat, "Summarize", None).await.unwrap().collect().await;
    assert_eq!(events.last(), Some(&WireEvent::Done));
    assert!(events.iter().filter(|e| matches!(e, WireEvent::Value(_))).count() > 1);

    assert_eq!(h.message_count(&chat.id).await, 2);
    let stored = h.stored(&chat.id).await;
    assert_eq!(
        stored.iter().filter(|m| m.role == Role::User).map(|m| m.text.as_str()).collect::<Vec<_>>(),
        vec!["Summarize"]
    );
    assert_eq!(h.assistant_text(&chat.id).await, streamed_text(&events).trim());
}

#[tokio::test]
async fn e2e_failed_stream_persists_partial_text_with_error_marker() {
    let h = harness(ScriptedProvider::new(vec![Reply::Broken("Revenue grew by".into())]));
    let chat = h.chat("alice").await;

    let events: Vec<WireEvent> = h.runner.stream(&chat, "How did revenue do?", None).await.unwrap().collect().await;
    assert_eq!(events.last(), Some(&WireEvent::Error(GENERIC_STREAM_ERROR.into())));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(!events.iter().any(|e| matches!(e, WireEvent::Error(m) if m.contains("connection reset"))));

    assert_eq!(h.message_count(&chat.id).await, 2);
    let stored = h.assistant_text(&chat.id).await;
    assert!(stored.starts_with(streamed_text(&events).trim()));
    assert!(stored.ends_with(ERROR_SUFFIX));
}

#[tokio::test]
async fn e2e_abandoned_stream_still_persists_once() {
    let h = harness(ScriptedProvider::text("This answer is long enough to arrive in several pieces."));
    let chat = h.chat("alice").await;

    let mut stream = Box::pin(h.runner.stream(&chat, "Tell me", None).await.unwrap());
    let first = stream.next().await;
    assert!(matches!(first, Some(WireEvent::Value(_))));
    drop(stream);

    assert_eq!(h.wait_for_messages(&chat.id, 2).await, 2);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.message_count(&chat.id).await, 2);
}

#[tokio::test]
async fn e2e_turn_on_a_deleted_chat_writes_nothing() {
    let h = harness(ScriptedProvider::text("Nobody will read this."));
    let chat = h.chat("alice").await;

    let stream = h.runner.stream(&chat, "Hello", None).await.unwrap();
    h.store.delete_chat(&chat.id).await.unwrap();
    let events: Vec<WireEvent> = stream.collect().await;

    assert_eq!(events.last(), Some(&WireEvent::Done));
    assert_eq!(h.message_count(&chat.id).await, 0);
}

#[tokio::test]
async fn e2e_consecutive_turns_each_add_exactly_two_messages() {
    let h = harness(ScriptedProvider::new(vec![
        Reply::Text("First.".into()),
        Reply::Broken("Sec".into()),
        Reply::Text("Third.".into()),
    ]));
    let chat = h.chat("alice").await;

    for (turn, question) in ["one", "two", "three"].into_iter().enumerate() {
        let _: Vec<WireEvent> = h.runner.stream(&chat, question, None).await.unwrap().collect().await;
        assert_eq!(h.message_count(&chat.id).await, 2 * (turn + 1));
    }
}

// ── Memory budget ────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_short_term_history_stays_within_budget_after_flush() {
    let provider: Arc<ScriptedProvider> = Arc::new(ScriptedProvider::always(Reply::Text(
        r#"["The user is planning a trip"]"#.into(),
    )));
    let prior: Vec<ChatMessage> = (0..40)
        .flat_map(|i| {
            [
                ChatMessage::user("c1", format!("Question {i}: what about the itinerary for day {i} of the trip?")),
                ChatMessage::assistant("c1", format!("Answer {i}: on day {i} you visit the old town and the harbour.")),
            ]
        })
        .collect();

    for token_limit in [120, 300, 1000, 4000] {
        let settings = MemorySettings {
            token_limit,
            chat_history_token_ratio: 0.6,
            token_flush_size: 40,
            history_window: 100,
            vector_recall: false,
            ..MemorySettings::default()
        };
        let memory = create_memory("c1", provider.clone(), &prior, None, &settings).await.unwrap();
        assert!(
            memory.short_term_tokens() <= settings.short_term_budget() + settings.token_flush_size,
            "limit {token_limit}: {} tokens over budget {}",
            memory.short_term_tokens(),
            settings.short_term_budget()
        );
        assert!(memory.history().first().is_none_or(|m| m.role == Role::User));
    }
}

// ── Tool omission ────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_no_eligible_files_means_no_tools() {
    let h = harness(ScriptedProvider::new(Vec::new()));
    let chat = h.chat("alice").await;
    let factory = ToolFactory::new(h.tool_env()).with_sql(Arc::new(h.sql.clone()));

    assert!(factory.build(&[], None).await.is_empty());

    // Pending documents and unloaded dumps have nothing to query yet.
    let pending_doc = h
        .store
        .add_file(ChatFile::new(&chat.id, "draft.pdf", "/nonexistent/draft.pdf", "application/pdf"))
        .await
        .unwrap();
    let pending_dump = h
        .store
        .add_file(ChatFile::new(&chat.id, "shop.sql", "/nonexistent/shop.sql", "application/sql"))
        .await
        .unwrap();
    let files = vec![pending_doc, pending_dump];
    assert!(factory.build(&files, None).await.is_empty());

    // Deselected files are out of scope.
    let sheet = h.upload(&chat.id, "sales.csv", "text/csv", "region,amount\nnorth,10\n").await;
    let selections = vec![FileSelection {
        enabled: false,
        ..FileSelection::enabled(&sheet.id)
    }];
    assert!(factory.build(&[sheet], Some(&selections)).await.is_empty());
}

// ── Iteration ceiling ────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_agent_that_never_answers_stops_at_the_ceiling() {
    let h = harness_with(
        ScriptedProvider::always(Reply::Tools(vec![tool_call("document_tool_0", "again")])),
        |config| config.agent.max_iterations = 4,
    );
    let chat = h.chat("alice").await;

    let answer = h.runner.complete(&chat, "Loop forever", None).await.unwrap();
    assert_eq!(answer.end, RunEnd::IterationLimitExceeded);
    assert_eq!(h.provider.calls(), 4);
    assert!(!answer.text.is_empty());
    assert_eq!(answer.persisted, Persisted::Committed);
    assert_eq!(h.message_count(&chat.id).await, 2);
}

// ── Scenarios ────────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_pdf_question_uses_the_document_tool_not_the_dataframe() {
    let h = harness(ScriptedProvider::new(vec![
        Reply::Tools(vec![tool_call("document_tool_0", "parental leave policy")]),
        Reply::Text("Employees get sixteen weeks of parental leave.".into()),
    ]));
    let chat = h.chat("alice").await;
    h.upload(&chat.id, "headcount.csv", "text/csv", "team,people\nsales,12\nops,7\n")
        .await;
    h.indexed_document(
        &chat.id,
        "handbook.pdf",
        "Parental leave policy: employees receive sixteen weeks of paid parental leave.",
    )
    .await;

    let turn = h.runner.prepare(&chat, None).await.unwrap();
    let mut names = turn.agent.tool_names();
    names.sort();
    assert_eq!(names, vec!["document_tool_0", "pandas_tool_0"]);

    let answer = h.runner.complete(&chat, "How long is parental leave?", None).await.unwrap();
    assert_eq!(answer.end, RunEnd::Finished);
    assert!(!answer.text.is_empty());

    let requests = h.provider.requests.lock().unwrap();
    let called: Vec<String> = requests
        .iter()
        .flat_map(|r| r.messages.iter())
        .flat_map(|m| m.tool_calls.iter())
        .map(|c| c.name.clone())
        .collect();
    assert!(called.iter().all(|n| n == "document_tool_0"));
    assert!(!called.is_empty());
    let observation = requests[1]
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .map(|m| m.content.clone())
        .unwrap_or_default();
    assert!(observation.contains("sixteen weeks"));
    drop(requests);

    assert_eq!(h.assistant_text(&chat.id).await, "Employees get sixteen weeks of parental leave.");
}

#[tokio::test]
async fn e2e_dumps_in_two_chats_get_disjoint_databases() {
    assert_eq!(detect_sql_dump_type(MYSQL_DUMP), SqlDialect::MySql);
    assert_eq!(detect_sql_dump_type(POSTGRES_DUMP), SqlDialect::Postgres);
    assert_eq!(detect_sql_dump_type(MYSQL_DUMP).to_string(), "MySQL");
    assert_eq!(detect_sql_dump_type(POSTGRES_DUMP).to_string(), "Postgres");

    let h = harness(ScriptedProvider::new(Vec::new()));
    let shop = h.chat("alice").await;
    let people = h.chat("alice").await;
    let mysql = h.upload(&shop.id, "shop.sql", "application/sql", MYSQL_DUMP).await;
    let postgres = h.upload(&people.id, "people.sql", "application/sql", POSTGRES_DUMP).await;

    let mysql_meta = mysql.sql.clone().unwrap();
    let postgres_meta = postgres.sql.clone().unwrap();
    assert_eq!(mysql_meta.dialect, SqlDialect::MySql);
    assert_eq!(postgres_meta.dialect, SqlDialect::Postgres);
    assert_ne!(mysql_meta.database_name, postgres_meta.database_name);

    let factory = ToolFactory::new(h.tool_env()).with_sql(Arc::new(h.sql.clone()));
    let shop_tools = factory.build(&[mysql], None).await;
    let people_tools = factory.build(&[postgres], None).await;
    assert_eq!(shop_tools.names(), vec![format!("sql_tool_{}", mysql_meta.database_name)]);
    assert_eq!(people_tools.names(), vec![format!("sql_tool_{}", postgres_meta.database_name)]);

    let mut databases = h.sql.databases().await;
    databases.sort();
    let mut expected = vec![mysql_meta.database_name, postgres_meta.database_name];
    expected.sort();
    assert_eq!(databases, expected);
}
