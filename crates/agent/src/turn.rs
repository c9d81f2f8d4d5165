//! One chat turn, assembled from the chat's current state.
//!
//! Every turn rebuilds its tools from the chat's files and its memory from the
//! chat's stored messages; nothing is cached between turns.

use crate::coordinator::{TurnAnswer, complete_turn, stream_turn};
use crate::orchestrator::{Agent, create_agent};
use crate::settings::TurnSettings;
use crate::stream_event::WireEvent;
use docchat_config::AppConfig;
use docchat_core::chat::Chat;
use docchat_core::error::Result;
use docchat_core::provider::Provider;
use docchat_core::store::RelationalStore;
use docchat_core::web::{WebFetcher, WebSearcher};
use docchat_memory::{ChatMemory, DocumentIndexer, MemorySettings, TextChunker, create_memory};
use docchat_tools::{FileSelection, SqlServers, ToolEnv, ToolFactory, WebArtifactSink, WebTools};
use futures::Stream;
use std::sync::Arc;
use tracing::debug;

/// Web access shared by every chat.
#[derive(Clone)]
pub struct WebAccess {
    pub fetcher: Arc<dyn WebFetcher>,
    pub searcher: Arc<dyn WebSearcher>,
}

/// An agent and memory ready to run one turn.
pub struct PreparedTurn {
    pub settings: TurnSettings,
    pub agent: Agent,
    pub memory: ChatMemory,
}

/// Runs turns for any chat against shared collaborators.
#[derive(Clone)]
pub struct TurnRunner {
    config: Arc<AppConfig>,
    store: Arc<dyn RelationalStore>,
    llm: Arc<dyn Provider>,
    indexer: Arc<DocumentIndexer>,
    sql: Option<Arc<dyn SqlServers>>,
    web: Option<WebAccess>,
}

impl TurnRunner {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn RelationalStore>,
        llm: Arc<dyn Provider>,
        indexer: Arc<DocumentIndexer>,
    ) -> Self {
        Self {
            config,
            store,
            llm,
            indexer,
            sql: None,
            web: None,
        }
    }

    pub fn with_sql(mut self, servers: Arc<dyn SqlServers>) -> Self {
        self.sql = Some(servers);
        self
    }

    pub fn with_web(mut self, web: WebAccess) -> Self {
        self.web = Some(web);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RelationalStore> {
        &self.store
    }

    /// Build the tools, memory and agent for a turn on `chat`.
    pub async fn prepare(&self, chat: &Chat, selections: Option<&[FileSelection]>) -> Result<PreparedTurn> {
        let settings = TurnSettings::resolve(chat, &self.config);
        let vectors = Arc::clone(self.indexer.store());

        let env = ToolEnv::new(
            Arc::clone(&self.llm),
            settings.model.clone(),
            self.config.llm.embed_model.clone(),
            Arc::clone(&vectors),
        );
        let mut factory = ToolFactory::new(env);
        if let Some(sql) = &self.sql {
            factory = factory.with_sql(Arc::clone(sql));
        }
        if let Some(web) = &self.web {
            let sink = WebArtifactSink::new(
                chat.id.clone(),
                Arc::clone(&self.store),
                Arc::clone(&self.indexer),
                TextChunker::new(self.config.ingest.chunk_size, self.config.ingest.chunk_overlap),
                self.config.ingest.upload_dir.clone(),
            );
            factory = factory.with_web(WebTools {
                fetcher: Arc::clone(&web.fetcher),
                searcher: Arc::clone(&web.searcher),
                sink: Arc::new(sink),
                config: self.config.web.clone(),
            });
        }

        let files = self.store.list_files(&chat.id).await?;
        let tools = factory.build(&files, selections).await;

        let memory_settings = MemorySettings::from_config(&self.config.memory, &self.config.llm);
        let prior = self
            .store
            .recent_messages(&chat.id, memory_settings.history_window)
            .await?;
        let memory = create_memory(
            &chat.id,
            Arc::clone(&self.llm),
            &prior,
            Some(vectors),
            &memory_settings,
        )
        .await?;

        debug!(
            chat_id = %chat.id,
            model = %settings.model,
            files = files.len(),
            tools = tools.len(),
            prior = prior.len(),
            "Turn prepared"
        );

        let agent = create_agent(
            settings.system_prompt.clone(),
            Arc::new(tools),
            Arc::clone(&self.llm),
            settings.agent_options(),
        );
        Ok(PreparedTurn {
            settings,
            agent,
            memory,
        })
    }

    /// Stream a turn. Setup failures surface before any event is produced.
    pub async fn stream(
        &self,
        chat: &Chat,
        message: &str,
        selections: Option<&[FileSelection]>,
    ) -> Result<impl Stream<Item = WireEvent> + Send + 'static + use<>> {
        let turn = self.prepare(chat, selections).await?;
        Ok(stream_turn(
            &turn.agent,
            turn.memory,
            Arc::clone(&self.store),
            chat.id.clone(),
            message.to_string(),
        ))
    }

    /// Run a turn to completion.
    pub async fn complete(
        &self,
        chat: &Chat,
        message: &str,
        selections: Option<&[FileSelection]>,
    ) -> Result<TurnAnswer> {
        let turn = self.prepare(chat, selections).await?;
        Ok(complete_turn(&turn.agent, &turn.memory, Arc::clone(&self.store), &chat.id, message).await)
    }
}
