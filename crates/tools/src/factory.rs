//! Per-turn tool assembly from a chat's files.
//!
//! Every binding is constructed independently: a file whose tool cannot be built
//! is logged and left out, and the rest of the set is still returned.

use crate::dataframe::DataFrameTool;
use crate::env::ToolEnv;
use crate::filters::file_filter;
use crate::retrieval::{QueryMode, VectorRetrievalTool};
use crate::sql::{SqlServers, SqlTool};
use crate::web::{WebArtifactSink, WebScrapeTool, WebSearchTool};
use docchat_config::WebConfig;
use docchat_core::chat::{ChatFile, FileKind, IndexStatus};
use docchat_core::tool::ToolRegistry;
use docchat_core::web::{WebFetcher, WebSearcher};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// The caller's per-file choice for one turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSelection {
    pub file_id: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: QueryMode,
}

fn enabled_by_default() -> bool {
    true
}

impl FileSelection {
    pub fn enabled(file_id: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            enabled: true,
            mode: QueryMode::Retrieval,
        }
    }
}

/// Web capabilities bound to one chat.
#[derive(Clone)]
pub struct WebTools {
    pub fetcher: Arc<dyn WebFetcher>,
    pub searcher: Arc<dyn WebSearcher>,
    pub sink: Arc<WebArtifactSink>,
    pub config: WebConfig,
}

/// Builds the tool set of one turn.
pub struct ToolFactory {
    env: ToolEnv,
    sql: Option<Arc<dyn SqlServers>>,
    web: Option<WebTools>,
}

impl ToolFactory {
    pub fn new(env: ToolEnv) -> Self {
        Self {
            env,
            sql: None,
            web: None,
        }
    }

    pub fn with_sql(mut self, servers: Arc<dyn SqlServers>) -> Self {
        self.sql = Some(servers);
        self
    }

    pub fn with_web(mut self, web: WebTools) -> Self {
        self.web = Some(web);
        self
    }

    /// Resolve which files are in scope and how. Without selections every file is
    /// in scope with plain retrieval; files not named in a selection list are out.
    fn in_scope<'a>(
        files: &'a [ChatFile],
        selections: Option<&[FileSelection]>,
    ) -> Vec<(&'a ChatFile, QueryMode)> {
        match selections {
            None => files.iter().map(|f| (f, QueryMode::Retrieval)).collect(),
            Some(selections) => files
                .iter()
                .filter_map(|f| {
                    selections
                        .iter()
                        .find(|s| s.file_id == f.id && s.enabled)
                        .map(|s| (f, s.mode))
                })
                .collect(),
        }
    }

    /// Tool bindings for the in-scope files, plus the web tools when configured.
    pub async fn build(&self, files: &[ChatFile], selections: Option<&[FileSelection]>) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        let mut documents = 0usize;
        let mut sheets = 0usize;

        for (file, mode) in Self::in_scope(files, selections) {
            match file.kind {
                FileKind::GenericDocument | FileKind::WebArtifact => {
                    if file.index_status != IndexStatus::Done {
                        debug!(file_id = %file.id, status = file.index_status.as_str(), "Skipping unindexed document");
                        continue;
                    }
                    let Some(filter) = file_filter(file) else { continue };
                    registry.register(Box::new(VectorRetrievalTool::new(
                        documents,
                        file,
                        filter,
                        mode,
                        self.env.clone(),
                    )));
                    documents += 1;
                }
                FileKind::Spreadsheet => match DataFrameTool::load(sheets, file, self.env.clone()).await {
                    Ok(tool) => {
                        registry.register(Box::new(tool));
                        sheets += 1;
                    }
                    Err(e) => warn!(file_id = %file.id, error = %e, "Spreadsheet tool omitted"),
                },
                FileKind::RelationalDump => {
                    if let Some(tool) = self.sql_tool(file).await {
                        registry.register(Box::new(tool));
                    }
                }
            }
        }

        if let Some(web) = &self.web {
            registry.register(Box::new(WebScrapeTool::new(
                web.fetcher.clone(),
                web.sink.clone(),
                web.config.max_fetch_chars,
            )));
            registry.register(Box::new(WebSearchTool::new(
                web.searcher.clone(),
                web.fetcher.clone(),
                web.sink.clone(),
                &web.config,
            )));
        }

        debug!(tools = ?registry.names(), "Tools assembled");
        registry
    }

    async fn sql_tool(&self, file: &ChatFile) -> Option<SqlTool> {
        let (Some(servers), Some(meta)) = (&self.sql, &file.sql) else {
            warn!(file_id = %file.id, "SQL tool omitted: no dump database available");
            return None;
        };
        if file.index_status != IndexStatus::Done {
            debug!(file_id = %file.id, status = file.index_status.as_str(), "Skipping unloaded dump");
            return None;
        }
        match servers.open(meta.dialect, &meta.database_name).await {
            Ok(catalog) => Some(SqlTool::new(file, meta, catalog, self.env.clone())),
            Err(e) => {
                warn!(file_id = %file.id, database = %meta.database_name, error = %e, "SQL tool omitted");
                None
            }
        }
    }
}
