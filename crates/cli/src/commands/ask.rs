//! `docchat ask`: one turn over local files, with everything held in memory.
//!
//! The files are attached to a throwaway chat and ingested before the question
//! is asked; the answer streams to stdout as it is generated.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use docchat_agent::{TurnRunner, WebAccess, WireEvent};
use docchat_config::AppConfig;
use docchat_core::chat::{Chat, IndexStatus};
use docchat_core::store::RelationalStore;
use docchat_ingest::Ingestor;
use docchat_memory::{DocumentIndexer, InMemoryVectorStore};
use docchat_store::InMemoryStore;
use docchat_tools::{DuckDuckGoSearcher, HttpWebFetcher, MemorySqlServers, SqlServers};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

const LOCAL_USER: &str = "local";

fn mime_for(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "csv" => "text/csv",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "sql" => "application/sql",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        _ => "text/plain",
    }
}

pub async fn run(mut config: AppConfig, chat_files: Vec<PathBuf>, question: String) -> anyhow::Result<()> {
    if question.trim().is_empty() {
        bail!("The question must not be empty");
    }

    let scratch = std::env::temp_dir().join(format!("docchat-ask-{}", std::process::id()));
    config.ingest.upload_dir = scratch.clone();

    let result = ask(Arc::new(config), &chat_files, &question).await;
    if let Err(e) = tokio::fs::remove_dir_all(&scratch).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %scratch.display(), error = %e, "Could not remove scratch directory");
    }
    result
}

async fn ask(config: Arc<AppConfig>, chat_files: &[PathBuf], question: &str) -> anyhow::Result<()> {
    let llm = docchat_providers::build_provider(&config.llm)?;
    let store: Arc<dyn RelationalStore> = Arc::new(InMemoryStore::new());
    let indexer = Arc::new(DocumentIndexer::new(
        Arc::clone(&llm),
        Arc::new(InMemoryVectorStore::new()),
        config.llm.embed_model.clone(),
    ));
    let sql: Arc<dyn SqlServers> = Arc::new(MemorySqlServers::new());
    let ingestor = Ingestor::new(&config.ingest, Arc::clone(&store), Arc::clone(&indexer), Arc::clone(&sql));

    let chat = store.create_chat(Chat::new(LOCAL_USER, "ask")).await?;
    for path in chat_files {
        attach(&ingestor, &chat.id, path).await?;
    }

    let turns = TurnRunner::new(Arc::clone(&config), store, llm, indexer)
        .with_sql(sql)
        .with_web(WebAccess {
            fetcher: Arc::new(HttpWebFetcher::new(&config.web)?),
            searcher: Arc::new(DuckDuckGoSearcher::new(&config.web)?),
        });

    let events = turns.stream(&chat, question, None).await?;
    let mut events = std::pin::pin!(events);
    let mut stdout = tokio::io::stdout();
    while let Some(event) = events.next().await {
        match event {
            WireEvent::Value(delta) => {
                stdout.write_all(delta.as_bytes()).await?;
                stdout.flush().await?;
            }
            WireEvent::Done => {
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
            WireEvent::Error(message) => {
                stdout.write_all(b"\n").await?;
                bail!(message);
            }
        }
    }
    Ok(())
}

/// Store and ingest one local file. A file that fails to ingest is reported and
/// left without a tool; the question is still asked.
async fn attach(ingestor: &Ingestor, chat_id: &str, path: &Path) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Not a file name: {}", path.display()))?;

    let file = ingestor
        .store_upload(chat_id, file_name, mime_for(file_name), &bytes)
        .await?;
    let file = ingestor.ingest(file).await;
    match file.index_status {
        IndexStatus::Failed => warn!(
            file = file_name,
            error = file.index_error.as_deref().unwrap_or("unknown"),
            "File could not be ingested"
        ),
        _ => info!(file = file_name, kind = file.kind.as_str(), "File attached"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_types_follow_the_extension() {
        assert_eq!(mime_for("report.PDF"), "application/pdf");
        assert_eq!(mime_for("sales.csv"), "text/csv");
        assert_eq!(mime_for("shop.sql"), "application/sql");
        assert_eq!(mime_for("README"), "text/plain");
    }
}
