//! Layered chat memory.
//!
//! Working memory for one agent invocation is built from three long-term tiers plus
//! a rolling short-term transcript, all under one token budget:
//!
//! | priority | block          | behavior                                           |
//! |----------|----------------|----------------------------------------------------|
//! | 0        | `core_info`    | fixed directive, always rendered                   |
//! | 1        | `extracted_info` | facts distilled by the LLM from flushed turns    |
//! | 2        | `vector_memory` | semantic recall over flushed turns of this chat   |
//!
//! The short-term window may use `token_limit * chat_history_token_ratio` tokens.
//! When it grows past that, the oldest turns leave in chunks of at least
//! `token_flush_size` tokens and are handed to every long-term block. The rest of
//! the budget is spent on long-term blocks in priority order; a block that does not
//! fit is left out, except priority 0 which is always kept.

use crate::indexer::{embed_query, embed_texts};
use crate::token::{estimate_message_tokens, estimate_tokens};
use async_trait::async_trait;
use docchat_config::{LlmConfig, MemoryConfig};
use docchat_core::chat::ChatMessage;
use docchat_core::error::{Error, Result};
use docchat_core::message::{Message, Role};
use docchat_core::provider::{Provider, ProviderRequest};
use docchat_core::vector::{
    KIND_KEY, KIND_MEMORY, Predicate, SESSION_ID_KEY, VectorQuery, VectorRecord, VectorStore,
};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Text of the priority-0 block.
pub const CORE_DIRECTIVE: &str =
    "You are a smart AI assistant and follows the rules and system prompts that were given by the user";

const FACT_EXTRACT_PROMPT: &str = "You extract durable facts about the user and the conversation. \
Read the transcript and reply with a JSON array of short, self-contained fact strings that are not already \
in the known facts. Reply with [] when there is nothing new. Reply with the JSON array only.";

const FACT_CONDENSE_PROMPT: &str = "Condense the following facts into at most {max} facts, merging duplicates \
and dropping the least important ones. Reply with a JSON array of strings only.";

/// Resolved memory parameters for one invocation.
#[derive(Debug, Clone)]
pub struct MemorySettings {
    pub token_limit: usize,
    pub chat_history_token_ratio: f64,
    pub token_flush_size: usize,
    pub max_facts: usize,
    pub similarity_top_k: usize,
    pub retrieval_context_window: usize,
    pub history_window: usize,
    pub vector_recall: bool,
    /// Model used for fact extraction.
    pub llm_model: String,
    pub embed_model: String,
}

impl MemorySettings {
    pub fn from_config(memory: &MemoryConfig, llm: &LlmConfig) -> Self {
        Self {
            token_limit: memory.token_limit,
            chat_history_token_ratio: memory.chat_history_token_ratio,
            token_flush_size: memory.token_flush_size,
            max_facts: memory.max_facts,
            similarity_top_k: memory.similarity_top_k,
            retrieval_context_window: memory.retrieval_context_window,
            history_window: memory.history_window,
            vector_recall: memory.vector_recall,
            llm_model: llm.resolved_model(),
            embed_model: llm.embed_model.clone(),
        }
    }

    pub fn short_term_budget(&self) -> usize {
        (self.token_limit as f64 * self.chat_history_token_ratio) as usize
    }

    pub fn long_term_budget(&self) -> usize {
        self.token_limit.saturating_sub(self.short_term_budget())
    }
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self::from_config(&MemoryConfig::default(), &LlmConfig::default())
    }
}

/// One long-term memory tier.
#[async_trait]
pub trait MemoryBlock: Send + Sync {
    fn name(&self) -> &str;

    /// Lower is retained first under budget pressure.
    fn priority(&self) -> u8;

    /// Take in turns flushed out of the short-term window.
    async fn absorb(&mut self, flushed: &[Message]) -> Result<()>;

    /// Render for the given recent context; `None` when there is nothing to say.
    async fn render(&self, recent: &[Message]) -> Result<Option<String>>;
}

/// Fixed text, never evicted.
pub struct StaticBlock {
    name: String,
    text: String,
}

impl StaticBlock {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }
}

#[async_trait]
impl MemoryBlock for StaticBlock {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u8 {
        0
    }

    async fn absorb(&mut self, _flushed: &[Message]) -> Result<()> {
        Ok(())
    }

    async fn render(&self, _recent: &[Message]) -> Result<Option<String>> {
        Ok(Some(self.text.clone()))
    }
}

/// LLM-distilled facts, capped at `max_facts`.
pub struct FactExtractionBlock {
    provider: Arc<dyn Provider>,
    model: String,
    max_facts: usize,
    facts: Vec<String>,
}

impl FactExtractionBlock {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>, max_facts: usize) -> Self {
        Self {
            provider,
            model: model.into(),
            max_facts: max_facts.max(1),
            facts: Vec::new(),
        }
    }

    pub fn facts(&self) -> &[String] {
        &self.facts
    }

    async fn ask(&self, system: String, user: String) -> Result<Vec<String>> {
        let request = ProviderRequest::simple(
            self.model.clone(),
            vec![Message::system(system), Message::user(user)],
            0.0,
        );
        let response = self.provider.complete(request).await?;
        Ok(parse_fact_list(&response.message.content))
    }

    fn merge(&mut self, new_facts: Vec<String>) {
        let mut known: HashSet<String> = self.facts.iter().map(|f| f.to_lowercase()).collect();
        for fact in new_facts {
            if known.insert(fact.to_lowercase()) {
                self.facts.push(fact);
            }
        }
    }
}

#[async_trait]
impl MemoryBlock for FactExtractionBlock {
    fn name(&self) -> &str {
        "extracted_info"
    }

    fn priority(&self) -> u8 {
        1
    }

    async fn absorb(&mut self, flushed: &[Message]) -> Result<()> {
        let transcript = render_transcript(flushed);
        if transcript.is_empty() {
            return Ok(());
        }

        let known = if self.facts.is_empty() {
            "(none)".to_string()
        } else {
            bullet_list(&self.facts)
        };
        let extracted = self
            .ask(
                FACT_EXTRACT_PROMPT.to_string(),
                format!("Known facts:\n{known}\n\nTranscript:\n{transcript}"),
            )
            .await?;
        self.merge(extracted);

        if self.facts.len() > self.max_facts {
            let prompt = FACT_CONDENSE_PROMPT.replace("{max}", &self.max_facts.to_string());
            match self.ask(prompt, bullet_list(&self.facts)).await {
                Ok(condensed) if !condensed.is_empty() => self.facts = condensed,
                Ok(_) => {}
                Err(e) => warn!("Fact condensation failed: {e}"),
            }
            if self.facts.len() > self.max_facts {
                let excess = self.facts.len() - self.max_facts;
                self.facts.drain(..excess);
            }
        }
        debug!(facts = self.facts.len(), "Fact block updated");
        Ok(())
    }

    async fn render(&self, _recent: &[Message]) -> Result<Option<String>> {
        if self.facts.is_empty() {
            return Ok(None);
        }
        Ok(Some(format!(
            "Facts remembered from earlier in this conversation:\n{}",
            bullet_list(&self.facts)
        )))
    }
}

/// Semantic recall over flushed turns, scoped to one chat session.
pub struct VectorRecallBlock {
    provider: Arc<dyn Provider>,
    store: Arc<dyn VectorStore>,
    embed_model: String,
    session_id: String,
    top_k: usize,
    window: usize,
}

impl VectorRecallBlock {
    pub fn new(
        provider: Arc<dyn Provider>,
        store: Arc<dyn VectorStore>,
        embed_model: impl Into<String>,
        session_id: impl Into<String>,
        top_k: usize,
        window: usize,
    ) -> Self {
        Self {
            provider,
            store,
            embed_model: embed_model.into(),
            session_id: session_id.into(),
            top_k,
            window,
        }
    }

    fn scope(&self) -> Vec<Predicate> {
        vec![
            Predicate::session(&self.session_id),
            Predicate::eq(KIND_KEY, KIND_MEMORY),
        ]
    }
}

#[async_trait]
impl MemoryBlock for VectorRecallBlock {
    fn name(&self) -> &str {
        "vector_memory"
    }

    fn priority(&self) -> u8 {
        2
    }

    async fn absorb(&mut self, flushed: &[Message]) -> Result<()> {
        let turns: Vec<&Message> = flushed
            .iter()
            .filter(|m| !m.content.trim().is_empty())
            .collect();
        if turns.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = turns
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content.trim()))
            .collect();
        let embeddings = embed_texts(self.provider.as_ref(), &self.embed_model, &texts).await?;

        let records: Vec<VectorRecord> = turns
            .iter()
            .zip(texts)
            .zip(embeddings)
            .map(|((message, text), embedding)| {
                let mut record = VectorRecord::new(text, embedding)
                    .tag(SESSION_ID_KEY, &self.session_id)
                    .tag(KIND_KEY, KIND_MEMORY);
                record.id = format!("memory:{}:{}", self.session_id, message.id);
                record
            })
            .collect();
        self.store.upsert(records).await?;
        Ok(())
    }

    async fn render(&self, recent: &[Message]) -> Result<Option<String>> {
        let start = recent.len().saturating_sub(self.window);
        let context = render_transcript(&recent[start..]);
        if context.is_empty() || self.top_k == 0 {
            return Ok(None);
        }

        let embedding = embed_query(self.provider.as_ref(), &self.embed_model, &context).await?;
        let hits = self
            .store
            .query(&VectorQuery::new(embedding, self.scope(), self.top_k))
            .await?;
        if hits.is_empty() {
            return Ok(None);
        }

        let lines: Vec<String> = hits.into_iter().map(|h| h.record.text).collect();
        Ok(Some(format!(
            "Relevant earlier exchanges from this conversation:\n{}",
            bullet_list(&lines)
        )))
    }
}

/// Short-term transcript plus long-term blocks for one chat.
pub struct ChatMemory {
    session_id: String,
    settings: MemorySettings,
    blocks: Vec<Box<dyn MemoryBlock>>,
    short_term: VecDeque<Message>,
    seen: HashSet<String>,
}

impl ChatMemory {
    pub fn new(session_id: impl Into<String>, settings: MemorySettings, mut blocks: Vec<Box<dyn MemoryBlock>>) -> Self {
        blocks.sort_by_key(|b| b.priority());
        Self {
            session_id: session_id.into(),
            settings,
            blocks,
            short_term: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn settings(&self) -> &MemorySettings {
        &self.settings
    }

    pub fn block_names(&self) -> Vec<&str> {
        self.blocks.iter().map(|b| b.name()).collect()
    }

    /// Load stored turns, oldest first. Turns already seen are skipped, so seeding
    /// twice with the same list changes nothing. Returns how many were added.
    pub async fn seed(&mut self, prior: &[ChatMessage]) -> Result<usize> {
        let start = prior.len().saturating_sub(self.settings.history_window);
        let mut added = 0;
        for stored in &prior[start..] {
            if self.seen.contains(&stored.id) {
                continue;
            }
            self.push(stored.to_llm_message());
            added += 1;
        }
        self.flush_if_needed().await;
        Ok(added)
    }

    /// Append one new turn to the short-term window.
    pub async fn put(&mut self, message: Message) {
        if self.seen.contains(&message.id) {
            return;
        }
        self.push(message);
        self.flush_if_needed().await;
    }

    fn push(&mut self, message: Message) {
        self.seen.insert(message.id.clone());
        self.short_term.push_back(message);
    }

    /// The short-term window, oldest first.
    pub fn history(&self) -> Vec<Message> {
        self.short_term.iter().cloned().collect()
    }

    pub fn short_term_tokens(&self) -> usize {
        self.short_term.iter().map(estimate_message_tokens).sum()
    }

    async fn flush_if_needed(&mut self) {
        let budget = self.settings.short_term_budget();
        let flush_size = self.settings.token_flush_size.max(1);

        while self.short_term_tokens() > budget && !self.short_term.is_empty() {
            let mut chunk = Vec::new();
            let mut chunk_tokens = 0;
            while let Some(message) = self.short_term.pop_front() {
                chunk_tokens += estimate_message_tokens(&message);
                chunk.push(message);
                if chunk_tokens >= flush_size {
                    break;
                }
            }
            // The window must open on a user turn.
            while self.short_term.front().is_some_and(|m| m.role != Role::User) {
                if let Some(message) = self.short_term.pop_front() {
                    chunk.push(message);
                }
            }

            debug!(
                session_id = %self.session_id,
                messages = chunk.len(),
                tokens = chunk_tokens,
                "Flushing short-term memory"
            );
            for block in self.blocks.iter_mut() {
                if let Err(e) = block.absorb(&chunk).await {
                    warn!(block = block.name(), "Memory block failed to absorb flushed turns: {e}");
                }
            }
        }
    }

    /// Render long-term blocks for the pending `input`, highest priority first,
    /// within the long-term budget.
    pub async fn long_term_context(&self, input: &str) -> Result<Option<String>> {
        let mut recent = self.history();
        if !input.trim().is_empty() {
            recent.push(Message::user(input));
        }

        let budget = self.settings.long_term_budget();
        let mut used = 0;
        let mut sections = Vec::new();
        for block in &self.blocks {
            let rendered = match block.render(&recent).await {
                Ok(Some(text)) => text,
                Ok(None) => continue,
                Err(e) => {
                    warn!(block = block.name(), "Memory block failed to render: {e}");
                    continue;
                }
            };
            let section = format!("<{name}>\n{rendered}\n</{name}>", name = block.name());
            let cost = estimate_tokens(&section);
            if block.priority() > 0 && used + cost > budget {
                debug!(block = block.name(), cost, "Memory block dropped under budget");
                continue;
            }
            used += cost;
            sections.push(section);
        }

        if sections.is_empty() {
            Ok(None)
        } else {
            Ok(Some(sections.join("\n\n")))
        }
    }

    /// Messages for the model: one system message holding the long-term context,
    /// then the short-term window.
    pub async fn get(&self, input: &str) -> Result<Vec<Message>> {
        let mut messages = Vec::with_capacity(self.short_term.len() + 1);
        if let Some(context) = self.long_term_context(input).await? {
            messages.push(Message::system(context));
        }
        messages.extend(self.history());
        Ok(messages)
    }
}

/// Build the layered memory for one chat and seed it with that chat's prior turns.
///
/// Fails with a configuration error when vector recall is requested without a
/// vector store or without an embedding-capable provider.
pub async fn create_memory(
    chat_id: &str,
    llm: Arc<dyn Provider>,
    prior_messages: &[ChatMessage],
    vector_store: Option<Arc<dyn VectorStore>>,
    settings: &MemorySettings,
) -> Result<ChatMemory> {
    let mut blocks: Vec<Box<dyn MemoryBlock>> = vec![
        Box::new(StaticBlock::new("core_info", CORE_DIRECTIVE)),
        Box::new(FactExtractionBlock::new(
            Arc::clone(&llm),
            settings.llm_model.clone(),
            settings.max_facts,
        )),
    ];

    if settings.vector_recall {
        let store = vector_store.ok_or_else(|| {
            Error::config("vector recall memory requested but no vector store is configured")
        })?;
        if !llm.supports_embeddings() {
            return Err(Error::config(format!(
                "vector recall memory requested but provider '{}' has no embedding model configured",
                llm.name()
            )));
        }
        blocks.push(Box::new(VectorRecallBlock::new(
            Arc::clone(&llm),
            store,
            settings.embed_model.clone(),
            chat_id,
            settings.similarity_top_k,
            settings.retrieval_context_window,
        )));
    }

    let mut memory = ChatMemory::new(chat_id, settings.clone(), blocks);
    let seeded = memory.seed(prior_messages).await?;
    debug!(chat_id, seeded, "Chat memory created");
    Ok(memory)
}

fn render_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| !m.content.trim().is_empty())
        .map(|m| format!("{}: {}", m.role, m.content.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|i| format!("- {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse an LLM reply into a fact list: a JSON array (optionally fenced) or,
/// failing that, one fact per bulleted line.
pub fn parse_fact_list(reply: &str) -> Vec<String> {
    let trimmed = reply
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    if let Ok(list) = serde_json::from_str::<Vec<String>>(trimmed) {
        return list
            .into_iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();
    }

    trimmed
        .lines()
        .map(|l| l.trim().trim_start_matches(['-', '*']).trim())
        .filter(|l| !l.is_empty() && *l != "[]")
        .map(str::to_string)
        .collect()
}
