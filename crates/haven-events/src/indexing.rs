//! Document ingestion pipeline.
//!
//! A pipeline of processors turns a document's raw text into
//! [`IndexableContent`] items (title, chunks, fetched link content); each
//! item is embedded and the rows land in storage in one transaction. A
//! completion event is published on the `document_indexing` source.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use haven_core::boundary::EmbeddingGenerator;
use haven_queue::TaskHandler;
use haven_storage::documents::{self, DocumentRecord, EmbeddingChunk};
use haven_storage::Db;

use crate::error::{EventsError, Result};
use crate::sources::PushSource;

/// One piece of content produced by a processor, ready for embedding.
#[derive(Debug, Clone)]
pub struct IndexableContent {
    pub content: String,
    /// content_chunk | title | summary | ocr_text | fetched_link …
    pub embedding_type: String,
    pub source_processor: String,
    pub mime_type: String,
    /// Path or URL reference for content not inlined (binary fetches).
    pub reference: Option<String>,
    pub metadata: Value,
}

/// A pipeline stage. Stages run in order, each seeing the original
/// document and contributing items independently.
#[async_trait]
pub trait ContentProcessor: Send + Sync {
    fn name(&self) -> &str;
    async fn process(
        &self,
        document: &DocumentRecord,
        raw_text: &str,
    ) -> Result<Vec<IndexableContent>>;
}

/// Emits the document title as its own embeddable item.
pub struct TitleProcessor;

#[async_trait]
impl ContentProcessor for TitleProcessor {
    fn name(&self) -> &str {
        "title"
    }

    async fn process(
        &self,
        document: &DocumentRecord,
        _raw_text: &str,
    ) -> Result<Vec<IndexableContent>> {
        if document.title.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![IndexableContent {
            content: document.title.clone(),
            embedding_type: "title".to_string(),
            source_processor: self.name().to_string(),
            mime_type: "text/plain".to_string(),
            reference: None,
            metadata: json!({}),
        }])
    }
}

/// Splits the body into paragraph-aligned chunks.
pub struct ChunkProcessor {
    pub max_chunk_chars: usize,
}

impl Default for ChunkProcessor {
    fn default() -> Self {
        Self {
            max_chunk_chars: 1200,
        }
    }
}

#[async_trait]
impl ContentProcessor for ChunkProcessor {
    fn name(&self) -> &str {
        "chunker"
    }

    async fn process(
        &self,
        _document: &DocumentRecord,
        raw_text: &str,
    ) -> Result<Vec<IndexableContent>> {
        Ok(chunk_text(raw_text, self.max_chunk_chars)
            .into_iter()
            .map(|content| IndexableContent {
                content,
                embedding_type: "content_chunk".to_string(),
                source_processor: self.name().to_string(),
                mime_type: "text/plain".to_string(),
                reference: None,
                metadata: json!({}),
            })
            .collect())
    }
}

/// Split on blank lines, packing paragraphs up to the size limit; a single
/// oversized paragraph is split hard.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in text.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }
        if !current.is_empty() && current.len() + paragraph.len() + 2 > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        if paragraph.len() > max_chars {
            let mut remaining = paragraph;
            while remaining.len() > max_chars {
                let mut cut = max_chars;
                while !remaining.is_char_boundary(cut) {
                    cut -= 1;
                }
                chunks.push(remaining[..cut].to_string());
                remaining = &remaining[cut..];
            }
            if !remaining.is_empty() {
                current = remaining.to_string();
            }
            continue;
        }
        if current.is_empty() {
            current = paragraph.to_string();
        } else {
            current.push_str("\n\n");
            current.push_str(paragraph);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Fetches URLs mentioned in the body. Textual responses are inlined as
/// items; binary responses go to a temp file referenced by path.
pub struct UrlFetchProcessor {
    client: reqwest::Client,
    pub max_fetches: usize,
}

impl UrlFetchProcessor {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(timeout_secs))
                .build()
                .unwrap_or_default(),
            max_fetches: 3,
        }
    }
}

#[async_trait]
impl ContentProcessor for UrlFetchProcessor {
    fn name(&self) -> &str {
        "url_fetch"
    }

    async fn process(
        &self,
        _document: &DocumentRecord,
        raw_text: &str,
    ) -> Result<Vec<IndexableContent>> {
        let mut items = Vec::new();
        for url in extract_urls(raw_text).into_iter().take(self.max_fetches) {
            match self.fetch(&url).await {
                Ok(Some(item)) => items.push(item),
                Ok(None) => {}
                Err(e) => warn!(%url, error = %e, "link fetch failed — skipping"),
            }
        }
        Ok(items)
    }
}

impl UrlFetchProcessor {
    async fn fetch(&self, url: &str) -> Result<Option<IndexableContent>> {
        let response = self.client.get(url).send().await.map_err(|e| {
            EventsError::Fetch {
                url: url.to_string(),
                detail: e.to_string(),
            }
        })?;
        if !response.status().is_success() {
            return Err(EventsError::Fetch {
                url: url.to_string(),
                detail: format!("status {}", response.status()),
            });
        }
        let mime = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .split(';')
            .next()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = response.bytes().await.map_err(|e| EventsError::Fetch {
            url: url.to_string(),
            detail: e.to_string(),
        })?;

        if mime.starts_with("text/") || mime == "application/json" || mime == "text/markdown" {
            return Ok(Some(IndexableContent {
                content: String::from_utf8_lossy(&bytes).into_owned(),
                embedding_type: "fetched_link".to_string(),
                source_processor: self.name().to_string(),
                mime_type: mime,
                reference: Some(url.to_string()),
                metadata: json!({"url": url}),
            }));
        }

        // Binary content: park it in a temp file and index the reference.
        let path = std::env::temp_dir().join(format!("haven-fetch-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, &bytes).await?;
        Ok(Some(IndexableContent {
            content: format!("Fetched binary content from {url} ({mime}, {} bytes)", bytes.len()),
            embedding_type: "fetched_link".to_string(),
            source_processor: self.name().to_string(),
            mime_type: mime,
            reference: Some(path.to_string_lossy().into_owned()),
            metadata: json!({"url": url}),
        }))
    }
}

/// Pull plain http(s) URLs out of free text.
pub fn extract_urls(text: &str) -> Vec<String> {
    let mut urls = Vec::new();
    for token in text.split_whitespace() {
        if token.starts_with("http://") || token.starts_with("https://") {
            let trimmed = token.trim_end_matches(['.', ',', ')', ']', ';', '!', '?']);
            if !urls.iter().any(|u| u == trimmed) {
                urls.push(trimmed.to_string());
            }
        }
    }
    urls
}

/// Deterministic hash-based embedder — the boundary implementation used in
/// tests and as a stand-in until a real model is wired.
pub struct HashEmbeddingGenerator {
    dims: usize,
}

impl HashEmbeddingGenerator {
    pub fn new() -> Self {
        Self { dims: 64 }
    }
}

impl Default for HashEmbeddingGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingGenerator for HashEmbeddingGenerator {
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, String> {
        let mut vector = vec![0f32; self.dims];
        for token in text.to_lowercase().split_whitespace() {
            let mut hash: u64 = 1469598103934665603; // FNV offset basis
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            vector[(hash % self.dims as u64) as usize] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }

    fn model_name(&self) -> &str {
        "hash-64"
    }
}

/// Runs the pipeline for documents queued by `index_document` tasks.
pub struct DocumentIndexer {
    db: Db,
    embedder: Arc<dyn EmbeddingGenerator>,
    processors: Vec<Arc<dyn ContentProcessor>>,
    /// Completion feed (`document_indexing` source), when wired.
    completion: Option<Arc<PushSource>>,
}

impl DocumentIndexer {
    pub fn new(db: Db, embedder: Arc<dyn EmbeddingGenerator>) -> Self {
        Self {
            db,
            embedder,
            processors: vec![
                Arc::new(TitleProcessor),
                Arc::new(ChunkProcessor::default()),
            ],
            completion: None,
        }
    }

    pub fn with_processors(mut self, processors: Vec<Arc<dyn ContentProcessor>>) -> Self {
        self.processors = processors;
        self
    }

    pub fn with_completion_source(mut self, source: Arc<PushSource>) -> Self {
        self.completion = Some(source);
        self
    }

    /// Process one document end-to-end. Returns the number of embedding
    /// rows written.
    pub async fn index_document(&self, document_id: i64) -> Result<usize> {
        let document = documents::get_document(&self.db, document_id)?
            .ok_or(EventsError::DocumentNotFound(document_id))?;

        // Raw text travels in doc_metadata.content (set at upload time);
        // the title stands in when a document carries no body.
        let raw_text = document
            .doc_metadata
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or(&document.title)
            .to_string();

        let mut items = Vec::new();
        for processor in &self.processors {
            items.extend(processor.process(&document, &raw_text).await?);
        }

        let mut chunks = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let vector = self
                .embedder
                .embed(&item.content)
                .await
                .map_err(EventsError::Embedding)?;
            chunks.push(EmbeddingChunk {
                chunk_index: index as u32,
                embedding_type: item.embedding_type.clone(),
                embedding_model: self.embedder.model_name().to_string(),
                embedding: vector,
                content: item.content.clone(),
            });
        }

        documents::add_embeddings(&self.db, document_id, &chunks)?;
        info!(document_id, chunks = chunks.len(), "document indexed");

        if let Some(source) = &self.completion {
            let event = json!({
                "event_type": "document_indexed",
                "document_id": document_id,
                "title": document.title,
                "chunks": chunks.len(),
            });
            if let Err(e) = source.publish(event).await {
                warn!(document_id, error = %e, "failed to publish indexing completion");
            }
        }

        Ok(chunks.len())
    }
}

/// Queue handler for `index_document` tasks (payload: document_id).
pub fn index_document_handler(indexer: Arc<DocumentIndexer>) -> TaskHandler {
    Arc::new(move |task, _handle| {
        let indexer = indexer.clone();
        Box::pin(async move {
            let document_id = task
                .payload
                .get("document_id")
                .and_then(|v| {
                    v.as_i64()
                        .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
                })
                .ok_or_else(|| "Missing required field in payload: document_id".to_string())?;
            indexer
                .index_document(document_id)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::EventSource;
    use haven_storage::documents::NewDocument;

    #[test]
    fn chunking_packs_paragraphs() {
        let text = "para one\n\npara two\n\npara three";
        let chunks = chunk_text(text, 20);
        assert_eq!(chunks, vec!["para one", "para two", "para three"]);

        let chunks = chunk_text(text, 1000);
        assert_eq!(chunks.len(), 1);

        // A single oversized paragraph splits hard.
        let long = "x".repeat(45);
        let chunks = chunk_text(&long, 20);
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn url_extraction() {
        let text = "see https://example.com/doc, and (http://other.test/x) for details";
        assert_eq!(
            extract_urls(text),
            vec!["https://example.com/doc", "http://other.test/x"]
        );
    }

    #[tokio::test]
    async fn hash_embedder_is_deterministic_and_normalized() {
        let embedder = HashEmbeddingGenerator::new();
        let a = embedder.embed("the quick brown fox").await.unwrap();
        let b = embedder.embed("the quick brown fox").await.unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert_ne!(a, embedder.embed("completely different words").await.unwrap());
    }

    #[tokio::test]
    async fn indexing_pipeline_end_to_end() {
        let db = Db::open_in_memory().unwrap();
        let document_id = documents::insert_document_row(
            &db,
            NewDocument {
                title: "Garden plan".to_string(),
                source_type: "upload".to_string(),
                source_id: "alice".to_string(),
                source_uri: None,
                file_path: None,
                doc_metadata: json!({"content": "Plant tomatoes in spring.\n\nWater them daily."}),
            },
        )
        .unwrap();

        let completion = PushSource::new("document_indexing");
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        completion.start(tx).await.unwrap();

        let indexer = DocumentIndexer::new(db.clone(), Arc::new(HashEmbeddingGenerator::new()))
            .with_completion_source(completion);
        let chunks = indexer.index_document(document_id).await.unwrap();
        assert!(chunks >= 2); // title + at least one content chunk

        // Keyword leg of hybrid search finds the chunk.
        let hits = documents::hybrid_search(&db, "tomatoes", None, 5).unwrap();
        assert_eq!(hits[0].title, "Garden plan");

        // Completion event published on the indexing feed.
        let event = rx.recv().await.unwrap();
        assert_eq!(event.source, "document_indexing");
        assert_eq!(event.payload["document_id"], document_id);
    }

    #[tokio::test]
    async fn handler_fails_cleanly_on_missing_document() {
        let db = Db::open_in_memory().unwrap();
        let indexer =
            Arc::new(DocumentIndexer::new(db.clone(), Arc::new(HashEmbeddingGenerator::new())));
        let handler = index_document_handler(indexer);

        let mut worker = haven_queue::TaskWorker::new(db.clone(), Default::default());
        worker.register_handler("index_document", handler);
        haven_storage::tasks::enqueue(
            &db,
            "idx-1",
            "index_document",
            &json!({"document_id": 999, "source_type": "upload", "source_id": "alice"}),
            haven_storage::tasks::EnqueueOptions {
                max_retries: Some(0),
                ..Default::default()
            },
        )
        .unwrap();

        worker.poll_once().await.unwrap();
        let task = haven_storage::tasks::get(&db, "idx-1").unwrap().unwrap();
        assert_eq!(task.status, haven_core::types::TaskStatus::Failed);
        assert!(task.last_error.unwrap().contains("Document not found"));
    }
}
