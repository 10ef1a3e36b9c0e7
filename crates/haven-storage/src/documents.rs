//! Documents, embedding chunks, and hybrid retrieval.
//!
//! Keyword search runs over an FTS5 external-content index kept in sync on
//! write; vector search is cosine similarity over JSON-stored vectors. The
//! two rankings are fused by reciprocal rank (k = 60).

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::Value;

use crate::db::{parse_ts, Db};
use crate::error::Result;

/// Constant of the reciprocal-rank fusion formula 1 / (k + rank).
const RRF_K: f64 = 60.0;

#[derive(Debug, Clone, Serialize)]
pub struct DocumentRecord {
    pub id: i64,
    pub title: String,
    pub source_type: String,
    pub source_id: String,
    pub source_uri: Option<String>,
    pub file_path: Option<String>,
    pub doc_metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// A search hit with its fused score.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub document_id: i64,
    pub title: String,
    pub content: String,
    pub embedding_type: String,
    pub score: f64,
}

pub struct NewDocument {
    pub title: String,
    pub source_type: String,
    pub source_id: String,
    pub source_uri: Option<String>,
    pub file_path: Option<String>,
    pub doc_metadata: Value,
}

/// Insert a document with all of its embedding rows in one transaction —
/// the indexing pipeline's terminal write.
pub fn insert_document(
    db: &Db,
    doc: NewDocument,
    embeddings: &[EmbeddingChunk],
) -> Result<i64> {
    db.with_tx(|tx| {
        tx.execute(
            "INSERT INTO documents
             (title, source_type, source_id, source_uri, file_path, doc_metadata, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                doc.title,
                doc.source_type,
                doc.source_id,
                doc.source_uri,
                doc.file_path,
                serde_json::to_string(&doc.doc_metadata)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        let document_id = tx.last_insert_rowid();

        for chunk in embeddings {
            tx.execute(
                "INSERT INTO document_embeddings
                 (document_id, chunk_index, embedding_type, embedding_model, embedding, content)
                 VALUES (?1,?2,?3,?4,?5,?6)",
                params![
                    document_id,
                    chunk.chunk_index,
                    chunk.embedding_type,
                    chunk.embedding_model,
                    serde_json::to_string(&chunk.embedding)?,
                    chunk.content,
                ],
            )?;
            let rowid = tx.last_insert_rowid();
            // Keep the external-content FTS index in sync.
            tx.execute(
                "INSERT INTO document_embeddings_fts (rowid, content) VALUES (?1, ?2)",
                params![rowid, chunk.content],
            )?;
        }

        Ok(document_id)
    })
}

/// Embedding data as produced by the pipeline (document id not yet known).
pub struct EmbeddingChunk {
    pub chunk_index: u32,
    pub embedding_type: String,
    pub embedding_model: String,
    pub embedding: Vec<f32>,
    pub content: String,
}

/// Insert just the document row — the indexing task adds embeddings later.
pub fn insert_document_row(db: &Db, doc: NewDocument) -> Result<i64> {
    let conn = db.lock();
    conn.execute(
        "INSERT INTO documents
         (title, source_type, source_id, source_uri, file_path, doc_metadata, created_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7)",
        params![
            doc.title,
            doc.source_type,
            doc.source_id,
            doc.source_uri,
            doc.file_path,
            serde_json::to_string(&doc.doc_metadata)?,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Attach embedding rows (and their FTS shadow) to an existing document in
/// one transaction.
pub fn add_embeddings(db: &Db, document_id: i64, embeddings: &[EmbeddingChunk]) -> Result<()> {
    db.with_tx(|tx| {
        for chunk in embeddings {
            tx.execute(
                "INSERT INTO document_embeddings
                 (document_id, chunk_index, embedding_type, embedding_model, embedding, content)
                 VALUES (?1,?2,?3,?4,?5,?6)",
                params![
                    document_id,
                    chunk.chunk_index,
                    chunk.embedding_type,
                    chunk.embedding_model,
                    serde_json::to_string(&chunk.embedding)?,
                    chunk.content,
                ],
            )?;
            let rowid = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO document_embeddings_fts (rowid, content) VALUES (?1, ?2)",
                params![rowid, chunk.content],
            )?;
        }
        Ok(())
    })
}

pub fn get_document(db: &Db, id: i64) -> Result<Option<DocumentRecord>> {
    let conn = db.lock();
    let raw = conn
        .query_row(
            "SELECT id, title, source_type, source_id, source_uri, file_path,
                    doc_metadata, created_at
             FROM documents WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            },
        )
        .optional()?;
    let Some((id, title, source_type, source_id, source_uri, file_path, meta, created)) = raw
    else {
        return Ok(None);
    };
    Ok(Some(DocumentRecord {
        id,
        title,
        source_type,
        source_id,
        source_uri,
        file_path,
        doc_metadata: serde_json::from_str(&meta)?,
        created_at: parse_ts("documents", &created)?,
    }))
}

pub fn delete_document(db: &Db, id: i64) -> Result<bool> {
    db.with_tx(|tx| {
        // Drop FTS shadow rows first (external-content tables don't cascade).
        tx.execute(
            "DELETE FROM document_embeddings_fts
             WHERE rowid IN (SELECT id FROM document_embeddings WHERE document_id = ?1)",
            params![id],
        )?;
        tx.execute(
            "DELETE FROM document_embeddings WHERE document_id = ?1",
            params![id],
        )?;
        let n = tx.execute("DELETE FROM documents WHERE id = ?1", params![id])?;
        Ok(n > 0)
    })
}

/// Hybrid search: vector cosine ranking fused with FTS5 keyword ranking via
/// reciprocal rank. Either leg may be empty (no query vector, or no keyword
/// hits) — the other leg then dominates.
pub fn hybrid_search(
    db: &Db,
    keyword_query: &str,
    query_vector: Option<&[f32]>,
    limit: usize,
) -> Result<Vec<SearchHit>> {
    let keyword_ranked = keyword_search(db, keyword_query, limit * 4)?;
    let vector_ranked = match query_vector {
        Some(v) => vector_search(db, v, limit * 4)?,
        None => Vec::new(),
    };

    // rowid → (fused score, hit)
    let mut fused: std::collections::HashMap<i64, (f64, SearchHit)> =
        std::collections::HashMap::new();

    for (rank, hit) in keyword_ranked.into_iter().enumerate() {
        let score = 1.0 / (RRF_K + rank as f64 + 1.0);
        fused
            .entry(hit.0)
            .and_modify(|(s, _)| *s += score)
            .or_insert((score, hit.1));
    }
    for (rank, hit) in vector_ranked.into_iter().enumerate() {
        let score = 1.0 / (RRF_K + rank as f64 + 1.0);
        fused
            .entry(hit.0)
            .and_modify(|(s, _)| *s += score)
            .or_insert((score, hit.1));
    }

    let mut hits: Vec<SearchHit> = fused
        .into_values()
        .map(|(score, mut hit)| {
            hit.score = score;
            hit
        })
        .collect();
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(limit);
    Ok(hits)
}

fn keyword_search(db: &Db, query: &str, limit: usize) -> Result<Vec<(i64, SearchHit)>> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }
    let conn = db.lock();
    let mut stmt = conn.prepare(
        "SELECT e.id, e.document_id, d.title, e.content, e.embedding_type
         FROM document_embeddings_fts f
         JOIN document_embeddings e ON e.id = f.rowid
         JOIN documents d ON d.id = e.document_id
         WHERE document_embeddings_fts MATCH ?1
         ORDER BY rank LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![fts_quote(query), limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                SearchHit {
                    document_id: row.get(1)?,
                    title: row.get(2)?,
                    content: row.get(3)?,
                    embedding_type: row.get(4)?,
                    score: 0.0,
                },
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn vector_search(db: &Db, query: &[f32], limit: usize) -> Result<Vec<(i64, SearchHit)>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(
        "SELECT e.id, e.document_id, d.title, e.content, e.embedding_type, e.embedding
         FROM document_embeddings e JOIN documents d ON d.id = e.document_id",
    )?;
    let mut scored = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?
        .filter_map(|r| r.ok())
        .filter_map(|(id, doc_id, title, content, etype, emb_json)| {
            let vector: Vec<f32> = serde_json::from_str(&emb_json).ok()?;
            let sim = cosine(query, &vector)?;
            Some((
                sim,
                (
                    id,
                    SearchHit {
                        document_id: doc_id,
                        title,
                        content,
                        embedding_type: etype,
                        score: 0.0,
                    },
                ),
            ))
        })
        .collect::<Vec<_>>();

    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    Ok(scored.into_iter().take(limit).map(|(_, hit)| hit).collect())
}

fn cosine(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        dot += (*x as f64) * (*y as f64);
        na += (*x as f64).powi(2);
        nb += (*y as f64).powi(2);
    }
    if na == 0.0 || nb == 0.0 {
        return None;
    }
    Some(dot / (na.sqrt() * nb.sqrt()))
}

/// Quote each term so user input can't inject FTS5 query syntax.
fn fts_quote(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn db() -> Db {
        Db::open_in_memory().unwrap()
    }

    fn doc(title: &str) -> NewDocument {
        NewDocument {
            title: title.to_string(),
            source_type: "upload".to_string(),
            source_id: "alice".to_string(),
            source_uri: None,
            file_path: None,
            doc_metadata: json!({}),
        }
    }

    fn chunk(content: &str, vector: Vec<f32>) -> EmbeddingChunk {
        EmbeddingChunk {
            chunk_index: 0,
            embedding_type: "content_chunk".to_string(),
            embedding_model: "test-model".to_string(),
            embedding: vector,
            content: content.to_string(),
        }
    }

    #[test]
    fn insert_and_keyword_search() {
        let db = db();
        insert_document(
            &db,
            doc("Garden plan"),
            &[chunk("plant tomatoes in spring", vec![1.0, 0.0])],
        )
        .unwrap();
        insert_document(
            &db,
            doc("Tax notes"),
            &[chunk("file the return by april", vec![0.0, 1.0])],
        )
        .unwrap();

        let hits = hybrid_search(&db, "tomatoes", None, 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Garden plan");
    }

    #[test]
    fn vector_leg_ranks_by_similarity() {
        let db = db();
        insert_document(&db, doc("A"), &[chunk("alpha", vec![1.0, 0.0])]).unwrap();
        insert_document(&db, doc("B"), &[chunk("beta", vec![0.0, 1.0])]).unwrap();

        let hits = hybrid_search(&db, "", Some(&[0.9, 0.1]), 5).unwrap();
        assert_eq!(hits[0].title, "A");
    }

    #[test]
    fn fusion_prefers_documents_hit_by_both_legs() {
        let db = db();
        insert_document(&db, doc("Both"), &[chunk("solar panels", vec![1.0, 0.0])]).unwrap();
        insert_document(&db, doc("KeywordOnly"), &[chunk("solar flares", vec![0.0, 1.0])])
            .unwrap();

        let hits = hybrid_search(&db, "solar", Some(&[1.0, 0.0]), 5).unwrap();
        assert_eq!(hits[0].title, "Both");
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn delete_clears_fts_shadow() {
        let db = db();
        let id =
            insert_document(&db, doc("Gone"), &[chunk("ephemeral words", vec![1.0])]).unwrap();
        assert!(delete_document(&db, id).unwrap());
        assert!(hybrid_search(&db, "ephemeral", None, 5).unwrap().is_empty());
        assert!(get_document(&db, id).unwrap().is_none());
    }

    #[test]
    fn fts_query_is_injection_safe() {
        let db = db();
        insert_document(&db, doc("Doc"), &[chunk("ordinary text", vec![1.0])]).unwrap();
        // Raw FTS syntax in user input must not error out.
        assert!(hybrid_search(&db, "ordinary AND (", None, 5).is_ok());
    }
}
