//! Attachment registry — metadata + content lifecycle.

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use haven_storage::attachments::{self, AttachmentMetadata, SourceType};
use haven_storage::Db;

use crate::error::Result;
use crate::store::BlobStore;

/// Authorization scope for [`AttachmentRegistry::delete_attachment`].
#[derive(Debug, Clone)]
pub enum DeleteScope {
    /// Linked attachment: caller must name the owning conversation.
    Conversation(String),
    /// Unlinked attachment: caller must be the uploading user.
    User(String),
}

/// Mediates user-, tool-, and script-produced attachments.
#[derive(Clone)]
pub struct AttachmentRegistry {
    db: Db,
    store: BlobStore,
    base_url: String,
}

impl AttachmentRegistry {
    pub fn new(db: Db, store: BlobStore, base_url: impl Into<String>) -> Self {
        Self {
            db,
            store,
            base_url: base_url.into(),
        }
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    /// Register a user upload: write the blob, then the metadata row.
    /// Without a conversation id the attachment starts unlinked (staging)
    /// and must be claimed later.
    #[allow(clippy::too_many_arguments)]
    pub async fn register_user_attachment(
        &self,
        content: &[u8],
        filename: &str,
        mime_type: &str,
        conversation_id: Option<&str>,
        message_id: Option<i64>,
        user_id: &str,
        description: Option<&str>,
    ) -> Result<AttachmentMetadata> {
        let attachment_id = Uuid::new_v4().to_string();
        let path = self.store.write(&attachment_id, content).await?;

        let meta = AttachmentMetadata {
            attachment_id: attachment_id.clone(),
            source_type: SourceType::User,
            source_id: user_id.to_string(),
            mime_type: mime_type.to_string(),
            description: description
                .map(String::from)
                .unwrap_or_else(|| format!("User uploaded: {filename}")),
            size: content.len() as u64,
            content_url: Some(format!("{}/{attachment_id}", self.base_url)),
            storage_path: Some(path.to_string_lossy().into_owned()),
            conversation_id: conversation_id.map(String::from),
            message_id,
            created_at: Utc::now(),
            accessed_at: None,
            metadata: json!({"original_filename": filename, "upload_method": "api"}),
        };
        attachments::insert(&self.db, &meta)?;
        info!(attachment_id = %meta.attachment_id, user = %user_id, "user attachment registered");
        Ok(meta)
    }

    /// Register metadata for a blob a tool already wrote through the store.
    #[allow(clippy::too_many_arguments)]
    pub async fn register_tool_attachment(
        &self,
        attachment_id: &str,
        tool_name: &str,
        mime_type: &str,
        description: &str,
        size: u64,
        conversation_id: Option<&str>,
        message_id: Option<i64>,
        metadata: Option<Value>,
    ) -> Result<AttachmentMetadata> {
        let meta = AttachmentMetadata {
            attachment_id: attachment_id.to_string(),
            source_type: SourceType::Tool,
            source_id: tool_name.to_string(),
            mime_type: mime_type.to_string(),
            description: description.to_string(),
            size,
            content_url: Some(format!("{}/{attachment_id}", self.base_url)),
            storage_path: self
                .store
                .path_for(attachment_id)
                .ok()
                .map(|p| p.to_string_lossy().into_owned()),
            conversation_id: conversation_id.map(String::from),
            message_id,
            created_at: Utc::now(),
            accessed_at: None,
            metadata: metadata.unwrap_or_else(|| json!({})),
        };
        attachments::insert(&self.db, &meta)?;
        info!(%attachment_id, tool = %tool_name, "tool attachment registered");
        Ok(meta)
    }

    /// Write content and register it as produced by a script run.
    pub async fn register_script_attachment(
        &self,
        content: &[u8],
        script_id: &str,
        mime_type: &str,
        description: &str,
        conversation_id: Option<&str>,
    ) -> Result<AttachmentMetadata> {
        let attachment_id = Uuid::new_v4().to_string();
        let path = self.store.write(&attachment_id, content).await?;

        let meta = AttachmentMetadata {
            attachment_id: attachment_id.clone(),
            source_type: SourceType::Script,
            source_id: script_id.to_string(),
            mime_type: mime_type.to_string(),
            description: description.to_string(),
            size: content.len() as u64,
            content_url: Some(format!("{}/{attachment_id}", self.base_url)),
            storage_path: Some(path.to_string_lossy().into_owned()),
            conversation_id: conversation_id.map(String::from),
            message_id: None,
            created_at: Utc::now(),
            accessed_at: None,
            metadata: json!({}),
        };
        attachments::insert(&self.db, &meta)?;
        Ok(meta)
    }

    /// Metadata lookup; bumps `accessed_at` as a side effect.
    pub async fn get_attachment(&self, attachment_id: &str) -> Result<Option<AttachmentMetadata>> {
        let meta = attachments::get(&self.db, attachment_id)?;
        if meta.is_some() {
            attachments::touch(&self.db, attachment_id, Utc::now())?;
        }
        Ok(meta)
    }

    /// Blob content, gated on the metadata row existing.
    pub async fn get_attachment_content(&self, attachment_id: &str) -> Result<Option<Vec<u8>>> {
        if self.get_attachment(attachment_id).await?.is_none() {
            return Ok(None);
        }
        let content = self.store.read(attachment_id).await?;
        if content.is_none() {
            warn!(%attachment_id, "metadata exists but blob file is missing");
        }
        Ok(content)
    }

    pub async fn list_attachments(
        &self,
        conversation_id: Option<&str>,
        source_type: Option<SourceType>,
        limit: usize,
    ) -> Result<Vec<AttachmentMetadata>> {
        Ok(attachments::list(&self.db, conversation_id, source_type, limit)?)
    }

    /// Atomic delete: the authorization predicate runs inside the DB
    /// statement, and the blob file is removed only after the row is gone.
    pub async fn delete_attachment(&self, attachment_id: &str, scope: DeleteScope) -> Result<bool> {
        let deleted = match &scope {
            DeleteScope::Conversation(conv) => {
                attachments::delete_linked(&self.db, attachment_id, conv)?
            }
            DeleteScope::User(user) => {
                attachments::delete_unlinked(&self.db, attachment_id, user)?
            }
        };
        if !deleted {
            info!(%attachment_id, "delete refused: not found or access denied");
            return Ok(false);
        }
        let file_deleted = self.store.delete(attachment_id).await?;
        info!(%attachment_id, file_deleted, "attachment deleted");
        Ok(true)
    }

    /// Atomically claim an unlinked user attachment into a conversation.
    /// Exactly one concurrent caller wins; losers get `None`.
    pub async fn claim_unlinked_attachment(
        &self,
        attachment_id: &str,
        conversation_id: &str,
        required_source_id: &str,
    ) -> Result<Option<AttachmentMetadata>> {
        let claimed = attachments::claim_unlinked(
            &self.db,
            attachment_id,
            conversation_id,
            required_source_id,
        )?;
        if claimed.is_some() {
            attachments::touch(&self.db, attachment_id, Utc::now())?;
            info!(%attachment_id, %conversation_id, "attachment claimed");
        }
        Ok(claimed)
    }

    /// Unconditional linking (used when a tool result joins a conversation).
    pub async fn update_attachment_conversation(
        &self,
        attachment_id: &str,
        conversation_id: &str,
    ) -> Result<bool> {
        Ok(attachments::update_conversation(&self.db, attachment_id, conversation_id)?)
    }

    /// Link a metadata row to the message it was sent with.
    pub async fn link_to_message(&self, attachment_id: &str, message_id: i64) -> Result<bool> {
        Ok(attachments::link_to_message(&self.db, attachment_id, message_id)?)
    }

    /// Remove blob files no metadata row references. Returns the count.
    pub async fn cleanup_orphaned_attachments(&self) -> Result<usize> {
        let referenced = attachments::referenced_ids(&self.db)?;
        self.store.cleanup_orphans(&referenced).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry() -> (AttachmentRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_in_memory().unwrap();
        let store = BlobStore::new(dir.path()).unwrap();
        (AttachmentRegistry::new(db, store, "/attachments"), dir)
    }

    #[tokio::test]
    async fn upload_claim_and_content() {
        let (reg, _dir) = registry().await;
        let meta = reg
            .register_user_attachment(b"png-bytes", "p.png", "image/png", None, None, "alice", None)
            .await
            .unwrap();
        assert!(meta.conversation_id.is_none());
        assert_eq!(meta.description, "User uploaded: p.png");

        let claimed = reg
            .claim_unlinked_attachment(&meta.attachment_id, "c1", "alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.conversation_id.as_deref(), Some("c1"));

        // Claim is one-shot.
        assert!(reg
            .claim_unlinked_attachment(&meta.attachment_id, "c2", "alice")
            .await
            .unwrap()
            .is_none());

        let content = reg
            .get_attachment_content(&meta.attachment_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(content, b"png-bytes");

        // accessed_at was bumped by the reads.
        let meta = reg.get_attachment(&meta.attachment_id).await.unwrap().unwrap();
        assert!(meta.accessed_at.is_some());
    }

    #[tokio::test]
    async fn delete_respects_scope_and_removes_blob() {
        let (reg, _dir) = registry().await;
        let meta = reg
            .register_user_attachment(b"x", "f", "text/plain", Some("c1"), None, "alice", None)
            .await
            .unwrap();

        // Wrong conversation refused; blob intact.
        assert!(!reg
            .delete_attachment(&meta.attachment_id, DeleteScope::Conversation("c2".into()))
            .await
            .unwrap());
        assert!(reg.store().read(&meta.attachment_id).await.unwrap().is_some());

        assert!(reg
            .delete_attachment(&meta.attachment_id, DeleteScope::Conversation("c1".into()))
            .await
            .unwrap());
        assert!(reg.store().read(&meta.attachment_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn orphan_cleanup_counts_once() {
        let (reg, _dir) = registry().await;
        let kept = reg
            .register_user_attachment(b"keep", "k", "text/plain", None, None, "alice", None)
            .await
            .unwrap();
        // A blob with no metadata row — e.g. a crash between write and insert.
        reg.store().write("0000-orphan", b"lost").await.unwrap();

        assert_eq!(reg.cleanup_orphaned_attachments().await.unwrap(), 1);
        assert_eq!(reg.cleanup_orphaned_attachments().await.unwrap(), 0);
        assert!(reg.store().read(&kept.attachment_id).await.unwrap().is_some());
    }
}
