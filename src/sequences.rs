//! Drip-sequence enrollment used by the `subscribe_sequence` webhook action.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::Database;

#[async_trait]
pub trait SequenceService: Send + Sync {
    /// Whether the sequence exists, belongs to `owner_id` and is accepting enrollments.
    async fn is_active(&self, owner_id: &str, sequence_id: Uuid) -> Result<bool, DatabaseError>;

    /// Enroll a contact. Returns `false` when it was already enrolled.
    async fn enroll(&self, sequence_id: Uuid, contact_id: Uuid) -> Result<bool, DatabaseError>;
}

pub struct DbSequenceService {
    store: Arc<dyn Database>,
}

impl DbSequenceService {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SequenceService for DbSequenceService {
    async fn is_active(&self, owner_id: &str, sequence_id: Uuid) -> Result<bool, DatabaseError> {
        Ok(self
            .store
            .get_sequence(sequence_id)
            .await?
            .is_some_and(|s| s.active && s.owner_id == owner_id))
    }

    async fn enroll(&self, sequence_id: Uuid, contact_id: Uuid) -> Result<bool, DatabaseError> {
        let enrolled = self.store.enroll_in_sequence(sequence_id, contact_id).await?;
        if enrolled {
            tracing::info!(sequence_id = %sequence_id, contact_id = %contact_id, "Contact enrolled in sequence");
        }
        Ok(enrolled)
    }
}
