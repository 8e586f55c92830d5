//! Keyed record store.
//!
//! `RecordStore` is the narrow contract the entity cache needs from
//! persistence; `MongoStore` implements it over one typed collection.

use std::future::Future;

use futures::TryStreamExt;
use mongodb::bson::{self, doc, Document};
use mongodb::Collection;
use thiserror::Error;
use tracing::debug;

use super::Database;
use crate::entity::Record;

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("mongodb: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("key cannot be encoded: {0}")]
    Key(#[from] bson::ser::Error),

    #[cfg(test)]
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Storage operations for one record type.
pub trait RecordStore<T: Record>: Send + Sync + 'static {
    /// Load a record. A missing record is `Ok(None)`.
    fn find_by_key(
        &self,
        key: &T::Key,
    ) -> impl Future<Output = Result<Option<T>, StoreError>> + Send;

    fn find_all(&self) -> impl Future<Output = Result<Vec<T>, StoreError>> + Send;

    fn upsert(&self, record: &T) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Delete a record, returning whether one existed.
    fn delete(&self, key: &T::Key) -> impl Future<Output = Result<bool, StoreError>> + Send;
}

/// `RecordStore` backed by the record's MongoDB collection.
pub struct MongoStore<T: Record> {
    collection: Collection<T>,
}

impl<T: Record> MongoStore<T> {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection(T::COLLECTION),
        }
    }

    fn key_filter(key: &T::Key) -> Result<Document, StoreError> {
        Ok(doc! { "_id": bson::to_bson(key)? })
    }
}

impl<T: Record> RecordStore<T> for MongoStore<T> {
    async fn find_by_key(&self, key: &T::Key) -> Result<Option<T>, StoreError> {
        let result = self.collection.find_one(Self::key_filter(key)?).await?;
        debug!("DB get {} {:?}: {:?}", T::COLLECTION, key, result.is_some());
        Ok(result)
    }

    async fn find_all(&self) -> Result<Vec<T>, StoreError> {
        let cursor = self.collection.find(doc! {}).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn upsert(&self, record: &T) -> Result<(), StoreError> {
        let key = record.key();
        let options = mongodb::options::ReplaceOptions::builder()
            .upsert(true)
            .build();

        self.collection
            .replace_one(Self::key_filter(&key)?, record)
            .with_options(options)
            .await?;

        debug!("Saved {} {:?}", T::COLLECTION, key);
        Ok(())
    }

    async fn delete(&self, key: &T::Key) -> Result<bool, StoreError> {
        let result = self.collection.delete_one(Self::key_filter(key)?).await?;
        debug!(
            "Deleted {} {:?}: {}",
            T::COLLECTION,
            key,
            result.deleted_count > 0
        );
        Ok(result.deleted_count > 0)
    }
}
