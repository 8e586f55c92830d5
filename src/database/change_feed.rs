//! MongoDB change stream transport for the event hub.
//!
//! Requires the deployment to run as a replica set.

use futures::{Stream, StreamExt};
use mongodb::bson::{doc, Bson, Document};
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType};
use mongodb::options::FullDocumentType;
use tracing::info;

use super::{Database, StoreError};
use crate::sync::{ChangeEvent, FeedError};

/// Open a change stream over `collections`, translated into hub events.
pub async fn open_change_feed(
    db: &Database,
    collections: &[&str],
) -> Result<impl Stream<Item = Result<ChangeEvent, FeedError>> + Send + 'static, StoreError> {
    let names: Vec<Bson> = collections
        .iter()
        .map(|name| Bson::String(name.to_string()))
        .collect();

    let stream = db
        .db()
        .watch()
        .pipeline(vec![doc! { "$match": { "ns.coll": { "$in": names } } }])
        .full_document(FullDocumentType::UpdateLookup)
        .await?;

    info!("Watching change stream for {:?}", collections);
    Ok(stream.map(translate))
}

fn translate(
    item: mongodb::error::Result<ChangeStreamEvent<Document>>,
) -> Result<ChangeEvent, FeedError> {
    let event = item.map_err(|e| FeedError::Disconnected(e.to_string()))?;
    let operation = event.operation_type.clone();

    match operation {
        OperationType::Invalidate
        | OperationType::Drop
        | OperationType::DropDatabase
        | OperationType::Rename => {
            return Err(FeedError::Disconnected(format!(
                "change stream invalidated by {:?}",
                operation
            )));
        }
        _ => {}
    }

    let record_type = event
        .ns
        .and_then(|ns| ns.coll)
        .ok_or_else(|| FeedError::Malformed(format!("{:?} event without a collection", operation)))?;

    match operation {
        OperationType::Insert | OperationType::Update | OperationType::Replace => {
            let document = event.full_document.ok_or_else(|| {
                FeedError::Malformed(format!("{} {:?} without full document", record_type, operation))
            })?;
            Ok(ChangeEvent::upsert(record_type, document))
        }
        OperationType::Delete => {
            let id = event
                .document_key
                .and_then(|mut key| key.remove("_id"))
                .ok_or_else(|| FeedError::Malformed(format!("{} delete without _id", record_type)))?;
            Ok(ChangeEvent::delete(record_type, id))
        }
        other => Err(FeedError::Malformed(format!(
            "unsupported {} operation {:?}",
            record_type, other
        ))),
    }
}
