//! MongoDB-backed [`DeviceStore`].
//!
//! Device records live in one collection keyed by `_id`, with parameters
//! stored as nested documents. An [`UpdateRequest`] becomes a single
//! `updateOne` whose filter requires every gated path to exist, and it never
//! upserts.

use async_trait::async_trait;
use mongodb::Client;
use mongodb::Collection;
use mongodb::bson::Bson;
use mongodb::bson::DateTime;
use mongodb::bson::Document;
use mongodb::bson::doc;
use tokio::sync::RwLock;
use tracing::debug;

use super::DeviceStore;
use super::DocumentStoreError;
use super::TIMESTAMP_LEAF;
use super::UpdateRequest;
use super::UpdateResult;

impl From<mongodb::error::Error> for DocumentStoreError {
    fn from(err: mongodb::error::Error) -> Self {
        DocumentStoreError::Failed { reason: err.to_string() }
    }
}

pub struct MongoDeviceStore {
    client: RwLock<Option<Client>>,
    database: String,
    collection: String,
}

impl MongoDeviceStore {
    /// Connect to `url` and check the server answers a ping.
    pub async fn connect(url: &str, database: &str, collection: &str) -> Result<Self, DocumentStoreError> {
        let client = Client::with_uri_str(url).await?;
        client.database(database).run_command(doc! { "ping": 1 }).await?;
        debug!(database, collection, "connected to mongodb");
        Ok(Self {
            client: RwLock::new(Some(client)),
            database: database.to_string(),
            collection: collection.to_string(),
        })
    }

    async fn devices(&self) -> Result<Collection<Document>, DocumentStoreError> {
        let client = self.client.read().await;
        let client = client.as_ref().ok_or(DocumentStoreError::Disconnected)?;
        Ok(client.database(&self.database).collection(&self.collection))
    }
}

/// Translate `request` into an `updateOne` filter and update document.
pub fn update_documents(request: &UpdateRequest) -> Result<(Document, Document), DocumentStoreError> {
    let mut filter = doc! { "_id": request.device_id.as_str() };
    for path in &request.required_fields {
        filter.insert(path.as_str(), doc! { "$exists": true });
    }

    let mut set = Document::new();
    for (path, value) in &request.set_fields {
        set.insert(path.as_str(), field_value(path, value)?);
    }
    Ok((filter, doc! { "$set": set }))
}

fn field_value(path: &str, value: &serde_json::Value) -> Result<Bson, DocumentStoreError> {
    let is_timestamp = path.rsplit('.').next() == Some(TIMESTAMP_LEAF);
    if let (true, Some(millis)) = (is_timestamp, value.as_i64()) {
        return Ok(Bson::DateTime(DateTime::from_millis(millis)));
    }
    mongodb::bson::to_bson(value).map_err(|err| DocumentStoreError::Failed {
        reason: format!("cannot encode field '{path}': {err}"),
    })
}

#[async_trait]
impl DeviceStore for MongoDeviceStore {
    async fn update_if_exists(&self, request: UpdateRequest) -> Result<UpdateResult, DocumentStoreError> {
        let (filter, update) = update_documents(&request)?;
        let result = self.devices().await?.update_one(filter, update).await?;
        Ok(UpdateResult {
            matched: result.matched_count > 0,
        })
    }

    async fn disconnect(&self) -> Result<(), DocumentStoreError> {
        let client = self.client.write().await.take();
        if let Some(client) = client {
            client.shutdown().await;
            debug!("disconnected from mongodb");
        }
        Ok(())
    }
}
