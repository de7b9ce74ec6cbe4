//! MongoDB-backed store.
//!
//! Events live in the `event` collection and registrations in the
//! `registration` collection of the configured database. The client is built
//! once with Stable API v1 and shared by every request; the driver pools
//! connections internally.
//!
//! # Startup
//!
//! [`MongoStore::connect_with_retry`] pings the `admin` database before the
//! server starts accepting requests, retrying with exponential backoff:
//!
//! ```text
//! delay = min(2^attempt * 100ms + random(0, 100ms), 10s)
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, to_document, Bson, Document};
use mongodb::options::{ClientOptions, ServerApi, ServerApiVersion};
use mongodb::{Client, Collection};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::{Store, StoreError};
use crate::config::DatabaseConfig;
use crate::models::{
    Event, EventDetails, EventQuery, Patch, Registration, RegistrationDetails, UpdateSummary,
};

/// Collection holding marathon events.
pub const EVENT_COLLECTION: &str = "event";

/// Collection holding registrations.
pub const REGISTRATION_COLLECTION: &str = "registration";

/// Maximum number of connection attempts at startup.
const MAX_RETRY_ATTEMPTS: u32 = 5;

/// Base delay for exponential backoff (100ms).
const BASE_BACKOFF_MS: u64 = 100;

/// Maximum delay cap for exponential backoff (10 seconds).
const MAX_BACKOFF_MS: u64 = 10_000;

/// Maximum jitter to add to backoff delay (100ms).
const MAX_JITTER_MS: u64 = 100;

/// Application name reported to the server.
const APP_NAME: &str = "merathon-server";

/// Store backed by a MongoDB database.
#[derive(Debug, Clone)]
pub struct MongoStore {
    client: Client,
    events: Collection<Document>,
    registrations: Collection<Document>,
}

impl MongoStore {
    /// Builds a client for the configured database.
    ///
    /// The driver connects lazily, so success here does not mean the
    /// database is reachable. Use [`ping`](Store::ping) for that.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the connection string is invalid or
    /// cannot be resolved.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let mut options = ClientOptions::parse(&config.uri).await?;
        options.server_api = Some(
            ServerApi::builder()
                .version(ServerApiVersion::V1)
                .strict(true)
                .deprecation_errors(true)
                .build(),
        );
        options.app_name = Some(APP_NAME.to_string());

        let client = Client::with_options(options)?;
        let database = client.database(&config.name);

        debug!(database = %config.name, "MongoDB client created");

        Ok(Self {
            events: database.collection(EVENT_COLLECTION),
            registrations: database.collection(REGISTRATION_COLLECTION),
            client,
        })
    }

    /// Connects and pings, retrying up to 5 times.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if every attempt fails. The server
    /// should exit if this happens at startup.
    pub async fn connect_with_retry(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let mut last_error = String::new();

        for attempt in 0..MAX_RETRY_ATTEMPTS {
            let result = match Self::connect(config).await {
                Ok(store) => store.ping().await.map(|()| store),
                Err(e) => Err(e),
            };

            match result {
                Ok(store) => {
                    info!(
                        attempt = attempt + 1,
                        database = %config.name,
                        "Connected to MongoDB"
                    );
                    return Ok(store);
                }
                Err(e) => {
                    last_error = e.to_string();

                    if attempt < MAX_RETRY_ATTEMPTS - 1 {
                        let delay = calculate_backoff_delay(attempt);
                        warn!(
                            attempt = attempt + 1,
                            max_attempts = MAX_RETRY_ATTEMPTS,
                            delay_ms = delay.as_millis(),
                            error = %e,
                            "MongoDB connection failed, retrying"
                        );
                        sleep(delay).await;
                    } else {
                        error!(
                            attempts = MAX_RETRY_ATTEMPTS,
                            error = %e,
                            "MongoDB connection failed, no more retries"
                        );
                    }
                }
            }
        }

        Err(StoreError::Unavailable(format!(
            "all {MAX_RETRY_ATTEMPTS} connection attempts failed: {last_error}"
        )))
    }
}

/// Calculates the backoff delay for a given zero-indexed retry attempt.
fn calculate_backoff_delay(attempt: u32) -> Duration {
    let exponential_ms = BASE_BACKOFF_MS.saturating_mul(2u64.saturating_pow(attempt));
    let jitter_ms = rand::rng().random_range(0..=MAX_JITTER_MS);
    let total_ms = exponential_ms.saturating_add(jitter_ms).min(MAX_BACKOFF_MS);
    Duration::from_millis(total_ms)
}

fn encode<T: Serialize>(record: &T) -> Result<Document, StoreError> {
    to_document(record).map_err(|e| StoreError::encode(e.to_string()))
}

/// Turns a stored document into a record, rendering `_id` as hex.
fn decode<T: DeserializeOwned>(mut doc: Document) -> Result<T, StoreError> {
    let id = doc
        .get_object_id("_id")
        .map_err(|e| StoreError::decode(format!("bad _id: {e}")))?;
    doc.insert("_id", Bson::String(id.to_hex()));

    serde_json::from_value(Bson::Document(doc).into_relaxed_extjson())
        .map_err(|e| StoreError::decode(e.to_string()))
}

fn by_id(id: ObjectId) -> Document {
    doc! { "_id": id }
}

fn summary(result: mongodb::results::UpdateResult) -> UpdateSummary {
    UpdateSummary {
        matched_count: result.matched_count,
        modified_count: result.modified_count,
    }
}

async fn collect_records<T: DeserializeOwned>(
    cursor: mongodb::Cursor<Document>,
) -> Result<Vec<T>, StoreError> {
    let docs: Vec<Document> = cursor.try_collect().await?;
    docs.into_iter().map(decode).collect()
}

#[async_trait]
impl Store for MongoStore {
    fn backend(&self) -> &'static str {
        "mongodb"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await?;
        Ok(())
    }

    async fn create_event(&self, details: EventDetails) -> Result<ObjectId, StoreError> {
        let result = self.events.insert_one(encode(&details)?).await?;
        result
            .inserted_id
            .as_object_id()
            .ok_or_else(|| StoreError::decode("inserted id is not an ObjectId"))
    }

    async fn list_events(&self, query: &EventQuery) -> Result<Vec<Event>, StoreError> {
        let filter = match &query.creator {
            Some(email) => doc! { "userEmail": email.as_str() },
            None => doc! {},
        };
        let direction = query.order.direction();

        let mut find = self
            .events
            .find(filter)
            .sort(doc! { "createdAt": direction, "_id": direction });
        if let Some(limit) = query.limit {
            find = find.limit(i64::from(limit));
        }

        collect_records(find.await?).await
    }

    async fn get_event(&self, id: ObjectId) -> Result<Option<Event>, StoreError> {
        self.events
            .find_one(by_id(id))
            .await?
            .map(decode)
            .transpose()
    }

    async fn update_event(&self, id: ObjectId, patch: Patch) -> Result<UpdateSummary, StoreError> {
        let fields = encode(&patch)?;
        let result = self
            .events
            .update_one(by_id(id), doc! { "$set": fields })
            .await?;
        Ok(summary(result))
    }

    async fn delete_event(&self, id: ObjectId) -> Result<u64, StoreError> {
        Ok(self.events.delete_one(by_id(id)).await?.deleted_count)
    }

    async fn increment_registration_count(&self, marathon_id: &str) -> Result<bool, StoreError> {
        let Ok(id) = ObjectId::parse_str(marathon_id) else {
            debug!(marathon_id = %marathon_id, "Malformed event id, nothing to increment");
            return Ok(false);
        };

        let result = self
            .events
            .update_one(by_id(id), doc! { "$inc": { "registrationCount": 1_i64 } })
            .await?;
        Ok(result.matched_count > 0)
    }

    async fn raise_registration_count(
        &self,
        id: ObjectId,
        at_least: i64,
    ) -> Result<UpdateSummary, StoreError> {
        let result = self
            .events
            .update_one(by_id(id), doc! { "$max": { "registrationCount": at_least } })
            .await?;
        Ok(summary(result))
    }

    async fn insert_registration(
        &self,
        details: RegistrationDetails,
    ) -> Result<ObjectId, StoreError> {
        let result = self.registrations.insert_one(encode(&details)?).await?;
        result
            .inserted_id
            .as_object_id()
            .ok_or_else(|| StoreError::decode("inserted id is not an ObjectId"))
    }

    async fn list_registrations(&self, email: &str) -> Result<Vec<Registration>, StoreError> {
        let cursor = self.registrations.find(doc! { "email": email }).await?;
        collect_records(cursor).await
    }

    async fn count_registrations(&self, marathon_id: &str) -> Result<u64, StoreError> {
        Ok(self
            .registrations
            .count_documents(doc! { "marathonId": marathon_id })
            .await?)
    }

    async fn get_registration(&self, id: ObjectId) -> Result<Option<Registration>, StoreError> {
        self.registrations
            .find_one(by_id(id))
            .await?
            .map(decode)
            .transpose()
    }

    async fn update_registration(
        &self,
        id: ObjectId,
        patch: Patch,
    ) -> Result<UpdateSummary, StoreError> {
        let fields = encode(&patch)?;
        let result = self
            .registrations
            .update_one(by_id(id), doc! { "$set": fields })
            .await?;
        Ok(summary(result))
    }

    async fn delete_registration(&self, id: ObjectId) -> Result<u64, StoreError> {
        Ok(self.registrations.delete_one(by_id(id)).await?.deleted_count)
    }

    async fn shutdown(&self) {
        self.client.clone().shutdown().await;
        info!("MongoDB client shut down");
    }
}
