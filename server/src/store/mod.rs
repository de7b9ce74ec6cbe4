//! Persistence for events and registrations.
//!
//! Handlers talk to the database only through the [`Store`] trait, held as an
//! `Arc<dyn Store>` in the application state. The handle is created once at
//! startup and torn down with [`Store::shutdown`] after the server stops.
//!
//! Two implementations exist:
//!
//! - [`mongo::MongoStore`] backed by the `event` and `registration`
//!   collections of a MongoDB database
//! - [`memory::MemoryStore`] keeping documents in process memory, used by
//!   tests and local development
//!
//! Both share the same semantics: ids are [`ObjectId`]s rendered as 24-char
//! hex strings, events are ordered by `createdAt` then `_id`, and updates
//! merge the patch into the stored document.

use async_trait::async_trait;
use mongodb::bson::oid::ObjectId;
use thiserror::Error;

use crate::error::ApiError;
use crate::models::{
    Event, EventDetails, EventQuery, Patch, Registration, RegistrationDetails, UpdateSummary,
};

pub mod memory;
pub mod mongo;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

/// Errors from the backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database driver reported a failure.
    #[error("database error: {0}")]
    Database(#[from] mongodb::error::Error),

    /// A stored document did not have the expected shape.
    #[error("failed to decode document: {0}")]
    Decode(String),

    /// A record could not be converted into a document.
    #[error("failed to encode document: {0}")]
    Encode(String),

    /// The store is not reachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    pub fn encode(message: impl Into<String>) -> Self {
        Self::Encode(message.into())
    }
}

/// Record storage used by the route handlers.
#[async_trait]
pub trait Store: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// Checks that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Inserts an event and returns its generated id.
    async fn create_event(&self, details: EventDetails) -> Result<ObjectId, StoreError>;

    /// Lists events matching the query. No match yields an empty list.
    async fn list_events(&self, query: &EventQuery) -> Result<Vec<Event>, StoreError>;

    async fn get_event(&self, id: ObjectId) -> Result<Option<Event>, StoreError>;

    /// Merges `patch` into the event.
    async fn update_event(&self, id: ObjectId, patch: Patch) -> Result<UpdateSummary, StoreError>;

    /// Removes the event, returning how many records were deleted.
    async fn delete_event(&self, id: ObjectId) -> Result<u64, StoreError>;

    /// Adds one to the event's `registrationCount`.
    ///
    /// Returns `false` when no event has the given id, including when
    /// `marathon_id` is not a well-formed id.
    async fn increment_registration_count(&self, marathon_id: &str) -> Result<bool, StoreError>;

    /// Raises the event's `registrationCount` to at least `at_least`.
    /// Never lowers it.
    async fn raise_registration_count(
        &self,
        id: ObjectId,
        at_least: i64,
    ) -> Result<UpdateSummary, StoreError>;

    async fn insert_registration(
        &self,
        details: RegistrationDetails,
    ) -> Result<ObjectId, StoreError>;

    /// Lists registrations made with the given email.
    async fn list_registrations(&self, email: &str) -> Result<Vec<Registration>, StoreError>;

    /// Counts registrations pointing at the given event id.
    async fn count_registrations(&self, marathon_id: &str) -> Result<u64, StoreError>;

    async fn get_registration(&self, id: ObjectId) -> Result<Option<Registration>, StoreError>;

    async fn update_registration(
        &self,
        id: ObjectId,
        patch: Patch,
    ) -> Result<UpdateSummary, StoreError>;

    async fn delete_registration(&self, id: ObjectId) -> Result<u64, StoreError>;

    /// Releases connections. The store must not be used afterwards.
    async fn shutdown(&self);
}

/// Parses a path id, rejecting malformed ones before any store access.
pub fn parse_id(raw: &str) -> Result<ObjectId, ApiError> {
    ObjectId::parse_str(raw).map_err(|_| ApiError::invalid_id(raw))
}
