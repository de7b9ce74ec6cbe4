//! In-process store.
//!
//! Documents are kept as JSON objects with a hex `_id`, so reads go through
//! the same decoding path as records loaded from MongoDB. Used by the HTTP
//! tests and by `MERATHON_IN_MEMORY_STORE=true`.

use std::cmp::Ordering;

use async_trait::async_trait;
use mongodb::bson::oid::ObjectId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::debug;

use super::{Store, StoreError};
use crate::models::{
    Event, EventDetails, EventQuery, Patch, Registration, RegistrationDetails, SortOrder,
    UpdateSummary,
};

type Document = Map<String, Value>;

/// Store keeping every record in memory. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    events: RwLock<Vec<Document>>,
    registrations: RwLock<Vec<Document>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn to_document<T: Serialize>(id: ObjectId, record: &T) -> Result<Document, StoreError> {
    match serde_json::to_value(record) {
        Ok(Value::Object(mut doc)) => {
            doc.insert("_id".to_string(), Value::String(id.to_hex()));
            Ok(doc)
        }
        Ok(other) => Err(StoreError::encode(format!("expected an object, got {other}"))),
        Err(e) => Err(StoreError::encode(e.to_string())),
    }
}

fn from_document<T: DeserializeOwned>(doc: &Document) -> Result<T, StoreError> {
    serde_json::from_value(Value::Object(doc.clone()))
        .map_err(|e| StoreError::decode(e.to_string()))
}

fn has_id(doc: &Document, id: ObjectId) -> bool {
    doc.get("_id").and_then(Value::as_str) == Some(id.to_hex().as_str())
}

fn str_field<'a>(doc: &'a Document, field: &str) -> Option<&'a str> {
    doc.get(field).and_then(Value::as_str)
}

/// Overwrites each patched field, reporting whether anything changed.
fn merge(doc: &mut Document, patch: Patch) -> UpdateSummary {
    let mut modified = false;
    for (field, value) in patch {
        if field == "_id" {
            continue;
        }
        if doc.get(&field) != Some(&value) {
            doc.insert(field, value);
            modified = true;
        }
    }

    UpdateSummary {
        matched_count: 1,
        modified_count: u64::from(modified),
    }
}

fn registration_count(doc: &Document) -> i64 {
    doc.get("registrationCount")
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

fn compare_created(a: &Document, b: &Document) -> Ordering {
    str_field(a, "createdAt")
        .cmp(&str_field(b, "createdAt"))
        .then_with(|| str_field(a, "_id").cmp(&str_field(b, "_id")))
}

#[async_trait]
impl Store for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn create_event(&self, details: EventDetails) -> Result<ObjectId, StoreError> {
        let id = ObjectId::new();
        let doc = to_document(id, &details)?;
        self.events.write().await.push(doc);
        Ok(id)
    }

    async fn list_events(&self, query: &EventQuery) -> Result<Vec<Event>, StoreError> {
        let events = self.events.read().await;

        let mut matching: Vec<&Document> = events
            .iter()
            .filter(|doc| match &query.creator {
                Some(email) => str_field(doc, "userEmail") == Some(email.as_str()),
                None => true,
            })
            .collect();

        matching.sort_by(|a, b| compare_created(a, b));
        if query.order == SortOrder::Desc {
            matching.reverse();
        }
        if let Some(limit) = query.limit {
            matching.truncate(limit as usize);
        }

        matching.into_iter().map(from_document).collect()
    }

    async fn get_event(&self, id: ObjectId) -> Result<Option<Event>, StoreError> {
        let events = self.events.read().await;
        events
            .iter()
            .find(|doc| has_id(doc, id))
            .map(from_document)
            .transpose()
    }

    async fn update_event(&self, id: ObjectId, patch: Patch) -> Result<UpdateSummary, StoreError> {
        let mut events = self.events.write().await;
        Ok(events
            .iter_mut()
            .find(|doc| has_id(doc, id))
            .map(|doc| merge(doc, patch))
            .unwrap_or_default())
    }

    async fn delete_event(&self, id: ObjectId) -> Result<u64, StoreError> {
        let mut events = self.events.write().await;
        let before = events.len();
        events.retain(|doc| !has_id(doc, id));
        Ok((before - events.len()) as u64)
    }

    async fn increment_registration_count(&self, marathon_id: &str) -> Result<bool, StoreError> {
        let Ok(id) = ObjectId::parse_str(marathon_id) else {
            debug!(marathon_id = %marathon_id, "Malformed event id, nothing to increment");
            return Ok(false);
        };

        let mut events = self.events.write().await;
        match events.iter_mut().find(|doc| has_id(doc, id)) {
            Some(doc) => {
                let count = registration_count(doc) + 1;
                doc.insert("registrationCount".to_string(), Value::from(count));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn raise_registration_count(
        &self,
        id: ObjectId,
        at_least: i64,
    ) -> Result<UpdateSummary, StoreError> {
        let mut events = self.events.write().await;
        let Some(doc) = events.iter_mut().find(|doc| has_id(doc, id)) else {
            return Ok(UpdateSummary::default());
        };

        let current = registration_count(doc);
        let modified = at_least > current;
        if modified {
            doc.insert("registrationCount".to_string(), Value::from(at_least));
        }

        Ok(UpdateSummary {
            matched_count: 1,
            modified_count: u64::from(modified),
        })
    }

    async fn insert_registration(
        &self,
        details: RegistrationDetails,
    ) -> Result<ObjectId, StoreError> {
        let id = ObjectId::new();
        let doc = to_document(id, &details)?;
        self.registrations.write().await.push(doc);
        Ok(id)
    }

    async fn list_registrations(&self, email: &str) -> Result<Vec<Registration>, StoreError> {
        let registrations = self.registrations.read().await;
        registrations
            .iter()
            .filter(|doc| str_field(doc, "email") == Some(email))
            .map(from_document)
            .collect()
    }

    async fn count_registrations(&self, marathon_id: &str) -> Result<u64, StoreError> {
        let registrations = self.registrations.read().await;
        Ok(registrations
            .iter()
            .filter(|doc| str_field(doc, "marathonId") == Some(marathon_id))
            .count() as u64)
    }

    async fn get_registration(&self, id: ObjectId) -> Result<Option<Registration>, StoreError> {
        let registrations = self.registrations.read().await;
        registrations
            .iter()
            .find(|doc| has_id(doc, id))
            .map(from_document)
            .transpose()
    }

    async fn update_registration(
        &self,
        id: ObjectId,
        patch: Patch,
    ) -> Result<UpdateSummary, StoreError> {
        let mut registrations = self.registrations.write().await;
        Ok(registrations
            .iter_mut()
            .find(|doc| has_id(doc, id))
            .map(|doc| merge(doc, patch))
            .unwrap_or_default())
    }

    async fn delete_registration(&self, id: ObjectId) -> Result<u64, StoreError> {
        let mut registrations = self.registrations.write().await;
        let before = registrations.len();
        registrations.retain(|doc| !has_id(doc, id));
        Ok((before - registrations.len()) as u64)
    }

    async fn shutdown(&self) {
        debug!("Memory store shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Distance, LIMITED_EVENT_COUNT};
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    fn event_details(title: &str, creator: &str, minutes: i64) -> EventDetails {
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        EventDetails {
            title: title.to_string(),
            start_registration_date: "2025-01-01".to_string(),
            end_registration_date: "2025-02-01".to_string(),
            marathon_start_date: "2025-03-01".to_string(),
            location: "Chittagong".to_string(),
            distance: Distance::Kilometers(42.2),
            description: "Coastal route".to_string(),
            image: "https://img.example/run.png".to_string(),
            user_email: Some(creator.to_string()),
            registration_count: 0,
            created_at: Some(base + Duration::minutes(minutes)),
            extra: Map::new(),
        }
    }

    fn registration(email: &str, marathon_id: &str) -> RegistrationDetails {
        RegistrationDetails {
            email: email.to_string(),
            marathon_id: marathon_id.to_string(),
            extra: Map::new(),
        }
    }

    fn patch(value: Value) -> Patch {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn created_event_is_retrievable() {
        let store = MemoryStore::new();
        let id = store
            .create_event(event_details("Dawn Run", "a@example.com", 0))
            .await
            .unwrap();

        let event = store.get_event(id).await.unwrap().expect("event exists");
        assert_eq!(event.id, id.to_hex());
        assert_eq!(event.details.title, "Dawn Run");
    }

    #[tokio::test]
    async fn missing_event_is_none() {
        let store = MemoryStore::new();
        assert!(store.get_event(ObjectId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_events_orders_and_filters() {
        let store = MemoryStore::new();
        store.create_event(event_details("First", "a@example.com", 0)).await.unwrap();
        store.create_event(event_details("Second", "b@example.com", 1)).await.unwrap();
        store.create_event(event_details("Third", "a@example.com", 2)).await.unwrap();

        let titles = |events: Vec<Event>| -> Vec<String> {
            events.into_iter().map(|e| e.details.title).collect()
        };

        let desc = store.list_events(&EventQuery::new()).await.unwrap();
        assert_eq!(titles(desc), vec!["Third", "Second", "First"]);

        let asc = store
            .list_events(&EventQuery::new().with_order(SortOrder::Asc))
            .await
            .unwrap();
        assert_eq!(titles(asc), vec!["First", "Second", "Third"]);

        let mine = store
            .list_events(&EventQuery::new().with_creator("a@example.com"))
            .await
            .unwrap();
        assert_eq!(titles(mine), vec!["Third", "First"]);

        let nobody = store
            .list_events(&EventQuery::new().with_creator("nobody@example.com"))
            .await
            .unwrap();
        assert!(nobody.is_empty());
    }

    #[tokio::test]
    async fn list_events_applies_limit() {
        let store = MemoryStore::new();
        for minute in 0..10 {
            store
                .create_event(event_details(&format!("Run {minute}"), "a@example.com", minute))
                .await
                .unwrap();
        }

        let limited = store
            .list_events(&EventQuery::new().with_limit(LIMITED_EVENT_COUNT))
            .await
            .unwrap();
        assert_eq!(limited.len(), 6);
        assert_eq!(limited[0].details.title, "Run 9");
    }

    #[tokio::test]
    async fn update_event_merges_fields() {
        let store = MemoryStore::new();
        let id = store
            .create_event(event_details("Old", "a@example.com", 0))
            .await
            .unwrap();

        let summary = store
            .update_event(id, patch(json!({"title": "New", "terrain": "trail"})))
            .await
            .unwrap();
        assert_eq!(summary, UpdateSummary { matched_count: 1, modified_count: 1 });

        let event = store.get_event(id).await.unwrap().unwrap();
        assert_eq!(event.details.title, "New");
        assert_eq!(event.details.location, "Chittagong");
        assert_eq!(event.details.extra.get("terrain"), Some(&json!("trail")));
    }

    #[tokio::test]
    async fn unchanged_update_reports_no_modification() {
        let store = MemoryStore::new();
        let id = store
            .create_event(event_details("Same", "a@example.com", 0))
            .await
            .unwrap();

        let summary = store
            .update_event(id, patch(json!({"title": "Same"})))
            .await
            .unwrap();
        assert_eq!(summary, UpdateSummary { matched_count: 1, modified_count: 0 });
    }

    #[tokio::test]
    async fn update_of_missing_event_matches_nothing() {
        let store = MemoryStore::new();
        let summary = store
            .update_event(ObjectId::new(), patch(json!({"title": "x"})))
            .await
            .unwrap();
        assert_eq!(summary, UpdateSummary::default());
    }

    #[tokio::test]
    async fn delete_reports_affected_count() {
        let store = MemoryStore::new();
        let id = store
            .create_event(event_details("Gone", "a@example.com", 0))
            .await
            .unwrap();

        assert_eq!(store.delete_event(id).await.unwrap(), 1);
        assert_eq!(store.delete_event(id).await.unwrap(), 0);
        assert_eq!(store.delete_event(ObjectId::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn increment_counts_each_registration() {
        let store = MemoryStore::new();
        let id = store
            .create_event(event_details("Counted", "a@example.com", 0))
            .await
            .unwrap();

        for _ in 0..3 {
            assert!(store.increment_registration_count(&id.to_hex()).await.unwrap());
        }

        let event = store.get_event(id).await.unwrap().unwrap();
        assert_eq!(event.details.registration_count, 3);
    }

    #[tokio::test]
    async fn increment_of_unknown_event_reports_false() {
        let store = MemoryStore::new();
        assert!(!store
            .increment_registration_count(&ObjectId::new().to_hex())
            .await
            .unwrap());
        assert!(!store.increment_registration_count("garbage").await.unwrap());
    }

    #[tokio::test]
    async fn raise_never_lowers_count() {
        let store = MemoryStore::new();
        let id = store
            .create_event(event_details("Raised", "a@example.com", 0))
            .await
            .unwrap();

        let raised = store.raise_registration_count(id, 4).await.unwrap();
        assert_eq!(raised.modified_count, 1);

        let lowered = store.raise_registration_count(id, 2).await.unwrap();
        assert_eq!(lowered, UpdateSummary { matched_count: 1, modified_count: 0 });

        let event = store.get_event(id).await.unwrap().unwrap();
        assert_eq!(event.details.registration_count, 4);
    }

    #[tokio::test]
    async fn registrations_are_listed_and_counted() {
        let store = MemoryStore::new();
        let marathon = ObjectId::new().to_hex();
        store.insert_registration(registration("a@example.com", &marathon)).await.unwrap();
        store.insert_registration(registration("b@example.com", &marathon)).await.unwrap();
        store.insert_registration(registration("a@example.com", "other")).await.unwrap();

        assert_eq!(store.list_registrations("a@example.com").await.unwrap().len(), 2);
        assert!(store.list_registrations("c@example.com").await.unwrap().is_empty());
        assert_eq!(store.count_registrations(&marathon).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn registration_update_and_delete() {
        let store = MemoryStore::new();
        let id = store
            .insert_registration(registration("a@example.com", "m1"))
            .await
            .unwrap();

        let summary = store
            .update_registration(id, patch(json!({"tShirtSize": "M"})))
            .await
            .unwrap();
        assert_eq!(summary.modified_count, 1);

        let stored = store.get_registration(id).await.unwrap().unwrap();
        assert_eq!(stored.details.extra.get("tShirtSize"), Some(&json!("M")));

        assert_eq!(store.delete_registration(id).await.unwrap(), 1);
        assert!(store.get_registration(id).await.unwrap().is_none());
    }
}
