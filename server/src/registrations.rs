//! Registration write path.
//!
//! Registering is two steps that are not atomic:
//!
//! 1. insert the registration record
//! 2. add one to `registrationCount` on the event it points at
//!
//! If step 1 fails nothing else happens. If step 2 fails or matches no event
//! the registration is kept and the caller is told the counter was not
//! updated. Nothing is rolled back. [`reconcile_registration_count`] repairs
//! a counter that fell behind.

use mongodb::bson::oid::ObjectId;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::models::RegistrationDetails;
use crate::store::{Store, StoreError};

/// What happened when a registration was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterOutcome {
    pub inserted_id: String,

    /// Whether the event's `registrationCount` was incremented.
    pub counter_updated: bool,
}

/// Stores a registration and bumps the event's counter.
///
/// # Errors
///
/// Returns [`StoreError`] only if the insert fails. Increment failures are
/// logged and reported through [`RegisterOutcome::counter_updated`].
pub async fn register(
    store: &dyn Store,
    details: RegistrationDetails,
) -> Result<RegisterOutcome, StoreError> {
    let marathon_id = details.marathon_id.clone();
    let inserted_id = store.insert_registration(details).await?;

    let counter_updated = match store.increment_registration_count(&marathon_id).await {
        Ok(true) => true,
        Ok(false) => {
            warn!(
                registration_id = %inserted_id,
                marathon_id = %marathon_id,
                "Registration stored but no event matched; counter not updated"
            );
            false
        }
        Err(e) => {
            error!(
                registration_id = %inserted_id,
                marathon_id = %marathon_id,
                error = %e,
                "Registration stored but counter increment failed"
            );
            false
        }
    };

    Ok(RegisterOutcome {
        inserted_id: inserted_id.to_hex(),
        counter_updated,
    })
}

/// Result of reconciling an event's counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reconciliation {
    /// Counter value after reconciling.
    pub registration_count: i64,

    /// Registrations found pointing at the event.
    pub registrations: u64,
}

/// Raises the event's counter to the number of stored registrations for it.
///
/// The counter never decreases. Returns `None` if the event does not exist.
///
/// # Errors
///
/// Returns [`StoreError`] if counting or updating fails.
pub async fn reconcile_registration_count(
    store: &dyn Store,
    event_id: ObjectId,
) -> Result<Option<Reconciliation>, StoreError> {
    let registrations = store.count_registrations(&event_id.to_hex()).await?;
    let at_least = i64::try_from(registrations).unwrap_or(i64::MAX);

    let summary = store.raise_registration_count(event_id, at_least).await?;
    if summary.matched_count == 0 {
        return Ok(None);
    }

    let Some(event) = store.get_event(event_id).await? else {
        return Ok(None);
    };

    if summary.modified_count > 0 {
        info!(
            event_id = %event_id,
            registrations,
            registration_count = event.details.registration_count,
            "Registration counter reconciled"
        );
    }

    Ok(Some(Reconciliation {
        registration_count: event.details.registration_count,
        registrations,
    }))
}
