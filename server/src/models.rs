//! Domain types for marathon events and registrations.
//!
//! Records are stored and returned with the same JSON shape the web client
//! uses: camelCase field names and a string `_id`. Attributes the server does
//! not know about are preserved in `extra`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Number of events returned by the "limited" listing.
pub const LIMITED_EVENT_COUNT: u32 = 6;

/// Fields managed by the server that clients may never write.
const PROTECTED_EVENT_FIELDS: [&str; 3] = ["_id", "createdAt", "registrationCount"];

/// Event fields an update may not touch: the server-managed ones and the owner.
const READ_ONLY_EVENT_FIELDS: [&str; 4] = ["_id", "createdAt", "registrationCount", "userEmail"];

/// Registration fields an update may not touch.
const READ_ONLY_REGISTRATION_FIELDS: [&str; 2] = ["_id", "email"];

/// A partial update: field name to new value.
pub type Patch = Map<String, Value>;

/// Race distance, either a number of kilometres or a label such as `"10k"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Distance {
    Kilometers(f64),
    Label(String),
}

impl Distance {
    /// A zero distance or blank label counts as absent.
    fn is_blank(&self) -> bool {
        match self {
            Self::Kilometers(km) => *km == 0.0,
            Self::Label(label) => label.trim().is_empty(),
        }
    }
}

/// Everything stored for an event apart from its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDetails {
    pub title: String,
    pub start_registration_date: String,
    pub end_registration_date: String,
    pub marathon_start_date: String,
    pub location: String,
    pub distance: Distance,
    pub description: String,
    pub image: String,

    /// Creator's email.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,

    #[serde(default)]
    pub registration_count: i64,

    /// Set by the server on creation. Millisecond ISO-8601 so that string
    /// ordering matches chronological ordering.
    #[serde(
        default,
        with = "iso_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A stored marathon event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(flatten)]
    pub details: EventDetails,
}

/// Body of `POST /events`.
///
/// Every field is optional here so that a missing one is reported as a
/// validation failure naming the field rather than as a parse error.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    pub title: Option<String>,
    pub start_registration_date: Option<String>,
    pub end_registration_date: Option<String>,
    pub marathon_start_date: Option<String>,
    pub location: Option<String>,
    pub distance: Option<Distance>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub user_email: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NewEvent {
    /// Checks that all eight required fields are present and builds the
    /// record to insert.
    ///
    /// # Errors
    ///
    /// Returns the names of every missing field, in declaration order.
    pub fn validate(self, now: DateTime<Utc>) -> Result<EventDetails, Vec<&'static str>> {
        let mut missing = Vec::new();

        let title = present(self.title, "title", &mut missing);
        let start_registration_date = present(
            self.start_registration_date,
            "startRegistrationDate",
            &mut missing,
        );
        let end_registration_date = present(
            self.end_registration_date,
            "endRegistrationDate",
            &mut missing,
        );
        let marathon_start_date =
            present(self.marathon_start_date, "marathonStartDate", &mut missing);
        let location = present(self.location, "location", &mut missing);
        let distance = match self.distance {
            Some(distance) if !distance.is_blank() => Some(distance),
            _ => {
                missing.push("distance");
                None
            }
        };
        let description = present(self.description, "description", &mut missing);
        let image = present(self.image, "image", &mut missing);

        match (
            title,
            start_registration_date,
            end_registration_date,
            marathon_start_date,
            location,
            distance,
            description,
            image,
        ) {
            (
                Some(title),
                Some(start_registration_date),
                Some(end_registration_date),
                Some(marathon_start_date),
                Some(location),
                Some(distance),
                Some(description),
                Some(image),
            ) => {
                let mut extra = self.extra;
                strip_protected(&mut extra);

                Ok(EventDetails {
                    title,
                    start_registration_date,
                    end_registration_date,
                    marathon_start_date,
                    location,
                    distance,
                    description,
                    image,
                    user_email: self.user_email.filter(|email| !email.trim().is_empty()),
                    registration_count: 0,
                    created_at: Some(now),
                    extra,
                })
            }
            _ => Err(missing),
        }
    }
}

fn present(
    value: Option<String>,
    name: &'static str,
    missing: &mut Vec<&'static str>,
) -> Option<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Some(v),
        _ => {
            missing.push(name);
            None
        }
    }
}

/// Removes server-managed fields from a client-supplied event body.
pub fn strip_protected(fields: &mut Map<String, Value>) {
    for field in PROTECTED_EVENT_FIELDS {
        fields.remove(field);
    }
}

/// Removes the fields an event update may not change, including the owner.
pub fn strip_event_patch(patch: &mut Patch) {
    for field in READ_ONLY_EVENT_FIELDS {
        patch.remove(field);
    }
}

/// Removes the fields a registration update may not change, including the
/// registrant's email.
pub fn strip_registration_patch(patch: &mut Patch) {
    for field in READ_ONLY_REGISTRATION_FIELDS {
        patch.remove(field);
    }
}

/// Applies `patch` to a copy of `record` and returns the patched record.
///
/// # Errors
///
/// Fails when a patched field no longer has its stored type, e.g. a `null`
/// title or an object as distance. Such a patch must not be written, or
/// every later read of the record would fail.
pub fn apply_patch<T>(record: &T, patch: &Patch) -> Result<T, serde_json::Error>
where
    T: Serialize + DeserializeOwned,
{
    let mut fields = match serde_json::to_value(record)? {
        Value::Object(fields) => fields,
        other => {
            return Err(<serde_json::Error as serde::de::Error>::custom(format!(
                "expected an object, got {other}"
            )))
        }
    };

    for (field, value) in patch {
        fields.insert(field.clone(), value.clone());
    }

    serde_json::from_value(Value::Object(fields))
}

/// Everything stored for a registration apart from its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationDetails {
    /// Registrant's email.
    pub email: String,

    /// Id of the event registered for. Not checked for existence.
    pub marathon_id: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A stored registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(flatten)]
    pub details: RegistrationDetails,
}

/// Body of `POST /register`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRegistration {
    pub email: Option<String>,
    pub marathon_id: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NewRegistration {
    /// # Errors
    ///
    /// Returns the names of the missing fields.
    pub fn validate(self) -> Result<RegistrationDetails, Vec<&'static str>> {
        let mut missing = Vec::new();
        let email = present(self.email, "email", &mut missing);
        let marathon_id = present(self.marathon_id, "marathonId", &mut missing);

        match (email, marathon_id) {
            (Some(email), Some(marathon_id)) => {
                let mut extra = self.extra;
                extra.remove("_id");
                Ok(RegistrationDetails {
                    email,
                    marathon_id,
                    extra,
                })
            }
            _ => Err(missing),
        }
    }
}

/// Direction for ordering events by creation time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    /// Mongo sort direction.
    pub fn direction(self) -> i32 {
        match self {
            Self::Asc => 1,
            Self::Desc => -1,
        }
    }
}

/// Filter, order and cap for an event listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventQuery {
    /// Only events created by this email.
    pub creator: Option<String>,
    pub order: SortOrder,
    pub limit: Option<u32>,
}

impl EventQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_creator(mut self, email: impl Into<String>) -> Self {
        self.creator = Some(email.into());
        self
    }

    pub fn with_order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Result of an update: how many records matched and how many changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSummary {
    pub matched_count: u64,
    pub modified_count: u64,
}

/// Serializes `Option<DateTime<Utc>>` as `2024-05-01T08:30:00.000Z`.
mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(at) => serializer.serialize_str(&at.to_rfc3339_opts(SecondsFormat::Millis, true)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        raw.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|at| at.with_timezone(&Utc))
                .map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}
