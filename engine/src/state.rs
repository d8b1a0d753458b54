//! Immutable record snapshots.
//!
//! An [`ObjectState`] is a point-in-time view of one record. Every mutation
//! produces a new state; the field map is shared between states until one of
//! them changes it.

use crate::{error::Result, ClassName, Error, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Keys maintained by the datastore itself; never stored as fields.
pub const RESERVED_KEYS: [&str; 4] = ["objectId", "createdAt", "updatedAt", "ACL"];

/// Snapshot of one record's fields plus bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectState {
    class_name: ClassName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    object_id: Option<String>,
    #[serde(default)]
    fields: Arc<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<DateTime<Utc>>,
    /// Access control metadata, carried opaquely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    acl: Option<serde_json::Value>,
}

impl ObjectState {
    /// Create an empty state for a class.
    pub fn new(class_name: impl Into<ClassName>) -> Self {
        Self {
            class_name: class_name.into(),
            object_id: None,
            fields: Arc::new(BTreeMap::new()),
            created_at: None,
            updated_at: None,
            acl: None,
        }
    }

    /// Build a state from `(key, value)` pairs, validating each.
    pub fn from_fields<K, V>(
        class_name: impl Into<ClassName>,
        fields: impl IntoIterator<Item = (K, V)>,
    ) -> Result<Self>
    where
        K: Into<String>,
        V: Into<Value>,
    {
        fields
            .into_iter()
            .try_fold(Self::new(class_name), |state, (k, v)| state.with_field(k, v))
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn object_id(&self) -> Option<&str> {
        self.object_id.as_deref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn acl(&self) -> Option<&serde_json::Value> {
        self.acl.as_ref()
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// True when the state carries no fields and no server bookkeeping.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
            && self.object_id.is_none()
            && self.created_at.is_none()
            && self.updated_at.is_none()
    }

    pub fn with_object_id(mut self, object_id: impl Into<String>) -> Self {
        self.object_id = Some(object_id.into());
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    pub fn with_updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = Some(at);
        self
    }

    pub fn with_acl(mut self, acl: serde_json::Value) -> Self {
        self.acl = Some(acl);
        self
    }

    /// Return a new state with `key` set to `value`.
    pub fn with_field(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<Self> {
        let key = key.into();
        let value = value.into();
        validate_key(&key)?;
        value
            .validate(true)
            .map_err(|e| Error::TypeError(format!("field {key:?}: {e}")))?;

        let mut next = self.clone();
        Arc::make_mut(&mut next.fields).insert(key, value);
        Ok(next)
    }

    /// Return a new state without `key`.
    pub fn without_field(&self, key: &str) -> Self {
        if !self.fields.contains_key(key) {
            return self.clone();
        }
        let mut next = self.clone();
        Arc::make_mut(&mut next.fields).remove(key);
        next
    }

    /// Field-wise override: keys present in `other` win, all others are kept.
    ///
    /// Server responses to partial saves carry only changed fields, so they
    /// are merged onto the prior full state rather than replacing it.
    pub fn merge(&self, other: &ObjectState) -> ObjectState {
        let mut next = self.clone();
        if !other.fields.is_empty() {
            let fields = Arc::make_mut(&mut next.fields);
            for (key, value) in other.fields.iter() {
                fields.insert(key.clone(), value.clone());
            }
        }
        if other.object_id.is_some() {
            next.object_id = other.object_id.clone();
        }
        if other.created_at.is_some() {
            next.created_at = other.created_at;
        }
        if other.updated_at.is_some() {
            next.updated_at = other.updated_at;
        }
        if other.acl.is_some() {
            next.acl = other.acl.clone();
        }
        next
    }

    /// Keep only `keys` (bookkeeping is always kept).
    pub fn select(&self, keys: &BTreeSet<String>) -> ObjectState {
        let mut next = self.clone();
        next.fields = Arc::new(
            self.fields
                .iter()
                .filter(|(k, _)| keys.contains(k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        next
    }

    /// Look up a dot-separated path.
    ///
    /// `objectId`, `createdAt` and `updatedAt` resolve to the bookkeeping
    /// values; other segments descend into nested objects.
    pub fn lookup(&self, path: &str) -> Option<Cow<'_, Value>> {
        match path {
            "objectId" => return self.object_id.clone().map(|id| Cow::Owned(Value::String(id))),
            "createdAt" => return self.created_at.map(|d| Cow::Owned(Value::Date(d))),
            "updatedAt" => return self.updated_at.map(|d| Cow::Owned(Value::Date(d))),
            _ => {}
        }

        let mut segments = path.split('.');
        let mut current = self.fields.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                _ => return None,
            };
        }
        Some(Cow::Borrowed(current))
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::type_error("field keys must not be empty"));
    }
    if RESERVED_KEYS.contains(&key) {
        return Err(Error::type_error(format!("{key:?} is a reserved key")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn score(points: f64) -> ObjectState {
        ObjectState::from_fields("GameScore", [("score", Value::Number(points))]).unwrap()
    }

    #[test]
    fn with_field_leaves_original_untouched() {
        let original = score(10.0);
        let next = original.with_field("player", "Sean").unwrap();

        assert_eq!(original.get("player"), None);
        assert_eq!(next.get("player"), Some(&Value::String("Sean".into())));
        assert_eq!(next.get("score"), Some(&Value::Number(10.0)));
    }

    #[test]
    fn with_field_rejects_invalid_values() {
        let state = ObjectState::new("GameScore");
        assert!(matches!(
            state.with_field("score", f64::INFINITY),
            Err(Error::TypeError(_))
        ));
        assert!(matches!(
            state.with_field("objectId", "x"),
            Err(Error::TypeError(_))
        ));
        assert!(matches!(state.with_field("", 1), Err(Error::TypeError(_))));
    }

    #[test]
    fn merge_overrides_present_keys_only() {
        let base = ObjectState::from_fields(
            "GameScore",
            [("score", Value::Number(10.0)), ("player", "Sean".into())],
        )
        .unwrap();
        let updated_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let diff = score(20.0).with_updated_at(updated_at);

        let merged = base.merge(&diff);
        assert_eq!(merged.get("score"), Some(&Value::Number(20.0)));
        assert_eq!(merged.get("player"), Some(&Value::String("Sean".into())));
        assert_eq!(merged.updated_at(), Some(updated_at));
    }

    #[test]
    fn merge_with_empty_is_identity() {
        let base = score(3.0).with_object_id("abc");
        assert_eq!(base.merge(&ObjectState::new("GameScore")), base);
    }

    #[test]
    fn lookup_paths() {
        let mut inner = BTreeMap::new();
        inner.insert("city".to_string(), Value::from("Lisbon"));
        let state = ObjectState::new("User")
            .with_object_id("u1")
            .with_field("address", Value::Object(inner))
            .unwrap();

        assert_eq!(
            state.lookup("address.city").as_deref(),
            Some(&Value::from("Lisbon"))
        );
        assert_eq!(state.lookup("objectId").as_deref(), Some(&Value::from("u1")));
        assert!(state.lookup("address.zip").is_none());
        assert!(state.lookup("createdAt").is_none());
    }

    #[test]
    fn select_keeps_bookkeeping() {
        let state = ObjectState::from_fields("Post", [("title", "a"), ("body", "b")])
            .unwrap()
            .with_object_id("p1");
        let keys = BTreeSet::from(["title".to_string()]);
        let projected = state.select(&keys);

        assert_eq!(projected.object_id(), Some("p1"));
        assert!(projected.contains_key("title"));
        assert!(!projected.contains_key("body"));
    }

    #[test]
    fn serialization_roundtrip() {
        let state = score(7.0)
            .with_object_id("s1")
            .with_created_at(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap());
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("className")); // camelCase
        let parsed: ObjectState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
    }
}
