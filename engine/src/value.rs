//! The field value model and its JSON encoding.
//!
//! Scalars, arrays and nested objects encode as plain JSON. Typed values
//! (pointers, relations, files, geo points, dates) encode as JSON objects tagged
//! with `"__type"`, so a record survives a storage or network round trip
//! without losing which kind each field held.

use crate::{error::Result, ClassName, Error, ObjectId};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Map;
use std::collections::BTreeMap;

const TYPE_TAG: &str = "__type";

/// Mean Earth radius used for distance conversions.
pub const EARTH_RADIUS_KM: f64 = 6371.0;
pub const EARTH_RADIUS_MILES: f64 = 3958.8;

/// Reference to another record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pointer {
    pub class_name: ClassName,
    pub object_id: ObjectId,
}

impl Pointer {
    pub fn new(class_name: impl Into<ClassName>, object_id: ObjectId) -> Self {
        Self {
            class_name: class_name.into(),
            object_id,
        }
    }

    /// Pointer to a record with a server-assigned id.
    pub fn server(class_name: impl Into<ClassName>, object_id: impl Into<String>) -> Self {
        Self::new(class_name, ObjectId::Server(object_id.into()))
    }
}

/// Reference to a stored file. Only the reference is modelled here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub name: String,
    pub url: Option<String>,
}

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle distance in radians (haversine).
    pub fn radians_to(&self, other: &GeoPoint) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let d_lat = lat2 - lat1;
        let d_lng = (other.longitude - self.longitude).to_radians();
        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
        2.0 * a.sqrt().min(1.0).asin()
    }

    pub fn kilometers_to(&self, other: &GeoPoint) -> f64 {
        self.radians_to(other) * EARTH_RADIUS_KM
    }

    pub fn miles_to(&self, other: &GeoPoint) -> f64 {
        self.radians_to(other) * EARTH_RADIUS_MILES
    }

    fn validate(&self) -> Result<()> {
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(Error::type_error(format!(
                "latitude {} outside [-90, 90]",
                self.latitude
            )));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(Error::type_error(format!(
                "longitude {} outside [-180, 180]",
                self.longitude
            )));
        }
        Ok(())
    }
}

/// A field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    File(FileRef),
    Pointer(Pointer),
    /// Lazy many-to-many reference; names only the target class
    Relation { class_name: ClassName },
    GeoPoint(GeoPoint),
    Date(DateTime<Utc>),
}

impl Value {
    /// Name of the value kind, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Number(_) => "Number",
            Value::String(_) => "String",
            Value::Array(_) => "Array",
            Value::Object(_) => "Object",
            Value::File(_) => "File",
            Value::Pointer(_) => "Pointer",
            Value::Relation { .. } => "Relation",
            Value::GeoPoint(_) => "GeoPoint",
            Value::Date(_) => "Date",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_pointer(&self) -> Option<&Pointer> {
        match self {
            Value::Pointer(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_geo_point(&self) -> Option<GeoPoint> {
        match self {
            Value::GeoPoint(p) => Some(*p),
            _ => None,
        }
    }

    /// Check that this value may be stored in a field.
    ///
    /// `top_level` is true for a field's own value; relations are only
    /// allowed there.
    pub fn validate(&self, top_level: bool) -> Result<()> {
        match self {
            Value::Number(n) if !n.is_finite() => {
                Err(Error::type_error(format!("number {n} is not finite")))
            }
            Value::Relation { .. } if !top_level => Err(Error::type_error(
                "relations may only be stored as a top-level field",
            )),
            Value::Relation { class_name } | Value::Pointer(Pointer { class_name, .. }) => {
                crate::identity::validate_class_name(class_name)
                    .map_err(|_| Error::type_error(format!("invalid class name {class_name:?}")))
            }
            Value::GeoPoint(point) => point.validate(),
            Value::Array(items) => items.iter().try_for_each(|v| v.validate(false)),
            Value::Object(map) => map.values().try_for_each(|v| v.validate(false)),
            _ => Ok(()),
        }
    }

    /// Visit every pointer reachable from this value.
    pub fn for_each_pointer<'a>(&'a self, f: &mut impl FnMut(&'a Pointer)) {
        match self {
            Value::Pointer(p) => f(p),
            Value::Array(items) => {
                for item in items {
                    item.for_each_pointer(f);
                }
            }
            Value::Object(map) => {
                for item in map.values() {
                    item.for_each_pointer(f);
                }
            }
            _ => {}
        }
    }

    /// Replace local-id pointers with their server ids.
    ///
    /// Returns the first unresolved local token as the error.
    pub fn resolve_local_ids(
        &self,
        resolve: &impl Fn(&str) -> Option<String>,
    ) -> std::result::Result<Value, String> {
        match self {
            Value::Pointer(Pointer {
                class_name,
                object_id: ObjectId::Local(token),
            }) => match resolve(token) {
                Some(id) => Ok(Value::Pointer(Pointer::server(class_name.clone(), id))),
                None => Err(token.clone()),
            },
            Value::Array(items) => items
                .iter()
                .map(|v| v.resolve_local_ids(resolve))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| v.resolve_local_ids(resolve).map(|v| (k.clone(), v)))
                .collect::<std::result::Result<BTreeMap<_, _>, _>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    /// Encode as tagged JSON.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => encode_number(*n),
            Value::String(s) => Json::String(s.clone()),
            Value::Array(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::File(file) => {
                let mut obj = tagged("File");
                obj.insert("name".into(), Json::String(file.name.clone()));
                if let Some(url) = &file.url {
                    obj.insert("url".into(), Json::String(url.clone()));
                }
                Json::Object(obj)
            }
            Value::Pointer(pointer) => {
                let mut obj = tagged("Pointer");
                obj.insert("className".into(), Json::String(pointer.class_name.clone()));
                match &pointer.object_id {
                    ObjectId::Server(id) => obj.insert("objectId".into(), Json::String(id.clone())),
                    ObjectId::Local(token) => {
                        obj.insert("localId".into(), Json::String(token.clone()))
                    }
                };
                Json::Object(obj)
            }
            Value::Relation { class_name } => {
                let mut obj = tagged("Relation");
                obj.insert("className".into(), Json::String(class_name.clone()));
                Json::Object(obj)
            }
            Value::GeoPoint(point) => {
                let mut obj = tagged("GeoPoint");
                obj.insert("latitude".into(), encode_number(point.latitude));
                obj.insert("longitude".into(), encode_number(point.longitude));
                Json::Object(obj)
            }
            Value::Date(date) => {
                let mut obj = tagged("Date");
                obj.insert("iso".into(), Json::String(encode_date(date)));
                Json::Object(obj)
            }
        }
    }

    /// Decode tagged JSON.
    pub fn from_json(json: &serde_json::Value) -> Result<Value> {
        use serde_json::Value as Json;
        Ok(match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => Value::Number(
                n.as_f64()
                    .ok_or_else(|| Error::InvalidEncoding(format!("unrepresentable number {n}")))?,
            ),
            Json::String(s) => Value::String(s.clone()),
            Json::Array(items) => Value::Array(
                items
                    .iter()
                    .map(Value::from_json)
                    .collect::<Result<Vec<_>>>()?,
            ),
            Json::Object(obj) => match obj.get(TYPE_TAG) {
                None => Value::Object(
                    obj.iter()
                        .map(|(k, v)| Ok((k.clone(), Value::from_json(v)?)))
                        .collect::<Result<BTreeMap<_, _>>>()?,
                ),
                Some(Json::String(tag)) => decode_typed(tag, obj)?,
                Some(other) => {
                    return Err(Error::type_error(format!("invalid __type tag {other}")));
                }
            },
        })
    }
}

fn tagged(tag: &str) -> Map<String, serde_json::Value> {
    let mut obj = Map::new();
    obj.insert(TYPE_TAG.into(), serde_json::Value::String(tag.into()));
    obj
}

fn encode_number(n: f64) -> serde_json::Value {
    // Integral values encode as JSON integers; both forms decode to the same f64.
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

pub(crate) fn encode_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn decode_date(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| Error::type_error(format!("invalid date {raw:?}: {e}")))
}

fn decode_typed(tag: &str, obj: &Map<String, serde_json::Value>) -> Result<Value> {
    let string_field = |name: &str| -> Result<String> {
        obj.get(name)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::type_error(format!("{tag} is missing string field {name:?}")))
    };
    let number_field = |name: &str| -> Result<f64> {
        obj.get(name)
            .and_then(|v| v.as_f64())
            .ok_or_else(|| Error::type_error(format!("{tag} is missing number field {name:?}")))
    };

    match tag {
        "Pointer" => {
            let class_name = string_field("className")?;
            let object_id = match (obj.get("objectId"), obj.get("localId")) {
                (Some(_), _) => ObjectId::Server(string_field("objectId")?),
                (None, Some(_)) => ObjectId::Local(string_field("localId")?),
                (None, None) => {
                    return Err(Error::type_error("Pointer needs objectId or localId"));
                }
            };
            Ok(Value::Pointer(Pointer {
                class_name,
                object_id,
            }))
        }
        "Relation" => Ok(Value::Relation {
            class_name: string_field("className")?,
        }),
        "File" => Ok(Value::File(FileRef {
            name: string_field("name")?,
            url: obj.get("url").and_then(|v| v.as_str()).map(str::to_string),
        })),
        "GeoPoint" => Ok(Value::GeoPoint(GeoPoint::new(
            number_field("latitude")?,
            number_field("longitude")?,
        ))),
        "Date" => Ok(Value::Date(decode_date(&string_field("iso")?)?)),
        other => Err(Error::type_error(format!("unknown __type {other:?}"))),
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Value::from_json(&json).map_err(serde::de::Error::custom)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(n.into())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Pointer> for Value {
    fn from(p: Pointer) -> Self {
        Value::Pointer(p)
    }
}

impl From<GeoPoint> for Value {
    fn from(p: GeoPoint) -> Self {
        Value::GeoPoint(p)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self {
        Value::Date(d)
    }
}

impl From<FileRef> for Value {
    fn from(f: FileRef) -> Self {
        Value::File(f)
    }
}

impl TryFrom<serde_json::Value> for Value {
    type Error = Error;

    fn try_from(json: serde_json::Value) -> Result<Self> {
        Value::from_json(&json)
    }
}
