//! Query construction.
//!
//! A [`Query`] is a class name, a list of constraints combined by implicit
//! AND, and modifiers (ordering, paging, projection, includes). The same
//! query value is evaluated locally by [`crate::matcher`] or handed to a
//! remote store, so both sides share one definition of its meaning.

use crate::{error::Result, ClassName, Error, GeoPoint, Pointer, Value, EARTH_RADIUS_KM};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Default number of results when no limit is set.
pub const DEFAULT_LIMIT: u32 = 100;
/// Largest accepted limit.
pub const MAX_LIMIT: u32 = 1000;
/// Largest accepted skip.
pub const MAX_SKIP: u32 = 10_000;

/// Keys every projection keeps.
pub const ALWAYS_SELECTED: [&str; 3] = ["objectId", "createdAt", "updatedAt"];

/// Bound on a `Near` constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum GeoBound {
    /// Great-circle distance in radians
    MaxDistance { radians: f64 },
    /// Axis-aligned box
    #[serde(rename_all = "camelCase")]
    WithinBox {
        southwest: GeoPoint,
        northeast: GeoPoint,
    },
}

/// One predicate in a constraint tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Constraint {
    Equal { key: String, value: Value },
    NotEqual { key: String, value: Value },
    LessThan { key: String, value: Value },
    LessOrEqual { key: String, value: Value },
    GreaterThan { key: String, value: Value },
    GreaterOrEqual { key: String, value: Value },
    ContainedIn { key: String, values: Vec<Value> },
    NotContainedIn { key: String, values: Vec<Value> },
    Exists { key: String },
    NotExists { key: String },
    StartsWith { key: String, prefix: String },
    ContainsAllOf { key: String, values: Vec<Value> },
    #[serde(rename_all = "camelCase")]
    MatchesKeyInSubquery {
        key: String,
        query_key: String,
        query: Box<Query>,
    },
    #[serde(rename_all = "camelCase")]
    NotMatchesKeyInSubquery {
        key: String,
        query_key: String,
        query: Box<Query>,
    },
    MatchesQuery { key: String, query: Box<Query> },
    NotMatchesQuery { key: String, query: Box<Query> },
    Near {
        key: String,
        point: GeoPoint,
        bound: Option<GeoBound>,
    },
    /// Any clause matches; each clause is an implicit AND
    Or { clauses: Vec<Vec<Constraint>> },
    /// Members of `owner`'s relation `key`; evaluated only by a remote store
    RelatedTo { owner: Pointer, key: String },
}

impl Constraint {
    /// Queries nested directly inside this constraint.
    pub fn subqueries(&self) -> Vec<&Query> {
        match self {
            Constraint::MatchesKeyInSubquery { query, .. }
            | Constraint::NotMatchesKeyInSubquery { query, .. }
            | Constraint::MatchesQuery { query, .. }
            | Constraint::NotMatchesQuery { query, .. } => vec![query.as_ref()],
            Constraint::Or { clauses } => clauses
                .iter()
                .flatten()
                .flat_map(Constraint::subqueries)
                .collect(),
            _ => Vec::new(),
        }
    }

    fn has_near(&self) -> bool {
        match self {
            Constraint::Near { .. } => true,
            Constraint::Or { clauses } => clauses.iter().flatten().any(Constraint::has_near),
            _ => false,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Constraint::Or { clauses } => {
                if clauses.is_empty() {
                    return Err(Error::constraint("or requires at least one clause"));
                }
                clauses.iter().flatten().try_for_each(Constraint::validate)
            }
            Constraint::MatchesKeyInSubquery { query, .. }
            | Constraint::NotMatchesKeyInSubquery { query, .. }
            | Constraint::MatchesQuery { query, .. }
            | Constraint::NotMatchesQuery { query, .. } => query.validate(),
            Constraint::Near {
                bound: Some(GeoBound::MaxDistance { radians }),
                ..
            } if !radians.is_finite() || *radians < 0.0 => Err(Error::constraint(
                "maximum distance must be a non-negative number",
            )),
            _ => Ok(()),
        }
    }
}

/// Sort direction for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// One ordering key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortKey {
    pub key: String,
    pub direction: SortDirection,
}

/// A constraint tree plus modifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub class_name: ClassName,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order: Vec<SortKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select_keys: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub include: BTreeSet<String>,
}

impl Query {
    /// Create an unconstrained query over a class.
    pub fn new(class_name: impl Into<ClassName>) -> Self {
        Self {
            class_name: class_name.into(),
            constraints: Vec::new(),
            order: Vec::new(),
            limit: None,
            skip: None,
            select_keys: None,
            include: BTreeSet::new(),
        }
    }

    /// Compose pure filter queries with OR.
    ///
    /// Every query must target the same class and carry no ordering, paging,
    /// include or `Near` constraint.
    pub fn or(queries: Vec<Query>) -> Result<Query> {
        let class_name = queries
            .first()
            .map(|q| q.class_name.clone())
            .ok_or_else(|| Error::constraint("or requires at least one query"))?;

        let mut clauses = Vec::with_capacity(queries.len());
        for query in queries {
            if query.class_name != class_name {
                return Err(Error::constraint(format!(
                    "all or subqueries must target {class_name}, found {}",
                    query.class_name
                )));
            }
            if !query.is_pure_filter() {
                return Err(Error::constraint(
                    "or subqueries may not use order, limit, skip, include or near",
                ));
            }
            clauses.push(query.constraints);
        }

        Ok(Query::new(class_name).with_constraint(Constraint::Or { clauses }))
    }

    /// True when the query only filters.
    pub fn is_pure_filter(&self) -> bool {
        self.order.is_empty()
            && self.limit.is_none()
            && self.skip.is_none()
            && self.include.is_empty()
            && !self.constraints.iter().any(Constraint::has_near)
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn where_equal_to(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with_constraint(Constraint::Equal {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn where_not_equal_to(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with_constraint(Constraint::NotEqual {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn where_less_than(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with_constraint(Constraint::LessThan {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn where_less_than_or_equal_to(
        self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.with_constraint(Constraint::LessOrEqual {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn where_greater_than(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with_constraint(Constraint::GreaterThan {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn where_greater_than_or_equal_to(
        self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.with_constraint(Constraint::GreaterOrEqual {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn where_contained_in(self, key: impl Into<String>, values: Vec<Value>) -> Self {
        self.with_constraint(Constraint::ContainedIn {
            key: key.into(),
            values,
        })
    }

    pub fn where_not_contained_in(self, key: impl Into<String>, values: Vec<Value>) -> Self {
        self.with_constraint(Constraint::NotContainedIn {
            key: key.into(),
            values,
        })
    }

    pub fn where_exists(self, key: impl Into<String>) -> Self {
        self.with_constraint(Constraint::Exists { key: key.into() })
    }

    pub fn where_does_not_exist(self, key: impl Into<String>) -> Self {
        self.with_constraint(Constraint::NotExists { key: key.into() })
    }

    pub fn where_starts_with(self, key: impl Into<String>, prefix: impl Into<String>) -> Self {
        self.with_constraint(Constraint::StartsWith {
            key: key.into(),
            prefix: prefix.into(),
        })
    }

    pub fn where_contains_all(self, key: impl Into<String>, values: Vec<Value>) -> Self {
        self.with_constraint(Constraint::ContainsAllOf {
            key: key.into(),
            values,
        })
    }

    pub fn where_matches_key_in_query(
        self,
        key: impl Into<String>,
        query_key: impl Into<String>,
        query: Query,
    ) -> Self {
        self.with_constraint(Constraint::MatchesKeyInSubquery {
            key: key.into(),
            query_key: query_key.into(),
            query: Box::new(query),
        })
    }

    pub fn where_does_not_match_key_in_query(
        self,
        key: impl Into<String>,
        query_key: impl Into<String>,
        query: Query,
    ) -> Self {
        self.with_constraint(Constraint::NotMatchesKeyInSubquery {
            key: key.into(),
            query_key: query_key.into(),
            query: Box::new(query),
        })
    }

    pub fn where_matches_query(self, key: impl Into<String>, query: Query) -> Self {
        self.with_constraint(Constraint::MatchesQuery {
            key: key.into(),
            query: Box::new(query),
        })
    }

    pub fn where_does_not_match_query(self, key: impl Into<String>, query: Query) -> Self {
        self.with_constraint(Constraint::NotMatchesQuery {
            key: key.into(),
            query: Box::new(query),
        })
    }

    pub fn where_near(self, key: impl Into<String>, point: GeoPoint) -> Self {
        self.with_constraint(Constraint::Near {
            key: key.into(),
            point,
            bound: None,
        })
    }

    pub fn where_within_kilometers(
        self,
        key: impl Into<String>,
        point: GeoPoint,
        kilometers: f64,
    ) -> Self {
        self.with_constraint(Constraint::Near {
            key: key.into(),
            point,
            bound: Some(GeoBound::MaxDistance {
                radians: kilometers / EARTH_RADIUS_KM,
            }),
        })
    }

    pub fn where_within_radians(self, key: impl Into<String>, point: GeoPoint, radians: f64) -> Self {
        self.with_constraint(Constraint::Near {
            key: key.into(),
            point,
            bound: Some(GeoBound::MaxDistance { radians }),
        })
    }

    /// Points inside the box; the box center is used for distance ordering.
    pub fn where_within_box(
        self,
        key: impl Into<String>,
        southwest: GeoPoint,
        northeast: GeoPoint,
    ) -> Self {
        let center = GeoPoint::new(
            (southwest.latitude + northeast.latitude) / 2.0,
            (southwest.longitude + northeast.longitude) / 2.0,
        );
        self.with_constraint(Constraint::Near {
            key: key.into(),
            point: center,
            bound: Some(GeoBound::WithinBox {
                southwest,
                northeast,
            }),
        })
    }

    pub fn where_related_to(self, owner: Pointer, key: impl Into<String>) -> Self {
        self.with_constraint(Constraint::RelatedTo {
            owner,
            key: key.into(),
        })
    }

    pub fn order_by_ascending(mut self, key: impl Into<String>) -> Self {
        self.order.push(SortKey {
            key: key.into(),
            direction: SortDirection::Ascending,
        });
        self
    }

    pub fn order_by_descending(mut self, key: impl Into<String>) -> Self {
        self.order.push(SortKey {
            key: key.into(),
            direction: SortDirection::Descending,
        });
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: u32) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Restrict returned fields. `objectId`, `createdAt` and `updatedAt`
    /// are always kept.
    pub fn select_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let selected = self.select_keys.get_or_insert_with(BTreeSet::new);
        selected.extend(keys.into_iter().map(Into::into));
        selected.extend(ALWAYS_SELECTED.iter().map(|k| k.to_string()));
        self
    }

    /// Eagerly resolve pointers along a dot-separated path.
    pub fn include(mut self, path: impl Into<String>) -> Self {
        self.include.insert(path.into());
        self
    }

    /// Limit after defaults are applied.
    pub fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_LIMIT)
    }

    /// Skip after defaults are applied.
    pub fn effective_skip(&self) -> u32 {
        self.skip.unwrap_or(0)
    }

    /// Check modifier domains and the shape of nested constraints.
    pub fn validate(&self) -> Result<()> {
        crate::identity::validate_class_name(&self.class_name)
            .map_err(|e| Error::constraint(e.to_string()))?;
        if let Some(limit) = self.limit {
            if !(1..=MAX_LIMIT).contains(&limit) {
                return Err(Error::constraint(format!(
                    "limit must be between 1 and {MAX_LIMIT}, got {limit}"
                )));
            }
        }
        if let Some(skip) = self.skip {
            if skip > MAX_SKIP {
                return Err(Error::constraint(format!(
                    "skip must be at most {MAX_SKIP}, got {skip}"
                )));
            }
        }
        self.constraints.iter().try_for_each(Constraint::validate)
    }

    /// All nested subqueries, depth first, innermost last.
    pub fn subqueries(&self) -> Vec<&Query> {
        let mut out = Vec::new();
        for constraint in &self.constraints {
            for sub in constraint.subqueries() {
                out.push(sub);
                out.extend(sub.subqueries());
            }
        }
        out
    }

    /// True when any constraint (at any depth) can only be evaluated remotely.
    pub fn requires_remote(&self) -> bool {
        fn remote_only(c: &Constraint) -> bool {
            match c {
                Constraint::RelatedTo { .. } => true,
                Constraint::Or { clauses } => clauses.iter().flatten().any(remote_only),
                _ => false,
            }
        }
        self.constraints.iter().any(remote_only)
            || self.subqueries().iter().any(|q| q.requires_remote())
    }

    /// The `Near` constraint used to order results when no explicit order is set.
    pub fn near_constraint(&self) -> Option<(&str, GeoPoint)> {
        self.constraints.iter().find_map(|c| match c {
            Constraint::Near { key, point, .. } => Some((key.as_str(), *point)),
            _ => None,
        })
    }

    /// Stable serialization of the constraint tree and modifiers.
    ///
    /// Equal queries produce equal signatures; used as the result-cache key.
    pub fn signature(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidEncoding(e.to_string()))
    }

    /// Same query without paging, used for counting.
    pub fn without_paging(&self) -> Query {
        let mut query = self.clone();
        query.limit = None;
        query.skip = None;
        query.order.clear();
        query
    }
}
