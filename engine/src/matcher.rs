//! Local query evaluation.
//!
//! The [`Matcher`] evaluates a [`Query`] against candidate records held in
//! memory: filter, sort, skip, limit. Nested subqueries are evaluated by the
//! caller first (innermost first) and handed in as [`SubqueryResults`]; the
//! matcher itself never performs IO.

use crate::{
    error::Result, ClassName, Constraint, Error, GeoBound, GeoPoint, ObjectId, ObjectState, Query,
    SortDirection, Value,
};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// A record considered by a query, with its identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: ObjectId,
    pub state: ObjectState,
}

impl Candidate {
    pub fn new(id: ObjectId, state: ObjectState) -> Self {
        Self { id, state }
    }
}

/// Results of already-evaluated subqueries, keyed by query signature.
#[derive(Debug, Clone, Default)]
pub struct SubqueryResults {
    by_signature: HashMap<String, Vec<Candidate>>,
}

impl SubqueryResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, query: &Query, results: Vec<Candidate>) -> Result<()> {
        self.by_signature.insert(query.signature()?, results);
        Ok(())
    }

    pub fn get(&self, query: &Query) -> Result<Option<&[Candidate]>> {
        Ok(self
            .by_signature
            .get(&query.signature()?)
            .map(Vec::as_slice))
    }

    pub fn contains(&self, query: &Query) -> Result<bool> {
        Ok(self.by_signature.contains_key(&query.signature()?))
    }
}

/// Compiled form of a constraint; subquery constraints hold their results.
enum Predicate<'q> {
    Leaf(&'q Constraint),
    PointsInto {
        key: &'q str,
        targets: HashSet<(ClassName, ObjectId)>,
        negate: bool,
    },
    KeyIn {
        key: &'q str,
        values: Vec<Value>,
        negate: bool,
    },
    Or(Vec<Vec<Predicate<'q>>>),
}

/// Evaluates one query against in-memory candidates.
pub struct Matcher<'q> {
    query: &'q Query,
    predicates: Vec<Predicate<'q>>,
}

impl<'q> Matcher<'q> {
    /// Compile `query`, resolving subqueries from `subqueries`.
    ///
    /// Fails with `ConstraintError` for constraints that cannot be evaluated
    /// locally or when a subquery result is missing.
    pub fn new(query: &'q Query, subqueries: &SubqueryResults) -> Result<Self> {
        query.validate()?;
        let predicates = compile_all(&query.constraints, subqueries)?;
        Ok(Self { query, predicates })
    }

    pub fn query(&self) -> &Query {
        self.query
    }

    /// Whether one record satisfies every constraint.
    pub fn matches(&self, candidate: &Candidate) -> bool {
        candidate.state.class_name() == self.query.class_name
            && self.predicates.iter().all(|p| evaluate(p, &candidate.state))
    }

    /// Filter, sort, then apply skip and limit.
    pub fn execute(&self, candidates: impl IntoIterator<Item = Candidate>) -> Vec<Candidate> {
        let mut hits: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| self.matches(c))
            .collect();
        self.sort(&mut hits);

        let skip = self.query.effective_skip() as usize;
        let limit = self.query.effective_limit() as usize;
        hits.into_iter().skip(skip).take(limit).collect()
    }

    /// Number of matching records, ignoring skip and limit.
    pub fn count<'a>(&self, candidates: impl IntoIterator<Item = &'a Candidate>) -> usize {
        candidates.into_iter().filter(|c| self.matches(c)).count()
    }

    /// Apply the query's key selection to a state.
    pub fn project(&self, state: &ObjectState) -> ObjectState {
        match &self.query.select_keys {
            Some(keys) => state.select(keys),
            None => state.clone(),
        }
    }

    fn sort(&self, hits: &mut [Candidate]) {
        if !self.query.order.is_empty() {
            hits.sort_by(|a, b| {
                for sort_key in &self.query.order {
                    let ordering = compare_for_sort(
                        a.state.lookup(&sort_key.key).as_deref(),
                        b.state.lookup(&sort_key.key).as_deref(),
                    );
                    let ordering = match sort_key.direction {
                        SortDirection::Ascending => ordering,
                        SortDirection::Descending => ordering.reverse(),
                    };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
        } else if let Some((key, origin)) = self.query.near_constraint() {
            let distance = |c: &Candidate| {
                c.state
                    .lookup(key)
                    .and_then(|v| v.as_geo_point())
                    .map(|p| origin.radians_to(&p))
                    .unwrap_or(f64::INFINITY)
            };
            hits.sort_by(|a, b| distance(a).total_cmp(&distance(b)));
        }
    }
}

fn compile_all<'q>(
    constraints: &'q [Constraint],
    subqueries: &SubqueryResults,
) -> Result<Vec<Predicate<'q>>> {
    constraints
        .iter()
        .map(|c| compile(c, subqueries))
        .collect()
}

fn compile<'q>(constraint: &'q Constraint, subqueries: &SubqueryResults) -> Result<Predicate<'q>> {
    let results = |query: &Query| -> Result<Vec<Candidate>> {
        subqueries
            .get(query)?
            .map(<[Candidate]>::to_vec)
            .ok_or_else(|| {
                Error::constraint(format!(
                    "subquery on {} has not been evaluated",
                    query.class_name
                ))
            })
    };

    Ok(match constraint {
        Constraint::RelatedTo { .. } => {
            return Err(Error::constraint(
                "relatedTo can only be evaluated by the remote store",
            ));
        }
        Constraint::Or { clauses } => Predicate::Or(
            clauses
                .iter()
                .map(|clause| compile_all(clause, subqueries))
                .collect::<Result<_>>()?,
        ),
        Constraint::MatchesQuery { key, query } | Constraint::NotMatchesQuery { key, query } => {
            Predicate::PointsInto {
                key,
                targets: results(query)?
                    .into_iter()
                    .map(|c| (c.state.class_name().to_string(), c.id))
                    .collect(),
                negate: matches!(constraint, Constraint::NotMatchesQuery { .. }),
            }
        }
        Constraint::MatchesKeyInSubquery {
            key,
            query_key,
            query,
        }
        | Constraint::NotMatchesKeyInSubquery {
            key,
            query_key,
            query,
        } => Predicate::KeyIn {
            key,
            values: results(query)?
                .iter()
                .filter_map(|c| c.state.lookup(query_key).map(|v| v.into_owned()))
                .collect(),
            negate: matches!(constraint, Constraint::NotMatchesKeyInSubquery { .. }),
        },
        leaf => Predicate::Leaf(leaf),
    })
}

fn evaluate(predicate: &Predicate<'_>, state: &ObjectState) -> bool {
    match predicate {
        Predicate::Leaf(constraint) => evaluate_leaf(constraint, state),
        Predicate::Or(clauses) => clauses
            .iter()
            .any(|clause| clause.iter().all(|p| evaluate(p, state))),
        Predicate::PointsInto {
            key,
            targets,
            negate,
        } => {
            let field = state.lookup(key);
            let hit = field.as_deref().is_some_and(|value| {
                any_element(value, |v| {
                    v.as_pointer().is_some_and(|p| {
                        targets.contains(&(p.class_name.clone(), p.object_id.clone()))
                    })
                })
            });
            hit != *negate
        }
        Predicate::KeyIn {
            key,
            values,
            negate,
        } => {
            let field = state.lookup(key);
            let hit = values.iter().any(|v| equals(field.as_deref(), v));
            hit != *negate
        }
    }
}

fn evaluate_leaf(constraint: &Constraint, state: &ObjectState) -> bool {
    match constraint {
        Constraint::Equal { key, value } => equals(state.lookup(key).as_deref(), value),
        Constraint::NotEqual { key, value } => !equals(state.lookup(key).as_deref(), value),
        Constraint::LessThan { key, value } => {
            compare(state.lookup(key).as_deref(), value, Ordering::is_lt)
        }
        Constraint::LessOrEqual { key, value } => {
            compare(state.lookup(key).as_deref(), value, Ordering::is_le)
        }
        Constraint::GreaterThan { key, value } => {
            compare(state.lookup(key).as_deref(), value, Ordering::is_gt)
        }
        Constraint::GreaterOrEqual { key, value } => {
            compare(state.lookup(key).as_deref(), value, Ordering::is_ge)
        }
        Constraint::ContainedIn { key, values } => {
            let field = state.lookup(key);
            values.iter().any(|v| equals(field.as_deref(), v))
        }
        Constraint::NotContainedIn { key, values } => {
            let field = state.lookup(key);
            !values.iter().any(|v| equals(field.as_deref(), v))
        }
        Constraint::Exists { key } => state.lookup(key).is_some_and(|v| !v.is_null()),
        Constraint::NotExists { key } => !state.lookup(key).is_some_and(|v| !v.is_null()),
        Constraint::StartsWith { key, prefix } => state
            .lookup(key)
            .as_deref()
            .and_then(Value::as_str)
            .is_some_and(|s| s.starts_with(prefix.as_str())),
        Constraint::ContainsAllOf { key, values } => match state.lookup(key).as_deref() {
            Some(Value::Array(items)) => values.iter().all(|v| items.contains(v)),
            _ => false,
        },
        Constraint::Near { key, point, bound } => state
            .lookup(key)
            .as_deref()
            .and_then(Value::as_geo_point)
            .is_some_and(|p| within(&p, point, bound.as_ref())),
        // Compiled into other predicates
        Constraint::Or { .. }
        | Constraint::RelatedTo { .. }
        | Constraint::MatchesQuery { .. }
        | Constraint::NotMatchesQuery { .. }
        | Constraint::MatchesKeyInSubquery { .. }
        | Constraint::NotMatchesKeyInSubquery { .. } => false,
    }
}

/// Equality with array-contains semantics. A missing field equals only `Null`.
fn equals(field: Option<&Value>, target: &Value) -> bool {
    match (field, target) {
        (None, Value::Null) => true,
        (None, _) => false,
        (Some(Value::Array(items)), target) if !matches!(target, Value::Array(_)) => {
            items.contains(target)
        }
        (Some(value), target) => value == target,
    }
}

fn any_element(value: &Value, predicate: impl Fn(&Value) -> bool) -> bool {
    match value {
        Value::Array(items) => items.iter().any(&predicate),
        other => predicate(other),
    }
}

/// Ordered comparison; only same-kind numbers, strings and dates compare.
fn compare(field: Option<&Value>, target: &Value, accept: fn(Ordering) -> bool) -> bool {
    let ordering = match (field, target) {
        (Some(Value::Number(a)), Value::Number(b)) => a.partial_cmp(b),
        (Some(Value::String(a)), Value::String(b)) => Some(a.cmp(b)),
        (Some(Value::Date(a)), Value::Date(b)) => Some(a.cmp(b)),
        _ => None,
    };
    ordering.is_some_and(accept)
}

fn within(point: &GeoPoint, origin: &GeoPoint, bound: Option<&GeoBound>) -> bool {
    match bound {
        None => true,
        Some(GeoBound::MaxDistance { radians }) => origin.radians_to(point) <= *radians,
        Some(GeoBound::WithinBox {
            southwest,
            northeast,
        }) => {
            let lat_ok = (southwest.latitude..=northeast.latitude).contains(&point.latitude);
            let lng_ok = if southwest.longitude <= northeast.longitude {
                (southwest.longitude..=northeast.longitude).contains(&point.longitude)
            } else {
                // Box crosses the antimeridian
                point.longitude >= southwest.longitude || point.longitude <= northeast.longitude
            };
            lat_ok && lng_ok
        }
    }
}

fn sort_rank(value: Option<&Value>) -> u8 {
    match value {
        None => 0,
        Some(Value::Null) => 1,
        Some(Value::Bool(_)) => 2,
        Some(Value::Number(_)) => 3,
        Some(Value::String(_)) => 4,
        Some(Value::Date(_)) => 5,
        Some(_) => 6,
    }
}

/// Total order used for sorting: missing < null < bool < number < string < date < other.
fn compare_for_sort(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    sort_rank(a).cmp(&sort_rank(b)).then_with(|| match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => x.total_cmp(y),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Date(x)), Some(Value::Date(y))) => x.cmp(y),
        _ => Ordering::Equal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Pointer;

    fn record(id: &str, fields: Vec<(&str, Value)>) -> Candidate {
        let state = ObjectState::from_fields("GameScore", fields)
            .unwrap()
            .with_object_id(id);
        Candidate::new(ObjectId::Server(id.into()), state)
    }

    fn scores() -> Vec<Candidate> {
        vec![
            record("a", vec![("player", "ann".into()), ("score", 10.into())]),
            record("b", vec![("player", "bob".into()), ("score", 30.into())]),
            record("c", vec![("player", "cat".into()), ("score", 20.into())]),
            record("d", vec![("player", "dan".into())]),
        ]
    }

    fn ids(results: &[Candidate]) -> Vec<&str> {
        results
            .iter()
            .map(|c| c.state.object_id().unwrap_or_default())
            .collect()
    }

    fn run(query: &Query) -> Vec<Candidate> {
        Matcher::new(query, &SubqueryResults::new())
            .unwrap()
            .execute(scores())
    }

    #[test]
    fn equality_and_comparison() {
        let query = Query::new("GameScore").where_greater_than("score", 15);
        assert_eq!(ids(&run(&query)), vec!["b", "c"]);

        let query = Query::new("GameScore").where_equal_to("player", "ann");
        assert_eq!(ids(&run(&query)), vec!["a"]);

        let query = Query::new("GameScore").where_not_equal_to("player", "ann");
        assert_eq!(ids(&run(&query)), vec!["b", "c", "d"]);
    }

    #[test]
    fn comparisons_skip_other_kinds() {
        let query = Query::new("GameScore").where_less_than("score", "zzz");
        assert!(run(&query).is_empty());
    }

    #[test]
    fn missing_field_equals_null_only() {
        let query = Query::new("GameScore").where_equal_to("score", Value::Null);
        assert_eq!(ids(&run(&query)), vec!["d"]);

        let query = Query::new("GameScore").where_does_not_exist("score");
        assert_eq!(ids(&run(&query)), vec!["d"]);
    }

    #[test]
    fn ordering_and_paging() {
        let query = Query::new("GameScore")
            .order_by_descending("score")
            .skip(1)
            .limit(2);
        // missing sorts lowest, so it comes last when descending
        assert_eq!(ids(&run(&query)), vec!["c", "a"]);

        let query = Query::new("GameScore").order_by_ascending("score");
        assert_eq!(ids(&run(&query)), vec!["d", "a", "c", "b"]);
    }

    #[test]
    fn array_contains_semantics() {
        let tagged = vec![
            record("x", vec![("tags", Value::Array(vec!["red".into(), "blue".into()]))]),
            record("y", vec![("tags", Value::Array(vec!["red".into()]))]),
        ];
        let query = Query::new("GameScore").where_equal_to("tags", "blue");
        let hits = Matcher::new(&query, &SubqueryResults::new())
            .unwrap()
            .execute(tagged.clone());
        assert_eq!(ids(&hits), vec!["x"]);

        let query = Query::new("GameScore")
            .where_contains_all("tags", vec!["red".into(), "blue".into()]);
        let hits = Matcher::new(&query, &SubqueryResults::new())
            .unwrap()
            .execute(tagged);
        assert_eq!(ids(&hits), vec!["x"]);
    }

    #[test]
    fn or_clauses() {
        let a = Query::new("GameScore").where_equal_to("player", "ann");
        let b = Query::new("GameScore").where_greater_than("score", 25);
        let query = Query::or(vec![a, b]).unwrap();
        assert_eq!(ids(&run(&query)), vec!["a", "b"]);
    }

    #[test]
    fn matches_query_uses_subquery_results() {
        let team = |id: &str, city: &str| {
            Candidate::new(
                ObjectId::Server(id.into()),
                ObjectState::from_fields("Team", [("city", city)])
                    .unwrap()
                    .with_object_id(id),
            )
        };
        let players = vec![
            Candidate::new(
                ObjectId::Server("p1".into()),
                ObjectState::from_fields("Player", [("team", Pointer::server("Team", "t1"))])
                    .unwrap()
                    .with_object_id("p1"),
            ),
            Candidate::new(
                ObjectId::Server("p2".into()),
                ObjectState::from_fields("Player", [("team", Pointer::server("Team", "t2"))])
                    .unwrap()
                    .with_object_id("p2"),
            ),
        ];

        let inner = Query::new("Team").where_equal_to("city", "Oslo");
        let query = Query::new("Player").where_matches_query("team", inner.clone());

        let mut subqueries = SubqueryResults::new();
        let teams = vec![team("t1", "Oslo"), team("t2", "Rome")];
        let inner_hits = Matcher::new(&inner, &SubqueryResults::new())
            .unwrap()
            .execute(teams);
        subqueries.insert(&inner, inner_hits).unwrap();

        let hits = Matcher::new(&query, &subqueries)
            .unwrap()
            .execute(players.clone());
        assert_eq!(ids(&hits), vec!["p1"]);

        let negated = Query::new("Player").where_does_not_match_query("team", inner);
        let hits = Matcher::new(&negated, &subqueries).unwrap().execute(players);
        assert_eq!(ids(&hits), vec!["p2"]);
    }

    #[test]
    fn missing_subquery_is_an_error() {
        let query = Query::new("Player").where_matches_query("team", Query::new("Team"));
        assert!(matches!(
            Matcher::new(&query, &SubqueryResults::new()),
            Err(Error::ConstraintError(_))
        ));
    }

    #[test]
    fn related_to_is_rejected_locally() {
        let query =
            Query::new("Comment").where_related_to(Pointer::server("Post", "p1"), "comments");
        assert!(matches!(
            Matcher::new(&query, &SubqueryResults::new()),
            Err(Error::ConstraintError(_))
        ));
    }

    #[test]
    fn near_orders_by_distance() {
        let place = |id: &str, lat: f64| {
            record(id, vec![("location", GeoPoint::new(lat, 0.0).into())])
        };
        let places = vec![place("far", 10.0), place("near", 1.0), place("mid", 5.0)];

        let query = Query::new("GameScore").where_near("location", GeoPoint::new(0.0, 0.0));
        let hits = Matcher::new(&query, &SubqueryResults::new())
            .unwrap()
            .execute(places.clone());
        assert_eq!(ids(&hits), vec!["near", "mid", "far"]);

        let query = Query::new("GameScore").where_within_kilometers(
            "location",
            GeoPoint::new(0.0, 0.0),
            700.0,
        );
        let hits = Matcher::new(&query, &SubqueryResults::new())
            .unwrap()
            .execute(places);
        assert_eq!(ids(&hits), vec!["near", "mid"]);
    }

    #[test]
    fn count_ignores_paging() {
        let query = Query::new("GameScore").where_exists("score").limit(1);
        let matcher = Matcher::new(&query, &SubqueryResults::new()).unwrap();
        let candidates = scores();
        assert_eq!(matcher.count(&candidates), 3);
        assert_eq!(matcher.execute(candidates).len(), 1);
    }

    #[test]
    fn other_classes_never_match() {
        let query = Query::new("Player");
        assert!(run(&query).is_empty());
    }
}
