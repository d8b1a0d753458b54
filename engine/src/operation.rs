//! Field operations for expressing changes.
//!
//! Edits are recorded as operations rather than direct mutations, so a batch
//! of unsaved changes can be transmitted, replayed after a failure, or
//! coalesced with newer edits to the same key.

use crate::{error::Result, Error, ObjectState, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for an operation batch.
pub type BatchId = String;

/// A pending change to one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "__op")]
pub enum FieldOperation {
    Set { value: Value },
    Increment { amount: f64 },
    Add { objects: Vec<Value> },
    AddUnique { objects: Vec<Value> },
    Remove { objects: Vec<Value> },
    Delete,
}

impl FieldOperation {
    /// Apply to the current value of a field. `None` means the field is absent.
    pub fn apply(&self, current: Option<&Value>) -> Result<Option<Value>> {
        match self {
            FieldOperation::Set { value } => Ok(Some(value.clone())),
            FieldOperation::Delete => Ok(None),
            FieldOperation::Increment { amount } => match current {
                None | Some(Value::Null) => Ok(Some(Value::Number(*amount))),
                Some(Value::Number(n)) => Ok(Some(Value::Number(n + amount))),
                Some(other) => Err(Error::type_error(format!(
                    "cannot increment a {}",
                    other.type_name()
                ))),
            },
            FieldOperation::Add { objects } => {
                let mut items = current_array(current, "Add")?;
                items.extend(objects.iter().cloned());
                Ok(Some(Value::Array(items)))
            }
            FieldOperation::AddUnique { objects } => {
                let mut items = current_array(current, "AddUnique")?;
                push_unique(&mut items, objects);
                Ok(Some(Value::Array(items)))
            }
            FieldOperation::Remove { objects } => {
                let mut items = current_array(current, "Remove")?;
                items.retain(|item| !objects.contains(item));
                Ok(Some(Value::Array(items)))
            }
        }
    }

    /// Coalesce this operation with one recorded earlier on the same key.
    pub fn merge_with_previous(self, previous: Option<FieldOperation>) -> Result<FieldOperation> {
        let Some(previous) = previous else {
            return Ok(self);
        };

        match self {
            FieldOperation::Set { .. } | FieldOperation::Delete => Ok(self),
            FieldOperation::Increment { amount } => match previous {
                FieldOperation::Set { value } => match value {
                    Value::Number(n) => Ok(FieldOperation::Set {
                        value: Value::Number(n + amount),
                    }),
                    other => Err(Error::type_error(format!(
                        "cannot increment a {}",
                        other.type_name()
                    ))),
                },
                FieldOperation::Increment { amount: before } => Ok(FieldOperation::Increment {
                    amount: before + amount,
                }),
                FieldOperation::Delete => Ok(FieldOperation::Set {
                    value: Value::Number(amount),
                }),
                other => Err(incompatible("Increment", &other)),
            },
            FieldOperation::Add { objects } => match previous {
                FieldOperation::Set { value } => {
                    let mut items = set_array(value, "Add")?;
                    items.extend(objects);
                    Ok(FieldOperation::Set {
                        value: Value::Array(items),
                    })
                }
                FieldOperation::Add { objects: mut before } => {
                    before.extend(objects);
                    Ok(FieldOperation::Add { objects: before })
                }
                FieldOperation::Delete => Ok(FieldOperation::Set {
                    value: Value::Array(objects),
                }),
                other => Err(incompatible("Add", &other)),
            },
            FieldOperation::AddUnique { objects } => match previous {
                FieldOperation::Set { value } => {
                    let mut items = set_array(value, "AddUnique")?;
                    push_unique(&mut items, &objects);
                    Ok(FieldOperation::Set {
                        value: Value::Array(items),
                    })
                }
                FieldOperation::AddUnique {
                    objects: mut before,
                } => {
                    push_unique(&mut before, &objects);
                    Ok(FieldOperation::AddUnique { objects: before })
                }
                FieldOperation::Delete => {
                    let mut items = Vec::new();
                    push_unique(&mut items, &objects);
                    Ok(FieldOperation::Set {
                        value: Value::Array(items),
                    })
                }
                other => Err(incompatible("AddUnique", &other)),
            },
            FieldOperation::Remove { objects } => match previous {
                FieldOperation::Set { value } => {
                    let mut items = set_array(value, "Remove")?;
                    items.retain(|item| !objects.contains(item));
                    Ok(FieldOperation::Set {
                        value: Value::Array(items),
                    })
                }
                FieldOperation::Remove {
                    objects: mut before,
                } => {
                    push_unique(&mut before, &objects);
                    Ok(FieldOperation::Remove { objects: before })
                }
                FieldOperation::Delete => Ok(FieldOperation::Set {
                    value: Value::Array(Vec::new()),
                }),
                other => Err(incompatible("Remove", &other)),
            },
        }
    }

    /// Replace local-id pointers inside the operation with server ids.
    pub fn resolve_local_ids(
        &self,
        resolve: &impl Fn(&str) -> Option<String>,
    ) -> std::result::Result<FieldOperation, String> {
        let resolve_all = |objects: &[Value]| {
            objects
                .iter()
                .map(|v| v.resolve_local_ids(resolve))
                .collect::<std::result::Result<Vec<_>, _>>()
        };
        Ok(match self {
            FieldOperation::Set { value } => FieldOperation::Set {
                value: value.resolve_local_ids(resolve)?,
            },
            FieldOperation::Add { objects } => FieldOperation::Add {
                objects: resolve_all(objects)?,
            },
            FieldOperation::AddUnique { objects } => FieldOperation::AddUnique {
                objects: resolve_all(objects)?,
            },
            FieldOperation::Remove { objects } => FieldOperation::Remove {
                objects: resolve_all(objects)?,
            },
            other => other.clone(),
        })
    }

    fn values(&self) -> &[Value] {
        match self {
            FieldOperation::Set { value } => std::slice::from_ref(value),
            FieldOperation::Add { objects }
            | FieldOperation::AddUnique { objects }
            | FieldOperation::Remove { objects } => objects,
            FieldOperation::Increment { .. } | FieldOperation::Delete => &[],
        }
    }

    fn name(&self) -> &'static str {
        match self {
            FieldOperation::Set { .. } => "Set",
            FieldOperation::Increment { .. } => "Increment",
            FieldOperation::Add { .. } => "Add",
            FieldOperation::AddUnique { .. } => "AddUnique",
            FieldOperation::Remove { .. } => "Remove",
            FieldOperation::Delete => "Delete",
        }
    }
}

fn current_array(current: Option<&Value>, op: &str) -> Result<Vec<Value>> {
    match current {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(other) => Err(Error::type_error(format!(
            "{op} requires an array, found {}",
            other.type_name()
        ))),
    }
}

fn set_array(value: Value, op: &str) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(Error::type_error(format!(
            "{op} requires an array, found {}",
            other.type_name()
        ))),
    }
}

fn push_unique(items: &mut Vec<Value>, objects: &[Value]) {
    for object in objects {
        if !items.contains(object) {
            items.push(object.clone());
        }
    }
}

fn incompatible(op: &str, previous: &FieldOperation) -> Error {
    Error::type_error(format!("{op} cannot follow {}", previous.name()))
}

/// An atomic batch of field operations, keyed by field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSet {
    /// Batch ID
    pub id: BatchId,
    operations: BTreeMap<String, FieldOperation>,
}

impl OperationSet {
    /// Create an empty batch.
    pub fn new(id: impl Into<BatchId>) -> Self {
        Self {
            id: id.into(),
            operations: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn get(&self, key: &str) -> Option<&FieldOperation> {
        self.operations.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.operations.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldOperation)> {
        self.operations.iter()
    }

    /// Record an operation, coalescing with any earlier one on the same key.
    ///
    /// Values are validated first, so an invalid value never enters the batch.
    pub fn record(&mut self, key: impl Into<String>, op: FieldOperation) -> Result<()> {
        let key = key.into();
        let top_level = matches!(op, FieldOperation::Set { .. });
        for value in op.values() {
            value
                .validate(top_level)
                .map_err(|e| Error::TypeError(format!("field {key:?}: {e}")))?;
        }
        let previous = self.operations.remove(&key);
        let merged = match op.merge_with_previous(previous.clone()) {
            Ok(merged) => merged,
            Err(e) => {
                if let Some(previous) = previous {
                    self.operations.insert(key, previous);
                }
                return Err(e);
            }
        };
        self.operations.insert(key, merged);
        Ok(())
    }

    /// Place an older batch beneath this one, keeping this batch's edits on top.
    ///
    /// Used to replay a batch whose save failed under edits made since.
    pub fn merge_from(&mut self, older: &OperationSet) -> Result<()> {
        let mut merged = older.operations.clone();
        for (key, op) in std::mem::take(&mut self.operations) {
            let previous = merged.remove(&key);
            merged.insert(key, op.merge_with_previous(previous)?);
        }
        self.operations = merged;
        Ok(())
    }

    /// Apply every operation to `state`, returning the resulting state.
    pub fn apply_to(&self, state: &ObjectState) -> Result<ObjectState> {
        let mut next = state.clone();
        for (key, op) in &self.operations {
            next = match op.apply(next.get(key))? {
                Some(value) => next.with_field(key.clone(), value)?,
                None => next.without_field(key),
            };
        }
        Ok(next)
    }

    /// Replace local-id pointers with server ids. Returns the first unresolved
    /// local token as the error.
    pub fn resolve_local_ids(
        &self,
        resolve: &impl Fn(&str) -> Option<String>,
    ) -> std::result::Result<OperationSet, String> {
        let operations = self
            .operations
            .iter()
            .map(|(k, op)| op.resolve_local_ids(resolve).map(|op| (k.clone(), op)))
            .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;
        Ok(OperationSet {
            id: self.id.clone(),
            operations,
        })
    }
}
