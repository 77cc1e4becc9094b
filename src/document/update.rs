//! Field mutations and the update engine.
//!
//! An update command carries an ordered list of [`FieldMutation`]s. The
//! engine applies them in command order against a document value; the slow
//! path runs it coordinator-side after the authoritative full get, the fast
//! path ships the mutations to the storage nodes untouched.

use crate::document::fields::Document;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One field mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldMutation {
    /// Set a field to a value, replacing any previous value.
    Assign { field: String, value: Value },

    /// Remove a field. Removing an absent field is a no-op.
    Remove { field: String },

    /// Add a delta to a numeric field. An absent field counts as zero.
    ArithmeticAdd { field: String, delta: f64 },

    /// Remove every field.
    ClearAll,
}

impl FieldMutation {
    /// Short operation name for traces.
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::Assign { .. } => "assign",
            Self::Remove { .. } => "remove",
            Self::ArithmeticAdd { .. } => "arithmetic_add",
            Self::ClearAll => "clear_all",
        }
    }
}

/// Failure while applying mutations.
#[derive(Debug, Error)]
pub enum UpdateEngineError {
    /// ArithmeticAdd hit a field holding a non-numeric value.
    #[error("field {field} is not numeric (found {found})")]
    NotNumeric { field: String, found: String },
}

/// Applies mutation lists to document values.
#[derive(Debug, Default)]
pub struct UpdateEngine;

impl UpdateEngine {
    /// Apply `mutations` to `document` in order.
    ///
    /// On error the document may be partially mutated; callers apply to a
    /// scratch copy.
    pub fn apply(
        &self,
        document: &mut Document,
        mutations: &[FieldMutation],
    ) -> Result<(), UpdateEngineError> {
        for mutation in mutations {
            self.apply_one(document, mutation)?;
        }
        Ok(())
    }

    fn apply_one(
        &self,
        document: &mut Document,
        mutation: &FieldMutation,
    ) -> Result<(), UpdateEngineError> {
        match mutation {
            FieldMutation::Assign { field, value } => {
                document.set_field(field.clone(), value.clone());
            }
            FieldMutation::Remove { field } => {
                document.remove_field(field);
            }
            FieldMutation::ArithmeticAdd { field, delta } => {
                let current = match document.fields.get(field) {
                    None => 0.0,
                    Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
                    Some(other) => {
                        return Err(UpdateEngineError::NotNumeric {
                            field: field.clone(),
                            found: type_name_of(other).to_string(),
                        })
                    }
                };
                let sum = current + delta;
                // Integral results stay integers so counters don't decay to floats.
                let value = if sum.fract() == 0.0 && sum.abs() < (i64::MAX as f64) {
                    Value::from(sum as i64)
                } else {
                    Value::from(sum)
                };
                document.set_field(field.clone(), value);
            }
            FieldMutation::ClearAll => {
                document.fields.clear();
            }
        }
        Ok(())
    }
}

fn type_name_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
