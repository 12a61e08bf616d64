//! Structural schema validation
//!
//! Wraps a compiled JSON Schema (Draft 7). Compilation happens once, when a
//! descriptor is built; validation collects every violation rather than
//! stopping at the first one.

use crate::error::FieldViolation;
use jsonschema::error::ValidationErrorKind;
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Compiled structural validator
#[derive(Clone)]
pub struct SchemaValidator {
    schema: Arc<Value>,
    // `None` accepts every instance
    compiled: Option<Arc<JSONSchema>>,
}

impl SchemaValidator {
    /// Compile `schema`
    ///
    /// # Errors
    /// Returns the compiler message if the schema is not a valid Draft 7 schema.
    pub fn compile(schema: Value) -> Result<Self, String> {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&schema)
            .map_err(|e| e.to_string())?;

        Ok(Self {
            schema: Arc::new(schema),
            compiled: Some(Arc::new(compiled)),
        })
    }

    /// Schema accepting any value
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            schema: Arc::new(Value::Bool(true)),
            compiled: None,
        }
    }

    /// Raw schema document
    #[inline]
    #[must_use]
    pub fn schema(&self) -> &Value {
        &self.schema
    }

    /// Validate `instance`, collecting every violation
    ///
    /// # Errors
    /// Returns the offending fields as JSON pointers.
    pub fn validate(&self, instance: &Value) -> Result<(), Vec<FieldViolation>> {
        let Some(compiled) = &self.compiled else {
            return Ok(());
        };
        let Err(errors) = compiled.validate(instance) else {
            return Ok(());
        };

        let violations = errors
            .map(|e| {
                let mut field = e.instance_path.to_string();
                if let ValidationErrorKind::Required { property } = &e.kind {
                    let name = property.as_str().map_or_else(|| property.to_string(), str::to_string);
                    field = format!("{field}/{name}");
                }
                FieldViolation {
                    field,
                    message: e.to_string(),
                }
            })
            .collect();

        Err(violations)
    }

    /// Names listed under the schema's top-level `required`
    #[must_use]
    pub fn required_properties(&self) -> Vec<String> {
        self.schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Names declared under the schema's top-level `properties`
    #[must_use]
    pub fn declared_properties(&self) -> Vec<String> {
        self.schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl fmt::Debug for SchemaValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaValidator")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}
