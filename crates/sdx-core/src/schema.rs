use std::collections::HashMap;

use thiserror::Error;

use crate::types::SchemaId;

/// Validation failure reported by a schema validator.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unknown schema: {0}")]
    UnknownSchema(String),
    #[error("payload rejected by schema {0}")]
    Rejected(String),
}

/// Pure predicate deciding whether bytes conform to a named schema.
///
/// The validator is supplied by an external collaborator; the engine treats
/// it as a black box and never inspects payloads itself.
pub trait SchemaValidator: Send + Sync {
    fn is_known(&self, schema: &SchemaId) -> bool;
    fn validate(&self, schema: &SchemaId, bytes: &[u8]) -> Result<(), ValidationError>;
}

type SchemaRule = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Validator over a fixed set of registered schema names.
///
/// Schemas registered without a rule accept any byte string, including the
/// empty one; a rule turns acceptance into an arbitrary caller predicate.
#[derive(Default)]
pub struct SchemaCatalog {
    rules: HashMap<SchemaId, Option<SchemaRule>>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a schema name that accepts all payloads.
    pub fn register(&mut self, schema: SchemaId) -> &mut Self {
        self.rules.insert(schema, None);
        self
    }

    /// Registers a schema name with an acceptance predicate.
    pub fn register_with_rule<F>(&mut self, schema: SchemaId, rule: F) -> &mut Self
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        self.rules.insert(schema, Some(Box::new(rule)));
        self
    }

    pub fn schemas(&self) -> Vec<SchemaId> {
        let mut names: Vec<SchemaId> = self.rules.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl SchemaValidator for SchemaCatalog {
    fn is_known(&self, schema: &SchemaId) -> bool {
        self.rules.contains_key(schema)
    }

    fn validate(&self, schema: &SchemaId, bytes: &[u8]) -> Result<(), ValidationError> {
        match self.rules.get(schema) {
            None => Err(ValidationError::UnknownSchema(schema.to_string())),
            Some(None) => Ok(()),
            Some(Some(rule)) => {
                if rule(bytes) {
                    Ok(())
                } else {
                    Err(ValidationError::Rejected(schema.to_string()))
                }
            }
        }
    }
}
