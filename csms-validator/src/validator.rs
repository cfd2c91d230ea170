//! Protocol-version aware payload validation
//!
//! Compiled validators are cached per protocol and schema id, so the same
//! action can carry a different schema under each OCPP version. Validation
//! never fails with `Err`; a rejected payload is an ordinary
//! [`ValidationOutcome`].

use std::collections::HashMap;
use std::sync::Arc;

use jsonschema::Validator;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use csms_core::{OcppVersion, DATA_TRANSFER};

use crate::registry::{Direction, SchemaRegistry};
use crate::ValidatorError;

/// One schema violation, detached from the validator that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaViolation {
    pub instance_path: String,
    pub schema_path: String,
    pub message: String,
}

impl SchemaViolation {
    fn detached(message: impl Into<String>) -> Self {
        Self {
            instance_path: String::new(),
            schema_path: String::new(),
            message: message.into(),
        }
    }
}

/// Result of validating one payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<SchemaViolation>>,
}

impl ValidationOutcome {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            errors: None,
        }
    }

    pub fn invalid(errors: Vec<SchemaViolation>) -> Self {
        Self {
            is_valid: false,
            errors: Some(errors),
        }
    }

    fn rejected(message: impl Into<String>) -> Self {
        Self::invalid(vec![SchemaViolation::detached(message)])
    }

    /// Errors as a JSON value, for CallError details
    pub fn details(&self) -> Value {
        match &self.errors {
            Some(errors) => serde_json::json!({ "errors": errors }),
            None => Value::Object(serde_json::Map::new()),
        }
    }
}

/// Validates OCPP payloads against the registered schemas
pub struct OcppValidator {
    registry: RwLock<SchemaRegistry>,
    compiled: RwLock<HashMap<String, Arc<Validator>>>,
    /// Held while compiling so concurrent first use compiles once
    compile_lock: Mutex<()>,
    vendor_schemas: RwLock<HashMap<String, Arc<Validator>>>,
}

impl OcppValidator {
    pub fn new(registry: SchemaRegistry) -> Self {
        Self {
            registry: RwLock::new(registry),
            compiled: RwLock::new(HashMap::new()),
            compile_lock: Mutex::new(()),
            vendor_schemas: RwLock::new(HashMap::new()),
        }
    }

    /// Validator over the bundled schema subset
    pub fn bundled() -> Result<Self, ValidatorError> {
        Ok(Self::new(SchemaRegistry::bundled()?))
    }

    /// Register or replace a schema, dropping any compiled copy of the old one
    pub fn register_schema(&self, version: OcppVersion, action: &str, direction: Direction, schema: Value) {
        let replaced = self.registry.write().insert(version, action, direction, schema);
        if let Some(old) = replaced {
            let key = cache_key(version, action, direction, &old);
            self.compiled.write().remove(&key);
        }
    }

    /// Register the schema for the inner `data` of a DataTransfer request
    pub fn register_vendor_schema(
        &self,
        vendor_id: &str,
        message_id: Option<&str>,
        schema: &Value,
    ) -> Result<(), ValidatorError> {
        let key = vendor_key(vendor_id, message_id);
        let validator = jsonschema::validator_for(schema).map_err(|e| ValidatorError::InvalidSchema {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.vendor_schemas.write().insert(key, Arc::new(validator));
        Ok(())
    }

    /// Actions known under `version`
    pub fn actions(&self, version: OcppVersion) -> Vec<String> {
        self.registry.read().actions(version)
    }

    /// Number of compiled validators currently cached
    pub fn compiled_count(&self) -> usize {
        self.compiled.read().len()
    }

    /// Validate `payload` for `action` under the protocol named `protocol`
    pub fn validate(&self, protocol: &str, action: &str, direction: Direction, payload: &Value) -> ValidationOutcome {
        let version = match protocol.parse::<OcppVersion>() {
            Ok(version) => version,
            Err(e) => {
                debug!("Rejecting {} payload: {}", action, e);
                return ValidationOutcome::rejected(e.to_string());
            }
        };
        if action == DATA_TRANSFER {
            return self.validate_data_transfer(version, direction, payload);
        }
        self.validate_outer(version, action, direction, payload)
    }

    fn validate_outer(
        &self,
        version: OcppVersion,
        action: &str,
        direction: Direction,
        payload: &Value,
    ) -> ValidationOutcome {
        match self.compiled_for(version, action, direction) {
            Ok(validator) => run(&validator, payload, ""),
            Err(e) => {
                debug!("No usable schema for {} {} {}: {}", version, action, direction.as_str(), e);
                ValidationOutcome::rejected(e.to_string())
            }
        }
    }

    /// Outer DataTransfer validation plus the vendor schema for `data`, when one
    /// is registered. Without one the inner data is accepted as is.
    fn validate_data_transfer(&self, version: OcppVersion, direction: Direction, payload: &Value) -> ValidationOutcome {
        let outer = self.validate_outer(version, DATA_TRANSFER, direction, payload);
        if !outer.is_valid || direction == Direction::Response {
            return outer;
        }

        let Some(vendor_id) = payload.get("vendorId").and_then(Value::as_str) else {
            return outer;
        };
        let message_id = payload.get("messageId").and_then(Value::as_str);
        let Some(inner) = self.vendor_validator(vendor_id, message_id) else {
            return outer;
        };

        let data = match payload.get("data") {
            // 1.6 carries data as a string; vendors put JSON in it
            Some(Value::String(text)) if version == OcppVersion::Ocpp16 => match serde_json::from_str(text) {
                Ok(parsed) => parsed,
                Err(e) => return ValidationOutcome::rejected(format!("DataTransfer data is not JSON: {}", e)),
            },
            Some(data) => data.clone(),
            None => Value::Null,
        };
        run(&inner, &data, "/data")
    }

    fn vendor_validator(&self, vendor_id: &str, message_id: Option<&str>) -> Option<Arc<Validator>> {
        let schemas = self.vendor_schemas.read();
        message_id
            .and_then(|m| schemas.get(&vendor_key(vendor_id, Some(m))))
            .or_else(|| schemas.get(vendor_id))
            .cloned()
    }

    fn compiled_for(
        &self,
        version: OcppVersion,
        action: &str,
        direction: Direction,
    ) -> Result<Arc<Validator>, ValidatorError> {
        let schema = self
            .registry
            .read()
            .get(version, action, direction)
            .ok_or_else(|| ValidatorError::UnknownAction {
                protocol: version.to_string(),
                action: action.to_string(),
            })?;
        let key = cache_key(version, action, direction, &schema);

        if let Some(validator) = self.compiled.read().get(&key) {
            return Ok(validator.clone());
        }

        let _guard = self.compile_lock.lock();
        if let Some(validator) = self.compiled.read().get(&key) {
            return Ok(validator.clone());
        }
        let validator = jsonschema::validator_for(&schema).map_err(|e| {
            warn!("Schema {} does not compile: {}", key, e);
            ValidatorError::InvalidSchema {
                key: key.clone(),
                reason: e.to_string(),
            }
        })?;
        debug!("Compiled schema {}", key);
        let validator = Arc::new(validator);
        self.compiled.write().insert(key, validator.clone());
        Ok(validator)
    }
}

fn run(validator: &Validator, payload: &Value, prefix: &str) -> ValidationOutcome {
    let errors: Vec<SchemaViolation> = validator
        .iter_errors(payload)
        .map(|e| SchemaViolation {
            instance_path: format!("{}{}", prefix, e.instance_path),
            schema_path: e.schema_path.to_string(),
            message: e.to_string(),
        })
        .collect();
    if errors.is_empty() {
        ValidationOutcome::valid()
    } else {
        ValidationOutcome::invalid(errors)
    }
}

/// Protocol-prefixed schema id, falling back to action and direction
fn cache_key(version: OcppVersion, action: &str, direction: Direction, schema: &Value) -> String {
    let id = schema
        .get("$id")
        .or_else(|| schema.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}{}", action, direction.as_str()));
    format!("{}{}", version, id)
}

fn vendor_key(vendor_id: &str, message_id: Option<&str>) -> String {
    match message_id {
        Some(message_id) => format!("{}:{}", vendor_id, message_id),
        None => vendor_id.to_string(),
    }
}
