//! Task parameter serialization and the content-addressed task id.
//!
//! Two serialization modes exist:
//! - `Wire`: the parameter map plus the `__ns__` / `__name__` discriminator
//!   keys, used on the API surface and for polymorphic round-trips.
//! - `Hash`: used only for id derivation. Fields marked hash-excluded are
//!   dropped, as are optional fields whose value equals their declared
//!   backward-compat default, so adding a defaulted parameter later does
//!   not invalidate existing task ids.
//!
//! The id is the lowercase hex SHA-256 of the canonical JSON (serde_json
//! keeps object keys sorted) of the hash-mode document.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::task::Task;

pub const TYPE_NS_KEY: &str = "__ns__";
pub const TYPE_NAME_KEY: &str = "__name__";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializeMode {
    Wire,
    Hash,
}

/// Per-field serialization metadata, the hash/compat contract a task class
/// declares for its parameters.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    /// Value substituted when the field is missing in compat-mode
    /// validation, and dropped in hash mode when the value matches.
    pub compat_default: Option<Value>,
    /// Never contributes to the task id.
    pub hash_exclude: bool,
}

impl ParamSpec {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            compat_default: None,
            hash_exclude: false,
        }
    }

    pub fn with_compat_default(mut self, default: Value) -> Self {
        self.compat_default = Some(default);
        self
    }

    pub fn hash_excluded(mut self) -> Self {
        self.hash_exclude = true;
        self
    }
}

/// Drop hash-excluded fields and fields whose value equals their declared
/// compat default; the id-defining projection of a parameter map.
pub fn strip_for_hash(params: Value, specs: &[ParamSpec]) -> Value {
    match params {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                let spec = specs.iter().find(|s| s.name == key);
                if let Some(spec) = spec {
                    if spec.hash_exclude {
                        continue;
                    }
                    if spec.compat_default.as_ref() == Some(&value) {
                        continue;
                    }
                }
                out.insert(key, value);
            }
            Value::Object(out)
        }
        other => other,
    }
}

/// Serialize a task's parameters in the given mode.
pub fn serialize_params(task: &dyn Task, mode: SerializeMode) -> Value {
    match mode {
        SerializeMode::Wire => task.params(),
        SerializeMode::Hash => strip_for_hash(task.params(), &task.param_specs()),
    }
}

/// Wire document: parameters tagged with the discriminator keys.
pub fn wire_document(task: &dyn Task) -> Value {
    let mut map = match serialize_params(task, SerializeMode::Wire) {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    map.insert(TYPE_NS_KEY.to_string(), Value::String(task.namespace()));
    map.insert(TYPE_NAME_KEY.to_string(), Value::String(task.name()));
    Value::Object(map)
}

/// Fill missing fields that declare a compat default, for validating
/// payloads produced by older task definitions.
pub fn compat_fill(mut value: Value, specs: &[ParamSpec]) -> Value {
    if let Value::Object(map) = &mut value {
        for spec in specs {
            if let Some(default) = &spec.compat_default {
                if !map.contains_key(spec.name) {
                    map.insert(spec.name.to_string(), default.clone());
                }
            }
        }
    }
    value
}

/// Content-addressed id: pure function of `(namespace, name, hash params)`.
pub fn task_id_from_parts(namespace: &str, name: &str, hash_params: &Value) -> String {
    let document = serde_json::json!({
        TYPE_NS_KEY: namespace,
        TYPE_NAME_KEY: name,
        "params": hash_params,
    });
    let canonical =
        serde_json::to_string(&document).expect("canonical serialization cannot fail");
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

pub fn derive_task_id(task: &dyn Task) -> String {
    let hash_params = serialize_params(task, SerializeMode::Hash);
    task_id_from_parts(&task.namespace(), &task.name(), &hash_params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::RunOutcome;
    use crate::error::TaskError;
    use async_trait::async_trait;
    use serde_json::json;

    struct Fixture {
        params: Value,
        specs: Vec<ParamSpec>,
    }

    #[async_trait]
    impl Task for Fixture {
        fn namespace(&self) -> String {
            "tests".to_string()
        }

        fn name(&self) -> String {
            "Fixture".to_string()
        }

        fn params(&self) -> Value {
            self.params.clone()
        }

        fn param_specs(&self) -> Vec<ParamSpec> {
            self.specs.clone()
        }

        async fn complete(&self) -> Result<bool, TaskError> {
            Ok(false)
        }

        async fn run(&self, _phase: usize) -> Result<RunOutcome, TaskError> {
            Ok(RunOutcome::Finished)
        }
    }

    #[test]
    fn id_is_deterministic_over_identical_inputs() {
        let a = Fixture {
            params: json!({"x": 1, "y": "two"}),
            specs: vec![],
        };
        let b = Fixture {
            params: json!({"y": "two", "x": 1}),
            specs: vec![],
        };
        // Key order in the source does not matter; canonical form is sorted.
        assert_eq!(derive_task_id(&a), derive_task_id(&b));
        assert_eq!(derive_task_id(&a).len(), 64);
    }

    #[test]
    fn different_params_produce_different_ids() {
        let a = Fixture {
            params: json!({"x": 1}),
            specs: vec![],
        };
        let b = Fixture {
            params: json!({"x": 2}),
            specs: vec![],
        };
        assert_ne!(derive_task_id(&a), derive_task_id(&b));
    }

    #[test]
    fn default_valued_compat_field_does_not_change_id() {
        let old = Fixture {
            params: json!({"x": 1}),
            specs: vec![],
        };
        let new_with_default = Fixture {
            params: json!({"x": 1, "retries": 0}),
            specs: vec![ParamSpec::new("retries").with_compat_default(json!(0))],
        };
        let new_with_override = Fixture {
            params: json!({"x": 1, "retries": 3}),
            specs: vec![ParamSpec::new("retries").with_compat_default(json!(0))],
        };
        assert_eq!(derive_task_id(&old), derive_task_id(&new_with_default));
        assert_ne!(derive_task_id(&old), derive_task_id(&new_with_override));
    }

    #[test]
    fn hash_excluded_fields_never_contribute() {
        let a = Fixture {
            params: json!({"x": 1, "trace_id": "aaa"}),
            specs: vec![ParamSpec::new("trace_id").hash_excluded()],
        };
        let b = Fixture {
            params: json!({"x": 1, "trace_id": "bbb"}),
            specs: vec![ParamSpec::new("trace_id").hash_excluded()],
        };
        assert_eq!(derive_task_id(&a), derive_task_id(&b));
    }

    #[test]
    fn wire_document_carries_discriminators() {
        let task = Fixture {
            params: json!({"x": 1}),
            specs: vec![],
        };
        let doc = wire_document(&task);
        assert_eq!(doc[TYPE_NS_KEY], "tests");
        assert_eq!(doc[TYPE_NAME_KEY], "Fixture");
        assert_eq!(doc["x"], 1);
    }

    #[test]
    fn compat_fill_substitutes_missing_defaults_only() {
        let specs = vec![
            ParamSpec::new("retries").with_compat_default(json!(0)),
            ParamSpec::new("mode").with_compat_default(json!("fast")),
        ];
        let filled = compat_fill(json!({"retries": 5}), &specs);
        assert_eq!(filled["retries"], 5);
        assert_eq!(filled["mode"], "fast");
    }
}
