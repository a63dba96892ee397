//! The task interface and the process-wide registry of task types.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::Value;

use stardag_types::AssetUpload;

use crate::error::TaskError;
use crate::params::{self, ParamSpec};

pub type TaskRef = Arc<dyn Task>;

/// What a run phase produced.
pub enum RunOutcome {
    /// The task is done.
    Finished,
    /// Dynamic dependencies. The engine guarantees every task in the batch
    /// has reached completed status before `run` is called again with the
    /// next phase index.
    Deps(Vec<TaskRef>),
}

/// A unit of work in the DAG.
///
/// Tasks are identified by a content-addressed id derived from their
/// `(namespace, name)` discriminator and hash-mode parameters; two
/// processes constructing the same task with the same parameters agree on
/// the id.
///
/// Dynamic dependencies are expressed as a resumable state machine rather
/// than a generator: `run(0)` is the first call, and each `RunOutcome::Deps`
/// batch is built to completion before `run(phase + 1)` continues the work.
/// Implementations that span phases stash intermediate state behind
/// interior mutability or reload it from their target.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    fn namespace(&self) -> String;

    fn name(&self) -> String;

    /// Version of the run implementation; recorded alongside the task.
    fn version(&self) -> Option<String> {
        None
    }

    /// The task's parameters as a JSON object.
    fn params(&self) -> Value;

    /// Hash/compat metadata for individual parameters.
    fn param_specs(&self) -> Vec<ParamSpec> {
        Vec::new()
    }

    /// Content-addressed id.
    fn id(&self) -> String {
        let hash_params = params::strip_for_hash(self.params(), &self.param_specs());
        params::task_id_from_parts(&self.namespace(), &self.name(), &hash_params)
    }

    /// Static dependencies.
    fn requires(&self) -> Vec<TaskRef> {
        Vec::new()
    }

    /// Whether the task's output already exists.
    async fn complete(&self) -> Result<bool, TaskError>;

    async fn run(&self, phase: usize) -> Result<RunOutcome, TaskError>;

    /// Whether this task opts into global-lock coordination. Tasks without
    /// a lock may re-execute redundantly across processes, which is fine
    /// for pure or idempotent work.
    fn lockable(&self) -> bool {
        true
    }

    /// Rich outputs to attach to the registry after completion.
    fn registry_assets(&self) -> Vec<AssetUpload> {
        Vec::new()
    }
}

type DeserializeFn = fn(Value) -> Result<TaskRef, TaskError>;

/// Registered-subclass map keyed by the `(namespace, name)` discriminator,
/// enabling polymorphic round-trip of serialized task payloads.
static TYPE_REGISTRY: Lazy<RwLock<HashMap<(String, String), DeserializeFn>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

pub fn register_task_type(
    namespace: &str,
    name: &str,
    deserialize: DeserializeFn,
) -> Result<(), TaskError> {
    let mut registry = TYPE_REGISTRY.write().expect("type registry poisoned");
    let key = (namespace.to_string(), name.to_string());
    if let Some(existing) = registry.get(&key) {
        if *existing != deserialize {
            return Err(TaskError::execution(format!(
                "duplicate task type registration for {namespace}:{name}"
            )));
        }
        return Ok(());
    }
    registry.insert(key, deserialize);
    Ok(())
}

/// Resolve a tagged wire document back into a task instance.
pub fn resolve_task(document: &Value) -> Result<TaskRef, TaskError> {
    let namespace = document
        .get(params::TYPE_NS_KEY)
        .and_then(Value::as_str)
        .ok_or_else(|| TaskError::execution("missing __ns__ discriminator"))?;
    let name = document
        .get(params::TYPE_NAME_KEY)
        .and_then(Value::as_str)
        .ok_or_else(|| TaskError::execution("missing __name__ discriminator"))?;

    let deserialize = {
        let registry = TYPE_REGISTRY.read().expect("type registry poisoned");
        registry
            .get(&(namespace.to_string(), name.to_string()))
            .copied()
            .ok_or_else(|| {
                TaskError::execution(format!("unknown registered task type: {namespace}:{name}"))
            })?
    };

    let mut payload = document.clone();
    if let Some(map) = payload.as_object_mut() {
        map.remove(params::TYPE_NS_KEY);
        map.remove(params::TYPE_NAME_KEY);
    }
    deserialize(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::wire_document;
    use serde_json::json;

    #[derive(serde::Serialize, serde::Deserialize)]
    struct Echo {
        message: String,
    }

    #[async_trait]
    impl Task for Echo {
        fn namespace(&self) -> String {
            "tests.polymorphic".to_string()
        }

        fn name(&self) -> String {
            "Echo".to_string()
        }

        fn params(&self) -> Value {
            serde_json::to_value(self).expect("serializable")
        }

        async fn complete(&self) -> Result<bool, TaskError> {
            Ok(false)
        }

        async fn run(&self, _phase: usize) -> Result<RunOutcome, TaskError> {
            Ok(RunOutcome::Finished)
        }
    }

    fn deserialize_echo(value: Value) -> Result<TaskRef, TaskError> {
        let echo: Echo = serde_json::from_value(value)
            .map_err(|e| TaskError::execution(format!("bad Echo payload: {e}")))?;
        Ok(Arc::new(echo))
    }

    #[test]
    fn wire_roundtrip_through_type_registry() {
        register_task_type("tests.polymorphic", "Echo", deserialize_echo).unwrap();
        // Registration is idempotent for the same function.
        register_task_type("tests.polymorphic", "Echo", deserialize_echo).unwrap();

        let original = Echo {
            message: "hello".to_string(),
        };
        let document = wire_document(&original);
        let restored = resolve_task(&document).unwrap();

        assert_eq!(restored.namespace(), "tests.polymorphic");
        assert_eq!(restored.name(), "Echo");
        assert_eq!(restored.params(), json!({"message": "hello"}));
        assert_eq!(restored.id(), original.id());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let document = json!({"__ns__": "nope", "__name__": "Missing", "x": 1});
        assert!(resolve_task(&document).is_err());
    }
}
