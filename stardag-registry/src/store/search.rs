//! Task search: the ad-hoc filter expression language, text search,
//! sorting/paging and the autocomplete samplers.
//!
//! Filters are parsed into `(key, op, value)` triples and evaluated against
//! task rows joined with each task's latest-event build context. Parameter
//! keys address the JSON blob with dotted paths and `[n]` array indexing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use stardag_types::{
    AvailableColumnsResponse, KeySuggestion, KeySuggestionsResponse, TaskSearchResponse,
    TaskSearchResult, TaskStatus, ValueSuggestion, ValueSuggestionsResponse,
};

use crate::error::RegistryError;

use super::rows::{BuildRow, TaskRow};
use super::status::fold_task_statuses;
use super::Store;

const CACHE_TTL: Duration = Duration::from_secs(300);
const KEY_SAMPLE_SIZE: usize = 100;
const VALUE_SAMPLE_SIZE: usize = 500;
const MAX_KEY_DEPTH: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    /// Case-insensitive substring match.
    Contains,
}

impl FilterOp {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "=" => Some(FilterOp::Eq),
            "!=" => Some(FilterOp::Ne),
            ">" => Some(FilterOp::Gt),
            "<" => Some(FilterOp::Lt),
            ">=" => Some(FilterOp::Ge),
            "<=" => Some(FilterOp::Le),
            "~" => Some(FilterOp::Contains),
            _ => None,
        }
    }

    fn is_ordering(&self) -> bool {
        matches!(
            self,
            FilterOp::Gt | FilterOp::Lt | FilterOp::Ge | FilterOp::Le
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterExpr {
    pub key: String,
    pub op: FilterOp,
    pub value: String,
}

/// Parse `key(:op)?:value` expressions joined by commas. Malformed parts
/// are skipped, matching the permissive behavior of the search surface.
pub fn parse_filter_string(filter: &str) -> Vec<FilterExpr> {
    let mut out = Vec::new();
    for part in filter.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some((key, rest)) = part.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }

        let (op, value) = match rest.split_once(':') {
            Some((op_token, value)) => match FilterOp::parse(op_token) {
                Some(op) => (op, value),
                None => continue,
            },
            None => (FilterOp::Eq, rest),
        };

        out.push(FilterExpr {
            key: key.to_string(),
            op,
            value: value.trim().to_string(),
        });
    }
    out
}

/// Walk a dotted path (with optional `[n]` array indexing on any segment)
/// into a JSON value and render the leaf as text.
pub fn get_nested_value(data: &serde_json::Value, path: &str) -> Option<String> {
    let mut current = data;
    for segment in path.split('.') {
        current = follow_segment(current, segment)?;
    }
    match current {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn follow_segment<'a>(
    current: &'a serde_json::Value,
    segment: &str,
) -> Option<&'a serde_json::Value> {
    if let Some((field, rest)) = segment.split_once('[') {
        let index: usize = rest.strip_suffix(']')?.parse().ok()?;
        let value = if field.is_empty() {
            current
        } else {
            current.get(field)?
        };
        value.get(index)
    } else {
        current.get(segment)
    }
}

fn compare_strings(op: FilterOp, left: &str, right: &str) -> bool {
    match op {
        FilterOp::Eq => left == right,
        FilterOp::Ne => left != right,
        FilterOp::Gt => left > right,
        FilterOp::Lt => left < right,
        FilterOp::Ge => left >= right,
        FilterOp::Le => left <= right,
        FilterOp::Contains => left.to_lowercase().contains(&right.to_lowercase()),
    }
}

fn compare_numeric(op: FilterOp, left: f64, right: f64) -> bool {
    match op {
        FilterOp::Gt => left > right,
        FilterOp::Lt => left < right,
        FilterOp::Ge => left >= right,
        FilterOp::Le => left <= right,
        FilterOp::Eq => left == right,
        FilterOp::Ne => left != right,
        FilterOp::Contains => false,
    }
}

/// Latest-event build context for one task.
#[derive(Debug, Clone)]
pub struct TaskBuildContext {
    pub build_id: Option<String>,
    pub build_name: Option<String>,
    pub status: TaskStatus,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub error_message: Option<String>,
}

impl Default for TaskBuildContext {
    fn default() -> Self {
        Self {
            build_id: None,
            build_name: None,
            status: TaskStatus::Pending,
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }
}

fn matches_filter(task: &TaskRow, context: &TaskBuildContext, expr: &FilterExpr) -> bool {
    let op = expr.op;
    let wanted = expr.value.as_str();

    match expr.key.as_str() {
        "task_name" => compare_strings(op, &task.task_name, wanted),
        "task_namespace" => compare_strings(op, &task.task_namespace, wanted),
        "task_id" => compare_strings(op, &task.task_id, wanted),
        "version" => compare_strings(op, task.version.as_deref().unwrap_or(""), wanted),
        "created_at" => compare_strings(op, &task.created_at.to_rfc3339(), wanted),
        "status" => compare_strings(op, context.status.as_str(), wanted),
        "build_id" => match &context.build_id {
            Some(id) => compare_strings(op, id, wanted),
            None => false,
        },
        "build_name" => match &context.build_name {
            Some(name) => compare_strings(op, name, wanted),
            None => false,
        },
        key if key.starts_with("param.") => {
            let data = task.task_data_value();
            let Some(extracted) = get_nested_value(&data, &key[6..]) else {
                return false;
            };
            if op.is_ordering() {
                // Numeric comparison: both sides cast to double.
                match (extracted.parse::<f64>(), wanted.parse::<f64>()) {
                    (Ok(l), Ok(r)) => compare_numeric(op, l, r),
                    _ => false,
                }
            } else {
                compare_strings(op, &extracted, wanted)
            }
        }
        _ => false,
    }
}

/// TTL cache for autocomplete samples, keyed per environment (and key).
pub struct SuggestionCache {
    inner: Mutex<HashMap<String, (Instant, Vec<(String, u64)>)>>,
    ttl: Duration,
}

impl Default for SuggestionCache {
    fn default() -> Self {
        Self::new(CACHE_TTL)
    }
}

impl SuggestionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn get(&self, key: &str) -> Option<Vec<(String, u64)>> {
        let mut inner = self.inner.lock().expect("suggestion cache poisoned");
        match inner.get(key) {
            Some((stamp, value)) if stamp.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                inner.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: Vec<(String, u64)>) {
        let mut inner = self.inner.lock().expect("suggestion cache poisoned");
        inner.insert(key.to_string(), (Instant::now(), value));
    }
}

fn extract_keys(
    data: &serde_json::Value,
    prefix: &str,
    counter: &mut HashMap<String, u64>,
    depth: usize,
) {
    if depth == 0 {
        return;
    }
    let Some(map) = data.as_object() else { return };
    for (key, value) in map {
        let full_key = format!("{prefix}.{key}");
        *counter.entry(full_key.clone()).or_insert(0) += 1;
        match value {
            serde_json::Value::Object(_) => {
                extract_keys(value, &full_key, counter, depth - 1);
            }
            serde_json::Value::Array(items) => {
                if let Some(first) = items.first() {
                    if first.is_object() {
                        extract_keys(first, &format!("{full_key}[0]"), counter, depth - 1);
                    }
                }
            }
            _ => {}
        }
    }
}

fn top_by_count(counter: HashMap<String, u64>, limit: usize) -> Vec<(String, u64)> {
    let mut entries: Vec<(String, u64)> = counter.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(limit);
    entries
}

impl Store {
    /// Latest-event build context per task, computed with one status fold
    /// per distinct build.
    fn build_contexts(
        &self,
        tasks: &[TaskRow],
    ) -> Result<HashMap<u64, TaskBuildContext>, RegistryError> {
        let mut fold_cache: HashMap<String, HashMap<u64, super::status::TaskStatusInfo>> =
            HashMap::new();
        let mut build_cache: HashMap<String, BuildRow> = HashMap::new();
        let mut out = HashMap::new();

        for task in tasks {
            let events = self.events_for_task(task.pk)?;
            let Some(latest) = events.last() else {
                out.insert(task.pk, TaskBuildContext::default());
                continue;
            };
            let build_id = latest.build_id.clone();

            if !fold_cache.contains_key(&build_id) {
                let build_events = self.build_events(&build_id)?;
                fold_cache.insert(build_id.clone(), fold_task_statuses(&build_events));
            }
            if !build_cache.contains_key(&build_id) {
                build_cache.insert(build_id.clone(), self.get_build_row(&build_id)?);
            }

            let info = fold_cache[&build_id].get(&task.pk).cloned().unwrap_or_default();
            out.insert(
                task.pk,
                TaskBuildContext {
                    build_id: Some(build_id.clone()),
                    build_name: Some(build_cache[&build_id].name.clone()),
                    status: info.status(),
                    started_at: info.started_at,
                    completed_at: info.completed_at,
                    error_message: info.error_message,
                },
            );
        }
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn search_tasks(
        &self,
        env_id: &str,
        filter: Option<&str>,
        q: Option<&str>,
        sort: &str,
        page: u32,
        page_size: u32,
    ) -> Result<TaskSearchResponse, RegistryError> {
        let filters = filter.map(parse_filter_string).unwrap_or_default();

        // Newest-first scan of all tasks in the environment.
        let (mut tasks, _) = self.tasks_in_env_page(env_id, 1, u32::MAX)?;
        let contexts = self.build_contexts(&tasks)?;

        if let Some(q) = q {
            let needle = q.to_lowercase();
            tasks.retain(|task| {
                task.task_name.to_lowercase().contains(&needle)
                    || task.task_namespace.to_lowercase().contains(&needle)
            });
        }
        tasks.retain(|task| {
            let context = &contexts[&task.pk];
            filters.iter().all(|expr| matches_filter(task, context, expr))
        });

        let (sort_field, sort_dir) = sort.split_once(':').unwrap_or((sort, "desc"));
        tasks.sort_by(|a, b| {
            let ordering = match sort_field {
                "task_name" => a.task_name.cmp(&b.task_name),
                "task_namespace" => a.task_namespace.cmp(&b.task_namespace),
                _ => a.created_at.cmp(&b.created_at),
            };
            if sort_dir == "asc" {
                ordering
            } else {
                ordering.reverse()
            }
        });

        let total = tasks.len() as u64;
        let offset = (page.saturating_sub(1) as usize) * page_size as usize;

        let mut results = Vec::new();
        for task in tasks.into_iter().skip(offset).take(page_size as usize) {
            let context = contexts[&task.pk].clone();
            let asset_count = self.count_assets(task.pk)?;
            results.push(TaskSearchResult {
                task_id: task.task_id.clone(),
                environment_id: task.environment_id.clone(),
                task_namespace: task.task_namespace.clone(),
                task_name: task.task_name.clone(),
                task_data: task.task_data_value(),
                version: task.version.clone(),
                created_at: task.created_at,
                build_id: context.build_id,
                build_name: context.build_name,
                status: context.status,
                started_at: context.started_at,
                completed_at: context.completed_at,
                error_message: context.error_message,
                asset_count,
            });
        }

        Ok(TaskSearchResponse {
            tasks: results,
            total,
            page,
            page_size,
            available_columns: vec![
                "task_name".to_string(),
                "task_namespace".to_string(),
                "status".to_string(),
                "build_name".to_string(),
                "created_at".to_string(),
            ],
        })
    }

    pub fn key_suggestions(
        &self,
        cache: &SuggestionCache,
        env_id: &str,
        prefix: &str,
        limit: usize,
    ) -> Result<KeySuggestionsResponse, RegistryError> {
        let mut core: Vec<KeySuggestion> = [
            ("task_name", "string"),
            ("task_namespace", "string"),
            ("task_id", "string"),
            ("status", "string"),
            ("build_id", "string"),
            ("build_name", "string"),
            ("created_at", "datetime"),
        ]
        .iter()
        .map(|(key, kind)| KeySuggestion {
            key: key.to_string(),
            r#type: kind.to_string(),
            count: None,
        })
        .collect();

        if !prefix.is_empty() && !prefix.starts_with("param.") {
            core.retain(|k| k.key.starts_with(prefix));
        }

        let mut param_keys = Vec::new();
        if prefix.is_empty() || prefix.starts_with("param") {
            let cache_key = format!("keys:{env_id}");
            let discovered = match cache.get(&cache_key) {
                Some(cached) => cached,
                None => {
                    let sample = self.recent_tasks(env_id, KEY_SAMPLE_SIZE)?;
                    let mut counter = HashMap::new();
                    for task in &sample {
                        extract_keys(&task.task_data_value(), "param", &mut counter, MAX_KEY_DEPTH);
                    }
                    let discovered = top_by_count(counter, 100);
                    cache.set(&cache_key, discovered.clone());
                    discovered
                }
            };

            let param_prefix = prefix.strip_prefix("param.").unwrap_or("");
            for (key, count) in discovered {
                if param_prefix.is_empty() || key.starts_with(&format!("param.{param_prefix}")) {
                    param_keys.push(KeySuggestion {
                        key,
                        r#type: "string".to_string(),
                        count: Some(count),
                    });
                }
                if param_keys.len() >= limit {
                    break;
                }
            }
        }

        let mut keys = core;
        keys.extend(param_keys);
        keys.truncate(limit);
        Ok(KeySuggestionsResponse { keys })
    }

    pub fn value_suggestions(
        &self,
        cache: &SuggestionCache,
        env_id: &str,
        key: &str,
        prefix: &str,
        limit: usize,
    ) -> Result<ValueSuggestionsResponse, RegistryError> {
        // Static-valued key: no sampling needed.
        if key == "status" {
            let mut values: Vec<ValueSuggestion> = ["pending", "running", "completed", "failed"]
                .iter()
                .map(|v| ValueSuggestion {
                    value: v.to_string(),
                    count: None,
                })
                .collect();
            if !prefix.is_empty() {
                values.retain(|v| v.value.starts_with(prefix));
            }
            return Ok(ValueSuggestionsResponse { values });
        }

        let cache_key = format!("values:{env_id}:{key}");
        let cached = match cache.get(&cache_key) {
            Some(cached) => cached,
            None => {
                let computed: Vec<(String, u64)> = match key {
                    "build_id" | "build_name" => {
                        let (builds, _) = self.builds_in_env_page(env_id, 1, 100)?;
                        builds
                            .into_iter()
                            .map(|b| {
                                let value = if key == "build_id" { b.id } else { b.name };
                                (value, 1)
                            })
                            .collect()
                    }
                    "task_name" | "task_namespace" => {
                        let (tasks, _) = self.tasks_in_env_page(env_id, 1, u32::MAX)?;
                        let mut counter = HashMap::new();
                        for task in tasks {
                            let value = if key == "task_name" {
                                task.task_name
                            } else {
                                task.task_namespace
                            };
                            *counter.entry(value).or_insert(0) += 1;
                        }
                        top_by_count(counter, 100)
                    }
                    key if key.starts_with("param.") => {
                        let sample = self.recent_tasks(env_id, VALUE_SAMPLE_SIZE)?;
                        let path = &key[6..];
                        let mut counter = HashMap::new();
                        for task in &sample {
                            if let Some(value) = get_nested_value(&task.task_data_value(), path) {
                                *counter.entry(value).or_insert(0) += 1;
                            }
                        }
                        top_by_count(counter, 100)
                    }
                    _ => Vec::new(),
                };
                cache.set(&cache_key, computed.clone());
                computed
            }
        };

        let values = cached
            .into_iter()
            .filter(|(value, _)| {
                prefix.is_empty() || value.to_lowercase().starts_with(&prefix.to_lowercase())
            })
            .take(limit)
            .map(|(value, count)| ValueSuggestion {
                value,
                count: Some(count),
            })
            .collect();
        Ok(ValueSuggestionsResponse { values })
    }

    pub fn available_columns(
        &self,
        env_id: &str,
    ) -> Result<AvailableColumnsResponse, RegistryError> {
        let core = [
            "task_id",
            "task_name",
            "task_namespace",
            "status",
            "build_id",
            "build_name",
            "created_at",
            "started_at",
            "completed_at",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let sample = self.recent_tasks(env_id, KEY_SAMPLE_SIZE)?;
        let mut counter = HashMap::new();
        for task in &sample {
            extract_keys(&task.task_data_value(), "param", &mut counter, MAX_KEY_DEPTH);
        }
        let params = top_by_count(counter, 50)
            .into_iter()
            .map(|(key, _)| key)
            .collect();

        Ok(AvailableColumnsResponse {
            core,
            params,
            assets: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_key_op_value_triples() {
        let filters = parse_filter_string("task_name:=:training,param.lr:>:0.01,task_namespace:~:ml");
        assert_eq!(filters.len(), 3);
        assert_eq!(filters[0].key, "task_name");
        assert_eq!(filters[0].op, FilterOp::Eq);
        assert_eq!(filters[0].value, "training");
        assert_eq!(filters[1].op, FilterOp::Gt);
        assert_eq!(filters[2].op, FilterOp::Contains);
    }

    #[test]
    fn default_operator_is_equals() {
        let filters = parse_filter_string("status:completed");
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].op, FilterOp::Eq);
        assert_eq!(filters[0].value, "completed");
    }

    #[test]
    fn skips_malformed_expressions() {
        let filters = parse_filter_string("no-colon,,key:??:v,ok:=:1");
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].key, "ok");
    }

    #[test]
    fn nested_value_with_array_indexing() {
        let data = json!({
            "model": { "layers": [ { "units": 128 }, { "units": 64 } ] },
            "lr": 0.01,
            "tags": ["a", "b"],
        });
        assert_eq!(
            get_nested_value(&data, "model.layers[1].units").as_deref(),
            Some("64")
        );
        assert_eq!(get_nested_value(&data, "lr").as_deref(), Some("0.01"));
        assert_eq!(get_nested_value(&data, "tags[0]").as_deref(), Some("a"));
        assert_eq!(get_nested_value(&data, "missing.path"), None);
        assert_eq!(get_nested_value(&data, "tags[9]"), None);
    }

    #[test]
    fn param_filters_compare_numerically_for_ordering_ops() {
        let task = TaskRow {
            pk: 1,
            task_id: "abc".to_string(),
            environment_id: "env".to_string(),
            task_namespace: "ml.training".to_string(),
            task_name: "TrainModel".to_string(),
            task_data: json!({"lr": 0.1, "epochs": 20}).to_string(),
            version: None,
            created_at: chrono::Utc::now(),
        };
        let context = TaskBuildContext::default();

        let gt = FilterExpr {
            key: "param.lr".to_string(),
            op: FilterOp::Gt,
            value: "0.05".to_string(),
        };
        assert!(matches_filter(&task, &context, &gt));

        // "0.1" > "0.05" lexicographically too, but "9" vs "10" separates
        // numeric from string comparison.
        let epochs = FilterExpr {
            key: "param.epochs".to_string(),
            op: FilterOp::Gt,
            value: "9".to_string(),
        };
        assert!(matches_filter(&task, &context, &epochs));

        let contains = FilterExpr {
            key: "task_namespace".to_string(),
            op: FilterOp::Contains,
            value: "TRAIN".to_string(),
        };
        assert!(matches_filter(&task, &context, &contains));
    }

    #[test]
    fn key_extraction_respects_depth_limit() {
        let data = json!({"a": {"b": {"c": {"d": 1}}}});
        let mut counter = HashMap::new();
        extract_keys(&data, "param", &mut counter, MAX_KEY_DEPTH);
        assert!(counter.contains_key("param.a"));
        assert!(counter.contains_key("param.a.b"));
        assert!(counter.contains_key("param.a.b.c"));
        assert!(!counter.contains_key("param.a.b.c.d"));
    }

    #[test]
    fn suggestion_cache_expires() {
        let cache = SuggestionCache::new(Duration::from_millis(0));
        cache.set("k", vec![("v".to_string(), 1)]);
        assert!(cache.get("k").is_none());

        let cache = SuggestionCache::new(Duration::from_secs(60));
        cache.set("k", vec![("v".to_string(), 1)]);
        assert_eq!(cache.get("k").unwrap().len(), 1);
    }
}
