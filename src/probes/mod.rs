// ============================================
// Probe Catalog
// ============================================
//
// The standard catalog and the dispatch from a ProbeSpec to the code that
// executes it. Probes only observe; scoring happens afterwards.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{DoctorError, Result};
use crate::models::{
    FunctionalProbe, LoadMode, PayloadClass, PerfOperation, PerformanceProbe, ProbeKind,
    ProbeSelection, ProbeSpec, RawOutcome, SecurityProbe, Target,
};
use crate::transport::{Session, SessionFactory};

pub mod functional;
pub mod performance;
pub mod sampler;
pub mod security;

pub use sampler::{ResourceSampler, SysinfoSampler};

/// Timeout of the short connection-level security probes
const CREDENTIAL_PROBE_TIMEOUT_SECS: u64 = 5;

/// Iterations of the standard latency benchmark
const BENCHMARK_ITERATIONS: u32 = 20;

/// Extra time a load probe gets beyond its window to open and close sessions
const LOAD_TIMEOUT_HEADROOM_SECS: u64 = 30;

/// Everything a running probe may touch.
#[derive(Clone)]
pub struct ProbeContext {
    pub session: Arc<Session>,
    pub target: Arc<Target>,
    pub factory: Arc<dyn SessionFactory>,
    pub sampler: Arc<dyn ResourceSampler>,
    pub config: Arc<EngineConfig>,
    pub cancel: CancellationToken,
}

/// Execute one probe. Never fails: every failure mode is part of the outcome.
pub async fn execute(spec: Arc<ProbeSpec>, ctx: ProbeContext) -> RawOutcome {
    tracing::debug!(probe = %spec.name, category = %spec.category(), "Running probe");
    match &spec.kind {
        ProbeKind::Functional(probe) => functional::run(probe, &spec, &ctx).await,
        ProbeKind::Security(probe) => security::run(probe, &spec, &ctx).await,
        ProbeKind::Performance(probe) => performance::run(probe, &spec, &ctx).await,
    }
}

// ============================================
// Catalog
// ============================================

#[derive(Debug, Clone, Default)]
pub struct ProbeCatalog {
    specs: Vec<Arc<ProbeSpec>>,
}

impl ProbeCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Functional, security and performance probes with timeouts from `config`.
    pub fn standard(config: &EngineConfig) -> Self {
        let timeout = config.timeout();
        let threshold = config.latency_threshold();
        let short = Duration::from_secs(CREDENTIAL_PROBE_TIMEOUT_SECS).min(timeout);
        let functional = |name: &str, probe: FunctionalProbe| {
            ProbeSpec::new(name, timeout, ProbeKind::Functional(probe))
                .with_latency_threshold(threshold)
        };
        let security = |name: &str, probe: SecurityProbe, timeout: Duration| {
            ProbeSpec::new(name, timeout, ProbeKind::Security(probe))
                .with_latency_threshold(threshold)
        };

        let mut specs = vec![
            functional("connectivity", FunctionalProbe::Connectivity),
            functional("configuration_validation", FunctionalProbe::ConfigurationValidation),
            functional("ping", FunctionalProbe::Ping),
            functional("tool_discovery", FunctionalProbe::ToolDiscovery),
            functional(
                "tool_execution",
                FunctionalProbe::ToolExecution {
                    tool: None,
                    arguments: None,
                },
            ),
            functional("resource_discovery", FunctionalProbe::ResourceDiscovery),
            functional("resource_read", FunctionalProbe::ResourceRead { uri: None }),
            functional("prompt_discovery", FunctionalProbe::PromptDiscovery),
            functional("prompt_get", FunctionalProbe::PromptGet { prompt: None }),
            security("auth_no_credentials", SecurityProbe::NoCredentials, short),
            security("auth_invalid_credentials", SecurityProbe::InvalidCredentials, short),
            security("auth_expired_credentials", SecurityProbe::ExpiredCredentials, short),
            security("authz_privilege_escalation", SecurityProbe::PrivilegeEscalation, timeout),
            security("authz_unauthorized_resource", SecurityProbe::UnauthorizedResource, timeout),
        ];
        for class in PayloadClass::ALL {
            specs.push(security(class.probe_name(), SecurityProbe::Injection(class), timeout));
        }

        specs.push(
            ProbeSpec::new(
                "latency_benchmark",
                timeout * BENCHMARK_ITERATIONS,
                ProbeKind::Performance(PerformanceProbe {
                    operation: PerfOperation::ListTools,
                    mode: LoadMode::Benchmark {
                        iterations: BENCHMARK_ITERATIONS,
                    },
                }),
            )
            .with_latency_threshold(threshold),
        );
        let window = config.test_duration();
        specs.push(
            ProbeSpec::new(
                "load",
                window + Duration::from_secs(LOAD_TIMEOUT_HEADROOM_SECS),
                ProbeKind::Performance(PerformanceProbe {
                    operation: PerfOperation::ListTools,
                    mode: LoadMode::Load {
                        concurrency: config.concurrent_connections,
                        duration: window,
                    },
                }),
            )
            .with_latency_threshold(threshold),
        );

        Self {
            specs: specs.into_iter().map(Arc::new).collect(),
        }
    }

    /// Add a probe; names are unique.
    pub fn register(&mut self, spec: ProbeSpec) -> Result<()> {
        spec.validate()?;
        if self.get(&spec.name).is_some() {
            return Err(DoctorError::Validation(format!(
                "probe '{}' is already registered",
                spec.name
            )));
        }
        self.specs.push(Arc::new(spec));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProbeSpec>> {
        self.specs.iter().find(|s| s.name == name).cloned()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ProbeSpec>> {
        self.specs.iter()
    }

    /// Probes matching `selection`, in catalog order. Unknown names are rejected.
    pub fn select(&self, selection: &ProbeSelection) -> Result<Vec<Arc<ProbeSpec>>> {
        let known: HashSet<&str> = self.specs.iter().map(|s| s.name.as_str()).collect();
        if let Some(unknown) = selection.names.iter().find(|n| !known.contains(n.as_str())) {
            return Err(DoctorError::Validation(format!("unknown probe '{unknown}'")));
        }
        Ok(self
            .specs
            .iter()
            .filter(|spec| selection.includes(spec))
            .cloned()
            .collect())
    }
}

// ============================================
// MCP Content Helpers
// ============================================

/// Placeholder arguments satisfying the required properties of a JSON schema.
pub fn sample_arguments(schema: &Value) -> Value {
    let mut args = Map::new();
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let properties = schema.get("properties").and_then(Value::as_object);

    for name in required {
        let property = properties.and_then(|p| p.get(name));
        args.insert(name.to_string(), sample_value(property));
    }
    Value::Object(args)
}

fn sample_value(property: Option<&Value>) -> Value {
    let Some(property) = property else {
        return json!("test");
    };
    if let Some(first) = property
        .get("enum")
        .and_then(Value::as_array)
        .and_then(|e| e.first())
    {
        return first.clone();
    }
    if let Some(default) = property.get("default") {
        return default.clone();
    }
    match property.get("type").and_then(Value::as_str) {
        Some("integer") => json!(1),
        Some("number") => json!(1.0),
        Some("boolean") => json!(true),
        Some("array") => json!([]),
        Some("object") => json!({}),
        Some("null") => Value::Null,
        _ => json!("test"),
    }
}

/// Arguments with every string property (or a lone `input`) set to `payload`.
pub fn payload_arguments(schema: &Value, payload: &str) -> Value {
    let mut args = match sample_arguments(schema) {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let string_props: Vec<String> = schema
        .get("properties")
        .and_then(Value::as_object)
        .map(|props| {
            props
                .iter()
                .filter(|(_, p)| p.get("type").and_then(Value::as_str) == Some("string"))
                .filter(|(_, p)| p.get("enum").is_none())
                .map(|(name, _)| name.clone())
                .collect()
        })
        .unwrap_or_default();

    if string_props.is_empty() {
        args.insert("input".to_string(), json!(payload));
    } else {
        for name in string_props {
            args.insert(name, json!(payload));
        }
    }
    Value::Object(args)
}

/// Concatenated text of an MCP result (`content[].text`, `contents[].text`,
/// `messages[].content.text`), falling back to the raw JSON.
pub fn response_text(result: &Value) -> String {
    let mut parts = Vec::new();
    for key in ["content", "contents"] {
        if let Some(items) = result.get(key).and_then(Value::as_array) {
            parts.extend(
                items
                    .iter()
                    .filter_map(|item| item.get("text").and_then(Value::as_str))
                    .map(str::to_string),
            );
        }
    }
    if let Some(messages) = result.get("messages").and_then(Value::as_array) {
        parts.extend(
            messages
                .iter()
                .filter_map(|m| m.pointer("/content/text").and_then(Value::as_str))
                .map(str::to_string),
        );
    }
    if parts.is_empty() {
        result.to_string()
    } else {
        parts.join("\n")
    }
}

/// Whether a successful JSON-RPC result actually reports an error: `isError`,
/// an `error` content item, or text content that is a JSON object with `error`.
pub fn is_error_result(result: &Value) -> bool {
    if result.get("isError").and_then(Value::as_bool) == Some(true) {
        return true;
    }
    let Some(items) = result.get("content").and_then(Value::as_array) else {
        return false;
    };
    items.iter().any(|item| match item.get("type").and_then(Value::as_str) {
        Some("error") => true,
        Some("text") => item
            .get("text")
            .and_then(Value::as_str)
            .and_then(|text| serde_json::from_str::<Value>(text).ok())
            .is_some_and(|parsed| parsed.get("error").is_some()),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_catalog_is_valid_and_unique() {
        let catalog = ProbeCatalog::standard(&EngineConfig::default());
        assert!(catalog.iter().all(|spec| spec.validate().is_ok()));
        let names: HashSet<_> = catalog.iter().map(|s| s.name.clone()).collect();
        assert_eq!(names.len(), catalog.len());
        assert!(catalog.get("injection_sql").is_some());
        assert!(catalog.get("load").is_some());
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut catalog = ProbeCatalog::standard(&EngineConfig::default());
        let dup = ProbeSpec::new(
            "ping",
            Duration::from_secs(1),
            ProbeKind::Functional(FunctionalProbe::Ping),
        );
        assert!(matches!(catalog.register(dup), Err(DoctorError::Validation(_))));
    }

    #[test]
    fn test_select_unknown_name() {
        let catalog = ProbeCatalog::standard(&EngineConfig::default());
        let err = catalog
            .select(&ProbeSelection::names(&["does_not_exist"]))
            .unwrap_err();
        assert!(err.to_string().contains("does_not_exist"));
    }

    #[test]
    fn test_sample_arguments_cover_required() {
        let schema = json!({
            "type": "object",
            "properties": {
                "city": {"type": "string"},
                "days": {"type": "integer"},
                "units": {"type": "string", "enum": ["metric", "imperial"]},
                "verbose": {"type": "boolean"}
            },
            "required": ["city", "days", "units"]
        });
        assert_eq!(
            sample_arguments(&schema),
            json!({"city": "test", "days": 1, "units": "metric"})
        );
    }

    #[test]
    fn test_payload_arguments_fill_strings() {
        let schema = json!({
            "properties": {"query": {"type": "string"}, "limit": {"type": "integer"}},
            "required": ["query", "limit"]
        });
        assert_eq!(
            payload_arguments(&schema, "' OR 1=1"),
            json!({"query": "' OR 1=1", "limit": 1})
        );
        assert_eq!(
            payload_arguments(&json!({"type": "object"}), "x"),
            json!({"input": "x"})
        );
    }

    #[test]
    fn test_error_result_detection() {
        assert!(is_error_result(&json!({"isError": true, "content": []})));
        assert!(is_error_result(
            &json!({"content": [{"type": "text", "text": "{\"error\": \"bad\"}"}]})
        ));
        assert!(is_error_result(&json!({"content": [{"type": "error"}]})));
        assert!(!is_error_result(
            &json!({"content": [{"type": "text", "text": "sunny"}]})
        ));
    }

    #[test]
    fn test_response_text_joins_content() {
        let result = json!({"content": [
            {"type": "text", "text": "a"},
            {"type": "image", "data": "..."},
            {"type": "text", "text": "b"}
        ]});
        assert_eq!(response_text(&result), "a\nb");
    }
}
