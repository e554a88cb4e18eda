// Functional probes: handshake, discovery and invocation of tools, resources and prompts

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::time::Instant;

use super::{ProbeContext, is_error_result, response_text, sample_arguments};
use crate::models::{FunctionalProbe, ProbeSpec, RawOutcome, Target, TargetTransport, Verdict};
use crate::utils::truncate;

pub async fn run(probe: &FunctionalProbe, spec: &ProbeSpec, ctx: &ProbeContext) -> RawOutcome {
    let caps = ctx.session.capabilities().clone();
    match probe {
        FunctionalProbe::Connectivity => connectivity(ctx),
        FunctionalProbe::Ping => ping(spec, ctx).await,
        FunctionalProbe::ToolDiscovery => {
            list_probe(spec, ctx, caps.tools, "tools/list", "tools", |tool| {
                tool.get("name").is_some_and(Value::is_string)
                    && tool.get("inputSchema").is_some_and(Value::is_object)
            })
            .await
        }
        FunctionalProbe::ResourceDiscovery => {
            list_probe(spec, ctx, caps.resources, "resources/list", "resources", |resource| {
                resource.get("uri").is_some_and(Value::is_string)
            })
            .await
        }
        FunctionalProbe::PromptDiscovery => {
            list_probe(spec, ctx, caps.prompts, "prompts/list", "prompts", |prompt| {
                prompt.get("name").is_some_and(Value::is_string)
            })
            .await
        }
        FunctionalProbe::ToolExecution { tool, arguments } => {
            tool_execution(spec, ctx, tool.as_deref(), arguments.as_ref()).await
        }
        FunctionalProbe::ResourceRead { uri } => resource_read(spec, ctx, uri.as_deref()).await,
        FunctionalProbe::PromptGet { prompt } => prompt_get(spec, ctx, prompt.as_deref()).await,
        FunctionalProbe::ConfigurationValidation => configuration_validation(&ctx.target),
    }
}

/// The handshake already happened; grade what it advertised.
fn connectivity(ctx: &ProbeContext) -> RawOutcome {
    let caps = ctx.session.capabilities();
    let latency = ctx.session.handshake_latency();
    let verdict = match (&caps.protocol_version, &caps.server_name) {
        (Some(_), Some(_)) => Verdict::Exact,
        (Some(_), None) => Verdict::Partial,
        (None, _) => Verdict::Mismatch,
    };
    let mut outcome = RawOutcome::success(latency, caps.raw.clone())
        .with_verdict(verdict)
        .with_note(format!(
            "protocol {} from {} {}",
            caps.protocol_version.as_deref().unwrap_or("unknown"),
            caps.server_name.as_deref().unwrap_or("unnamed server"),
            caps.server_version.as_deref().unwrap_or("")
        ));
    if verdict == Verdict::Mismatch {
        outcome.error_text = Some("protocol error: initialize result lacks protocolVersion".into());
    }
    outcome
}

async fn ping(spec: &ProbeSpec, ctx: &ProbeContext) -> RawOutcome {
    let outcome = ctx.session.invoke("ping", None, spec.timeout).await;
    let verdict = match &outcome.payload {
        _ if !outcome.success => Verdict::Mismatch,
        Some(Value::Object(_)) => Verdict::Exact,
        _ => Verdict::Partial,
    };
    outcome.with_verdict(verdict)
}

async fn list_probe(
    spec: &ProbeSpec,
    ctx: &ProbeContext,
    advertised: bool,
    method: &str,
    field: &str,
    well_formed: impl Fn(&Value) -> bool,
) -> RawOutcome {
    if !advertised {
        return RawOutcome::not_applicable(format!("server does not advertise {field}"));
    }
    let mut outcome = ctx.session.invoke(method, None, spec.timeout).await;
    if !outcome.success {
        return outcome.with_verdict(Verdict::Mismatch);
    }

    let items = outcome
        .payload
        .as_ref()
        .and_then(|p| p.get(field))
        .and_then(Value::as_array)
        .cloned();
    match items {
        None => {
            outcome.error_text = Some(format!("protocol error: {method} result has no '{field}' array"));
            outcome.with_verdict(Verdict::Mismatch)
        }
        Some(items) => {
            let malformed = items.iter().filter(|item| !well_formed(item)).count();
            outcome
                .sub_metrics
                .insert(format!("{field}_listed"), items.len() as f64);
            let verdict = if malformed == 0 {
                Verdict::Exact
            } else {
                outcome.error_text = Some(format!(
                    "protocol error: {malformed} of {} {field} entries are malformed",
                    items.len()
                ));
                Verdict::Partial
            };
            outcome
                .with_verdict(verdict)
                .with_note(format!("{} {field} listed", items.len()))
        }
    }
}

async fn tool_execution(
    spec: &ProbeSpec,
    ctx: &ProbeContext,
    tool: Option<&str>,
    arguments: Option<&Value>,
) -> RawOutcome {
    if !ctx.session.capabilities().tools {
        return RawOutcome::not_applicable("server does not advertise tools");
    }
    let discovery = ctx.session.discovery();
    let selected = match tool {
        Some(name) => match discovery.tool(name) {
            Some(found) => found.clone(),
            None => {
                return RawOutcome::rejected(
                    Duration::ZERO,
                    format!("tool execution failed: '{name}' is not advertised by the server"),
                    None,
                );
            }
        },
        None => match discovery.tools.first() {
            Some(first) => first.clone(),
            None => return RawOutcome::not_applicable("server lists no tools"),
        },
    };

    let args = arguments
        .cloned()
        .unwrap_or_else(|| sample_arguments(&selected.input_schema));
    let params = json!({ "name": selected.name, "arguments": args });
    let mut outcome = ctx.session.invoke("tools/call", Some(params), spec.timeout).await;
    if !outcome.success {
        outcome.error_text = outcome
            .error_text
            .map(|e| format!("tool execution failed for '{}': {}", selected.name, e));
        return outcome.with_verdict(Verdict::Mismatch);
    }

    let payload = outcome.payload.clone().unwrap_or(Value::Null);
    let has_content = payload.get("content").is_some_and(Value::is_array);
    let verdict = if !has_content {
        outcome.error_text = Some(format!(
            "protocol error: tools/call result for '{}' has no content array",
            selected.name
        ));
        Verdict::Mismatch
    } else if is_error_result(&payload) {
        outcome.error_text = Some(format!(
            "tool '{}' reported an error: {}",
            selected.name,
            truncate(&response_text(&payload), 200)
        ));
        Verdict::Partial
    } else {
        Verdict::Exact
    };
    outcome
        .with_verdict(verdict)
        .with_note(format!("called '{}'", selected.name))
}

async fn resource_read(spec: &ProbeSpec, ctx: &ProbeContext, uri: Option<&str>) -> RawOutcome {
    if !ctx.session.capabilities().resources {
        return RawOutcome::not_applicable("server does not advertise resources");
    }
    let uri = match uri {
        Some(uri) => uri.to_string(),
        None => match ctx.session.discovery().resources.first() {
            Some(resource) => resource.uri.clone(),
            None => return RawOutcome::not_applicable("server lists no resources"),
        },
    };

    let mut outcome = ctx
        .session
        .invoke("resources/read", Some(json!({ "uri": uri })), spec.timeout)
        .await;
    if !outcome.success {
        outcome.error_text = outcome
            .error_text
            .map(|e| format!("resource access failed for '{uri}': {e}"));
        return outcome.with_verdict(Verdict::Mismatch);
    }

    let contents = outcome
        .payload
        .as_ref()
        .and_then(|p| p.get("contents"))
        .and_then(Value::as_array)
        .cloned();
    let verdict = match contents {
        None => {
            outcome.error_text = Some(format!(
                "protocol error: resources/read result for '{uri}' has no contents array"
            ));
            Verdict::Mismatch
        }
        Some(items)
            if !items.is_empty()
                && items.iter().all(|item| {
                    item.get("uri").is_some_and(Value::is_string)
                        && (item.get("text").is_some() || item.get("blob").is_some())
                }) =>
        {
            Verdict::Exact
        }
        Some(_) => {
            outcome.error_text = Some(format!(
                "protocol error: resource contents for '{uri}' are empty or malformed"
            ));
            Verdict::Partial
        }
    };
    outcome.with_verdict(verdict).with_note(format!("read '{uri}'"))
}

async fn prompt_get(spec: &ProbeSpec, ctx: &ProbeContext, prompt: Option<&str>) -> RawOutcome {
    if !ctx.session.capabilities().prompts {
        return RawOutcome::not_applicable("server does not advertise prompts");
    }
    let discovery = ctx.session.discovery();
    let selected = match prompt {
        Some(name) => discovery.prompts.iter().find(|p| p.name == name).cloned(),
        None => discovery.prompts.first().cloned(),
    };
    let Some(selected) = selected else {
        return RawOutcome::not_applicable("no matching prompt listed");
    };

    let arguments: Map<String, Value> = selected
        .required_arguments
        .iter()
        .map(|name| (name.clone(), json!("sample")))
        .collect();
    let params = json!({ "name": selected.name, "arguments": arguments });
    let mut outcome = ctx.session.invoke("prompts/get", Some(params), spec.timeout).await;
    if !outcome.success {
        return outcome.with_verdict(Verdict::Mismatch);
    }

    let messages = outcome
        .payload
        .as_ref()
        .and_then(|p| p.get("messages"))
        .and_then(Value::as_array)
        .cloned();
    let verdict = match messages {
        None => {
            outcome.error_text = Some(format!(
                "protocol error: prompts/get result for '{}' has no messages array",
                selected.name
            ));
            Verdict::Mismatch
        }
        Some(items)
            if items
                .iter()
                .all(|m| m.get("role").is_some() && m.get("content").is_some()) =>
        {
            Verdict::Exact
        }
        Some(_) => Verdict::Partial,
    };
    outcome
        .with_verdict(verdict)
        .with_note(format!("rendered '{}'", selected.name))
}

/// Static checks on the target descriptor; no traffic.
fn configuration_validation(target: &Target) -> RawOutcome {
    let started = Instant::now();
    let mut problems: Vec<String> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();

    match &target.transport {
        TargetTransport::Stdio(stdio) => {
            if stdio.command.trim().is_empty() {
                problems.push("command is empty".into());
            } else if !command_resolves(&stdio.command, stdio.cwd.as_deref()) {
                problems.push(format!("command '{}' not found", stdio.command));
            }
            if let Some(cwd) = &stdio.cwd {
                if !cwd.is_dir() {
                    problems.push(format!("working directory {} does not exist", cwd.display()));
                }
            }
            if stdio.args.iter().any(|arg| arg.trim().is_empty()) {
                warnings.push("arguments contain an empty string".into());
            }
            for (key, value) in &stdio.env {
                if value.is_empty() {
                    warnings.push(format!("environment variable {key} is empty"));
                }
            }
        }
        TargetTransport::Http(http) => match reqwest::Url::parse(&http.url) {
            Err(e) => problems.push(format!("invalid URL '{}': {}", http.url, e)),
            Ok(url) => {
                if !matches!(url.scheme(), "http" | "https") {
                    problems.push(format!("unsupported URL scheme '{}'", url.scheme()));
                }
                let local = matches!(url.host_str(), Some("localhost" | "127.0.0.1" | "[::1]"));
                if url.scheme() == "http" && !local {
                    warnings.push("plaintext HTTP to a remote host".into());
                }
            }
        },
    }

    let elapsed = started.elapsed();
    let summary = json!({ "problems": problems, "warnings": warnings });
    if !problems.is_empty() {
        let mut outcome = RawOutcome::rejected(
            elapsed,
            format!("configuration error: {}", problems.join("; ")),
            Some(summary),
        );
        outcome.verdict = Verdict::Mismatch;
        return outcome;
    }
    let verdict = if warnings.is_empty() {
        Verdict::Exact
    } else {
        Verdict::Partial
    };
    let mut outcome = RawOutcome::success(elapsed, summary).with_verdict(verdict);
    if !warnings.is_empty() {
        outcome.error_text = Some(format!("configuration warning: {}", warnings.join("; ")));
    }
    outcome
}

fn command_resolves(command: &str, cwd: Option<&Path>) -> bool {
    let path = Path::new(command);
    if path.components().count() > 1 || path.is_absolute() {
        let resolved: PathBuf = match cwd {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        };
        return resolved.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(command).is_file()))
        .unwrap_or(false)
}
