// Security probes: credential handling, authorization boundaries, hostile input

use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde_json::{Value, json};
use tokio::time::Instant;

use super::{ProbeContext, is_error_result, payload_arguments, response_text, sample_arguments};
use crate::error::DoctorError;
use crate::models::{
    CredentialMode, Fault, PayloadClass, ProbeSpec, RawOutcome, RiskLevel, SecurityFinding,
    SecurityProbe, Verdict, VulnerabilityClass,
};
use crate::transport::Session;
use crate::utils::truncate;

/// Tools tried per injection probe
const MAX_TOOLS_PER_PROBE: usize = 5;

/// Privileged tool names a server should refuse when it never advertised them
const HIDDEN_TOOLS: [&str; 7] = ["admin", "exec", "shell", "sudo", "system", "debug", "eval"];

/// Keywords that flag an advertised tool as privileged
const PRIVILEGED_KEYWORDS: [&str; 7] = ["exec", "shell", "command", "system", "admin", "root", "sudo"];

const PROTECTED_URIS: [&str; 3] = [
    "file:///etc/passwd",
    "file:///etc/shadow",
    "file:///../../../../../../etc/passwd",
];

const MIN_CALL_TIMEOUT: Duration = Duration::from_secs(1);

static PASSWD_CONTENT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"root:[^:\n]*:0:0:").ok());
static ID_OUTPUT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"uid=\d+\([^)]*\)\s+gid=\d+").ok());
static SQL_ERROR: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(you have an error in your sql syntax|sqlite3?\.OperationalError|SQLITE_ERROR|syntax error at or near|unterminated quoted string|ORA-\d{5}|pg_query\(\)|mysql_fetch)",
    )
    .ok()
});

pub async fn run(probe: &SecurityProbe, spec: &ProbeSpec, ctx: &ProbeContext) -> RawOutcome {
    match probe {
        SecurityProbe::NoCredentials => credential_probe(CredentialMode::Missing, spec, ctx).await,
        SecurityProbe::InvalidCredentials => {
            credential_probe(CredentialMode::Invalid, spec, ctx).await
        }
        SecurityProbe::ExpiredCredentials => {
            credential_probe(CredentialMode::Expired, spec, ctx).await
        }
        SecurityProbe::PrivilegeEscalation => privilege_escalation(spec, ctx).await,
        SecurityProbe::UnauthorizedResource => unauthorized_resource(spec, ctx).await,
        SecurityProbe::Injection(class) => injection(*class, spec, ctx).await,
    }
}

// ============================================
// Payload Catalog
// ============================================

pub fn payload(class: PayloadClass) -> String {
    match class {
        PayloadClass::Sql => "'; DROP TABLE users; --".to_string(),
        PayloadClass::Command => "test; id #".to_string(),
        PayloadClass::PathTraversal => "../../../../../../etc/passwd".to_string(),
        PayloadClass::Markup => "<script>alert('mcp-doctor')</script>".to_string(),
        PayloadClass::NullByte => "test\u{0}.txt".to_string(),
        PayloadClass::UnicodeBypass => "admin\u{202e}txt.exe".to_string(),
        PayloadClass::Oversized => "A".repeat(10_000),
        PayloadClass::XmlEntity => concat!(
            r#"<?xml version="1.0"?><!DOCTYPE lolz [<!ENTITY lol "lol">"#,
            r#"<!ENTITY lol2 "&lol;&lol;&lol;&lol;&lol;&lol;&lol;&lol;&lol;&lol;">]>"#,
            r#"<lolz>&lol2;</lolz>"#
        )
        .to_string(),
    }
}

fn vulnerability_class(class: PayloadClass) -> VulnerabilityClass {
    match class {
        PayloadClass::Sql => VulnerabilityClass::SqlInjection,
        PayloadClass::Command => VulnerabilityClass::CommandInjection,
        PayloadClass::PathTraversal => VulnerabilityClass::PathTraversal,
        PayloadClass::Markup => VulnerabilityClass::MarkupInjection,
        PayloadClass::NullByte => VulnerabilityClass::NullByteInjection,
        PayloadClass::UnicodeBypass => VulnerabilityClass::UnicodeBypass,
        PayloadClass::Oversized => VulnerabilityClass::OversizedInput,
        PayloadClass::XmlEntity => VulnerabilityClass::XmlEntityExpansion,
    }
}

/// Risk when the raw payload comes back unsanitized. `None` when echoing is harmless.
fn reflection_risk(class: PayloadClass) -> Option<RiskLevel> {
    match class {
        PayloadClass::Sql | PayloadClass::Command | PayloadClass::PathTraversal => {
            Some(RiskLevel::High)
        }
        PayloadClass::Markup | PayloadClass::NullByte => Some(RiskLevel::Medium),
        PayloadClass::UnicodeBypass | PayloadClass::XmlEntity => Some(RiskLevel::Low),
        PayloadClass::Oversized => None,
    }
}

/// Evidence in a response that the payload was acted upon, not just echoed.
fn execution_evidence(class: PayloadClass, text: &str) -> Option<String> {
    let matched = |pattern: &LazyLock<Option<Regex>>| {
        pattern
            .as_ref()
            .and_then(|re| re.find(text))
            .map(|m| m.as_str().to_string())
    };
    match class {
        PayloadClass::Sql => matched(&SQL_ERROR),
        PayloadClass::Command => matched(&ID_OUTPUT),
        PayloadClass::PathTraversal => matched(&PASSWD_CONTENT),
        PayloadClass::XmlEntity => text
            .contains("lollollollollollollollollollol")
            .then(|| "entities expanded in response".to_string()),
        _ => None,
    }
}

// ============================================
// Response Assessment
// ============================================

#[derive(Debug, Clone, PartialEq)]
enum Assessment {
    Rejected,
    Accepted,
    Reflected(String),
    Executed(String),
    Crashed(String),
    TimedOut,
}

impl Assessment {
    fn rank(&self) -> u8 {
        match self {
            Assessment::Executed(_) => 5,
            Assessment::Reflected(_) => 4,
            Assessment::Crashed(_) => 3,
            Assessment::TimedOut => 2,
            Assessment::Accepted => 1,
            Assessment::Rejected => 0,
        }
    }
}

fn assess(outcome: &RawOutcome, class: PayloadClass, payload: &str) -> Assessment {
    match outcome.fault {
        Some(Fault::Timeout) | Some(Fault::Cancelled) => return Assessment::TimedOut,
        Some(_) => {
            return Assessment::Crashed(outcome.error_text.clone().unwrap_or_default());
        }
        None => {}
    }
    if !outcome.success {
        return Assessment::Rejected;
    }
    let result = outcome.payload.clone().unwrap_or(Value::Null);
    if is_error_result(&result) {
        return Assessment::Rejected;
    }
    let text = response_text(&result);
    if let Some(evidence) = execution_evidence(class, &text) {
        return Assessment::Executed(evidence);
    }
    if reflection_risk(class).is_some() && text.to_lowercase().contains(&payload.to_lowercase()) {
        return Assessment::Reflected(truncate(&text, 160));
    }
    Assessment::Accepted
}

/// One tool's assessment with where it came from.
struct Observation {
    subject: String,
    assessment: Assessment,
    latency: Duration,
    stderr: Vec<String>,
}

fn per_call_timeout(total: Duration, calls: usize) -> Duration {
    let calls = u32::try_from(calls.max(1)).unwrap_or(u32::MAX);
    (total / calls).max(MIN_CALL_TIMEOUT).min(total)
}

fn average_latency(observations: &[Observation]) -> Duration {
    if observations.is_empty() {
        return Duration::ZERO;
    }
    let total: Duration = observations.iter().map(|o| o.latency).sum();
    total / observations.len() as u32
}

/// Fold observations into an outcome; `finding_for` turns the worst one into a finding.
fn summarize(
    observations: Vec<Observation>,
    started: Instant,
    finding_for: impl Fn(&Observation) -> Option<(SecurityFinding, String)>,
) -> RawOutcome {
    let elapsed = started.elapsed();
    let latency = average_latency(&observations);
    let rejected = observations
        .iter()
        .filter(|o| o.assessment == Assessment::Rejected)
        .count();
    let accepted = observations
        .iter()
        .filter(|o| o.assessment == Assessment::Accepted)
        .count();
    let stderr: Vec<String> = observations.iter().flat_map(|o| o.stderr.clone()).collect();
    let total = observations.len();
    let worst = observations.iter().max_by_key(|o| o.assessment.rank());

    let mut outcome = match worst.map(|o| (o, &o.assessment)) {
        Some((obs, Assessment::Executed(_) | Assessment::Reflected(_))) => match finding_for(obs) {
            Some((finding, message)) => {
                let mut outcome = RawOutcome::success(elapsed, json!({ "evidence": finding.evidence }))
                    .with_verdict(Verdict::Mismatch);
                outcome.error_text = Some(message);
                outcome.finding = Some(finding);
                outcome
            }
            None => RawOutcome::success(elapsed, Value::Null).with_verdict(Verdict::Exact),
        },
        Some((obs, Assessment::Crashed(reason))) => RawOutcome::fault(
            Fault::Crash,
            elapsed,
            format!("{} crashed the server: {}", obs.subject, reason),
        ),
        Some((_, Assessment::TimedOut)) if rejected + accepted == 0 => RawOutcome::fault(
            Fault::Timeout,
            elapsed,
            format!("operation timed out on all {total} attempts"),
        ),
        _ => RawOutcome::success(elapsed, Value::Null).with_verdict(Verdict::Exact),
    };
    outcome.latency = latency;
    outcome.stderr = stderr;
    outcome.sub_metrics.insert("attempts".into(), total as f64);
    outcome.sub_metrics.insert("rejected".into(), rejected as f64);
    outcome.sub_metrics.insert("accepted".into(), accepted as f64);
    if outcome.note.is_none() {
        outcome.note = Some(format!("{rejected} rejected, {accepted} accepted of {total}"));
    }
    outcome
}

async fn observe(
    session: &Session,
    subject: String,
    method: &str,
    params: Value,
    timeout: Duration,
    assess_with: impl Fn(&RawOutcome) -> Assessment,
) -> Observation {
    let outcome = session.invoke(method, Some(params), timeout).await;
    Observation {
        subject,
        assessment: assess_with(&outcome),
        latency: outcome.latency,
        stderr: outcome.stderr,
    }
}

// ============================================
// Injection Probes
// ============================================

async fn injection(class: PayloadClass, spec: &ProbeSpec, ctx: &ProbeContext) -> RawOutcome {
    if !ctx.session.capabilities().tools {
        return RawOutcome::not_applicable("server does not advertise tools");
    }
    let tools: Vec<_> = ctx
        .session
        .discovery()
        .tools
        .into_iter()
        .take(MAX_TOOLS_PER_PROBE)
        .collect();
    if tools.is_empty() {
        return RawOutcome::not_applicable("server lists no tools");
    }

    let payload = payload(class);
    let timeout = per_call_timeout(spec.timeout, tools.len());
    let started = Instant::now();
    let mut observations = Vec::with_capacity(tools.len());
    for tool in &tools {
        if ctx.cancel.is_cancelled() {
            return RawOutcome::cancelled(started.elapsed());
        }
        let params = json!({
            "name": tool.name,
            "arguments": payload_arguments(&tool.input_schema, &payload),
        });
        let observation = observe(
            &ctx.session,
            format!("tool '{}'", tool.name),
            "tools/call",
            params,
            timeout,
            |outcome| assess(outcome, class, &payload),
        )
        .await;
        let crashed = matches!(observation.assessment, Assessment::Crashed(_));
        observations.push(observation);
        if crashed {
            break;
        }
    }

    summarize(observations, started, |obs| {
        let (risk, verb) = match &obs.assessment {
            Assessment::Executed(evidence) => (
                match class {
                    PayloadClass::XmlEntity => RiskLevel::High,
                    _ => RiskLevel::Critical,
                },
                format!("executed the payload ({evidence})"),
            ),
            Assessment::Reflected(_) => (reflection_risk(class)?, "reflected the payload unsanitized".into()),
            _ => return None,
        };
        let evidence = match &obs.assessment {
            Assessment::Executed(e) | Assessment::Reflected(e) => e.clone(),
            _ => String::new(),
        };
        Some((
            SecurityFinding::new(vulnerability_class(class), risk, evidence),
            format!("security vulnerability: {} {}", obs.subject, verb),
        ))
    })
}

// ============================================
// Credential Probes
// ============================================

async fn credential_probe(mode: CredentialMode, spec: &ProbeSpec, ctx: &ProbeContext) -> RawOutcome {
    if ctx.target.credential_keys().is_empty() {
        return RawOutcome::not_applicable("target declares no credentials");
    }
    let (class, risk, label) = match mode {
        CredentialMode::Missing => (
            VulnerabilityClass::MissingAuthentication,
            RiskLevel::Critical,
            "without credentials",
        ),
        CredentialMode::Invalid => (
            VulnerabilityClass::InvalidCredentialAcceptance,
            RiskLevel::High,
            "with invalid credentials",
        ),
        CredentialMode::Expired => (
            VulnerabilityClass::ExpiredCredentialAcceptance,
            RiskLevel::High,
            "with expired credentials",
        ),
    };

    let degraded = ctx.target.with_degraded_credentials(mode);
    let started = Instant::now();
    let session = match ctx.factory.open(&degraded, spec.timeout).await {
        Ok(session) => session,
        Err(DoctorError::Connection { message, .. }) => {
            return RawOutcome::rejected(started.elapsed(), message, None)
                .with_verdict(Verdict::Exact)
                .with_note(format!("connection refused {label}"));
        }
        Err(e) => {
            return RawOutcome::rejected(started.elapsed(), e.to_string(), None)
                .with_verdict(Verdict::Exact)
                .with_note(format!("session refused {label}"));
        }
    };

    let remaining = spec.timeout.saturating_sub(started.elapsed()).max(MIN_CALL_TIMEOUT);
    let discovery = session.discovery();
    let attempt = if let Some(tool) = discovery.tools.first() {
        let params = json!({ "name": tool.name, "arguments": sample_arguments(&tool.input_schema) });
        Some((format!("tool '{}'", tool.name), "tools/call", params))
    } else {
        discovery.resources.first().map(|resource| {
            (
                format!("resource '{}'", resource.uri),
                "resources/read",
                json!({ "uri": resource.uri }),
            )
        })
    };

    let Some((subject, method, params)) = attempt else {
        session.close().await;
        return RawOutcome::success(started.elapsed(), Value::Null)
            .with_verdict(Verdict::Exact)
            .with_note(format!("handshake accepted {label}; no protected operation exposed"));
    };

    let outcome = session.invoke(method, Some(params), remaining).await;
    session.close().await;

    let mut result = match outcome.fault {
        Some(Fault::Timeout) | Some(Fault::Cancelled) => {
            RawOutcome::fault(Fault::Timeout, started.elapsed(), format!("{subject} did not answer {label}"))
        }
        Some(fault) => RawOutcome::fault(
            fault,
            started.elapsed(),
            format!(
                "{subject} failed ungracefully {label}: {}",
                outcome.error_text.clone().unwrap_or_default()
            ),
        ),
        None if !outcome.success
            || outcome.payload.as_ref().is_some_and(is_error_result) =>
        {
            RawOutcome::rejected(
                started.elapsed(),
                outcome.error_text.clone().unwrap_or_else(|| "rejected".into()),
                None,
            )
            .with_verdict(Verdict::Exact)
            .with_note(format!("{subject} refused {label}"))
        }
        None => {
            let evidence = outcome
                .payload
                .as_ref()
                .map(|p| truncate(&response_text(p), 160))
                .unwrap_or_default();
            let mut accepted = RawOutcome::success(started.elapsed(), Value::Null)
                .with_verdict(Verdict::Mismatch);
            accepted.error_text = Some(format!(
                "authentication bypass: {subject} returned data {label}"
            ));
            accepted.finding = Some(SecurityFinding::new(class, risk, evidence));
            accepted
        }
    };
    result.latency = outcome.latency;
    result.stderr = outcome.stderr;
    result
}

// ============================================
// Authorization Probes
// ============================================

async fn privilege_escalation(spec: &ProbeSpec, ctx: &ProbeContext) -> RawOutcome {
    if !ctx.session.capabilities().tools {
        return RawOutcome::not_applicable("server does not advertise tools");
    }
    let advertised: HashSet<String> = ctx
        .session
        .discovery()
        .tools
        .into_iter()
        .map(|t| t.name)
        .collect();
    let privileged_advertised = advertised
        .iter()
        .filter(|name| {
            let lower = name.to_lowercase();
            PRIVILEGED_KEYWORDS.iter().any(|k| lower.contains(k))
        })
        .count();
    let candidates: Vec<&str> = HIDDEN_TOOLS
        .iter()
        .copied()
        .filter(|name| !advertised.contains(*name))
        .collect();

    let timeout = per_call_timeout(spec.timeout, candidates.len());
    let started = Instant::now();
    let mut observations = Vec::with_capacity(candidates.len());
    for name in candidates {
        if ctx.cancel.is_cancelled() {
            return RawOutcome::cancelled(started.elapsed());
        }
        let params = json!({ "name": name, "arguments": { "command": "id", "user": "root" } });
        let observation = observe(
            &ctx.session,
            format!("unadvertised tool '{name}'"),
            "tools/call",
            params,
            timeout,
            |outcome| match outcome.fault {
                Some(Fault::Timeout) | Some(Fault::Cancelled) => Assessment::TimedOut,
                Some(_) => Assessment::Crashed(outcome.error_text.clone().unwrap_or_default()),
                None if !outcome.success => Assessment::Rejected,
                None => match &outcome.payload {
                    Some(result) if is_error_result(result) => Assessment::Rejected,
                    Some(result) => Assessment::Executed(truncate(&response_text(result), 160)),
                    None => Assessment::Rejected,
                },
            },
        )
        .await;
        let crashed = matches!(observation.assessment, Assessment::Crashed(_));
        observations.push(observation);
        if crashed {
            break;
        }
    }

    let mut outcome = summarize(observations, started, |obs| match &obs.assessment {
        Assessment::Executed(evidence) => Some((
            SecurityFinding::new(
                VulnerabilityClass::PrivilegeEscalation,
                RiskLevel::High,
                evidence.clone(),
            ),
            format!("privilege escalation: {} executed", obs.subject),
        )),
        _ => None,
    });
    outcome
        .sub_metrics
        .insert("privileged_tools_advertised".into(), privileged_advertised as f64);
    outcome
}

async fn unauthorized_resource(spec: &ProbeSpec, ctx: &ProbeContext) -> RawOutcome {
    if !ctx.session.capabilities().resources {
        return RawOutcome::not_applicable("server does not advertise resources");
    }
    let discovery = ctx.session.discovery();
    let advertised: HashSet<&str> = discovery.resources.iter().map(|r| r.uri.as_str()).collect();
    let mut uris: Vec<String> = PROTECTED_URIS
        .iter()
        .filter(|uri| !advertised.contains(*uri))
        .map(|uri| uri.to_string())
        .collect();
    if let Some(listed) = discovery
        .resources
        .iter()
        .find(|r| r.uri.starts_with("file://"))
    {
        uris.push(format!(
            "{}/../../../../../../etc/passwd",
            listed.uri.trim_end_matches('/')
        ));
    }

    let timeout = per_call_timeout(spec.timeout, uris.len());
    let started = Instant::now();
    let mut observations = Vec::with_capacity(uris.len());
    for uri in uris {
        if ctx.cancel.is_cancelled() {
            return RawOutcome::cancelled(started.elapsed());
        }
        let observation = observe(
            &ctx.session,
            format!("resource '{uri}'"),
            "resources/read",
            json!({ "uri": uri }),
            timeout,
            |outcome| match outcome.fault {
                Some(Fault::Timeout) | Some(Fault::Cancelled) => Assessment::TimedOut,
                Some(_) => Assessment::Crashed(outcome.error_text.clone().unwrap_or_default()),
                None if !outcome.success => Assessment::Rejected,
                None => {
                    let result = outcome.payload.clone().unwrap_or(Value::Null);
                    let has_data = result
                        .get("contents")
                        .and_then(Value::as_array)
                        .is_some_and(|items| {
                            items.iter().any(|item| {
                                item.get("text").and_then(Value::as_str).is_some_and(|t| !t.is_empty())
                                    || item.get("blob").is_some()
                            })
                        });
                    if is_error_result(&result) || !has_data {
                        return Assessment::Rejected;
                    }
                    let text = response_text(&result);
                    match execution_evidence(PayloadClass::PathTraversal, &text) {
                        Some(evidence) => Assessment::Executed(evidence),
                        None => Assessment::Reflected(truncate(&text, 160)),
                    }
                }
            },
        )
        .await;
        observations.push(observation);
    }

    summarize(observations, started, |obs| {
        let (risk, evidence) = match &obs.assessment {
            Assessment::Executed(e) => (RiskLevel::Critical, e.clone()),
            Assessment::Reflected(e) => (RiskLevel::High, e.clone()),
            _ => return None,
        };
        Some((
            SecurityFinding::new(VulnerabilityClass::UnauthorizedResourceAccess, risk, evidence),
            format!("unauthorized access: {} returned data", obs.subject),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success(result: Value) -> RawOutcome {
        RawOutcome::success(Duration::from_millis(5), result)
    }

    fn text(body: &str) -> Value {
        json!({"content": [{"type": "text", "text": body}]})
    }

    #[test]
    fn test_reflected_sql_payload() {
        let payload = payload(PayloadClass::Sql);
        let outcome = success(text(&format!("Searched for {payload}")));
        assert!(matches!(
            assess(&outcome, PayloadClass::Sql, &payload),
            Assessment::Reflected(_)
        ));
    }

    #[test]
    fn test_validation_error_is_rejection() {
        let payload = payload(PayloadClass::Sql);
        let outcome = RawOutcome::rejected(Duration::from_millis(5), "invalid params (code -32602)", None);
        assert_eq!(assess(&outcome, PayloadClass::Sql, &payload), Assessment::Rejected);

        let tool_error = success(json!({"isError": true, "content": [{"type": "text", "text": payload}]}));
        assert_eq!(assess(&tool_error, PayloadClass::Sql, &payload), Assessment::Rejected);
    }

    #[test]
    fn test_command_execution_evidence() {
        let payload = payload(PayloadClass::Command);
        let outcome = success(text("uid=1000(app) gid=1000(app) groups=1000(app)"));
        assert!(matches!(
            assess(&outcome, PayloadClass::Command, &payload),
            Assessment::Executed(_)
        ));
    }

    #[test]
    fn test_oversized_echo_is_not_a_finding() {
        let payload = payload(PayloadClass::Oversized);
        let outcome = success(text(&payload));
        assert_eq!(assess(&outcome, PayloadClass::Oversized, &payload), Assessment::Accepted);
    }

    #[test]
    fn test_crash_assessment() {
        let outcome = RawOutcome::fault(Fault::Crash, Duration::ZERO, "closed its stdout");
        assert!(matches!(
            assess(&outcome, PayloadClass::Markup, "x"),
            Assessment::Crashed(_)
        ));
    }

    #[test]
    fn test_summarize_prefers_worst_observation() {
        let observations = vec![
            Observation {
                subject: "tool 'a'".into(),
                assessment: Assessment::Rejected,
                latency: Duration::from_millis(10),
                stderr: Vec::new(),
            },
            Observation {
                subject: "tool 'b'".into(),
                assessment: Assessment::Reflected("echo".into()),
                latency: Duration::from_millis(30),
                stderr: vec!["warning: unsanitized".into()],
            },
        ];
        let outcome = summarize(observations, Instant::now(), |obs| {
            Some((
                SecurityFinding::new(VulnerabilityClass::SqlInjection, RiskLevel::High, "echo"),
                format!("{} reflected", obs.subject),
            ))
        });
        assert_eq!(outcome.verdict, Verdict::Mismatch);
        assert_eq!(outcome.error_text.as_deref(), Some("tool 'b' reflected"));
        assert_eq!(outcome.latency, Duration::from_millis(20));
        assert_eq!(outcome.stderr.len(), 1);
    }

    #[test]
    fn test_all_rejected_passes() {
        let observations = vec![Observation {
            subject: "tool 'a'".into(),
            assessment: Assessment::Rejected,
            latency: Duration::from_millis(10),
            stderr: Vec::new(),
        }];
        let outcome = summarize(observations, Instant::now(), |_| None);
        assert_eq!(outcome.verdict, Verdict::Exact);
        assert!(outcome.fault.is_none());
    }

    #[test]
    fn test_per_call_timeout_split() {
        assert_eq!(
            per_call_timeout(Duration::from_secs(30), 3),
            Duration::from_secs(10)
        );
        assert_eq!(
            per_call_timeout(Duration::from_secs(2), 10),
            MIN_CALL_TIMEOUT
        );
        assert_eq!(
            per_call_timeout(Duration::from_millis(500), 4),
            Duration::from_millis(500)
        );
    }
}
