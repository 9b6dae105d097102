//! Failed-step extraction from a job's event stream.
//!
//! Executors print one JSON object per line on stdout, in the shape of runner job events:
//!
//! ```json
//! {"event": "runner_on_failed", "event_data": {"task": "create database", "host": "localhost",
//!  "ignore_errors": false, "res": {"msg": "database forum1 already exists"}}}
//! ```
//!
//! Lines that are not JSON objects are ordinary output and skipped. Only `runner_on_failed` and
//! `runner_on_unreachable` events count, and failures the playbook explicitly ignores are dropped.
//!
//! The stats playbook also reports its findings through the stream, as a successful task whose
//! result carries a `tenant_stats` object (see [`parse_tenant_stats`]).

use serde::Deserialize;
use serde_json::Value;

use super::FailedStep;

const FAILED_EVENTS: &[&str] = &["runner_on_failed", "runner_on_unreachable"];
const OK_EVENT: &str = "runner_on_ok";

/// Usage numbers reported by the stats playbook
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReportedStats {
    pub content_count: i64,
    pub user_count: i64,
    pub assets_mb: f64,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    event: String,
    #[serde(default)]
    event_data: EventData,
}

#[derive(Debug, Default, Deserialize)]
struct EventData {
    task: Option<String>,
    host: Option<String>,
    #[serde(default)]
    ignore_errors: Option<bool>,
    res: Option<Value>,
}

fn events(stdout: &str) -> impl Iterator<Item = RawEvent> + '_ {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| serde_json::from_str::<RawEvent>(line).ok())
}

/// The last `tenant_stats` result in the stream, if any
pub fn parse_tenant_stats(stdout: &str) -> Option<ReportedStats> {
    events(stdout)
        .filter(|event| event.event == OK_EVENT)
        .filter_map(|event| event.event_data.res?.get("tenant_stats").cloned())
        .filter_map(|stats| serde_json::from_value::<ReportedStats>(stats).ok())
        .last()
}

/// Collect every failed step in stream order.
pub fn parse_failed_steps(stdout: &str) -> Vec<FailedStep> {
    events(stdout)
        .filter(|event| FAILED_EVENTS.contains(&event.event.as_str()))
        .filter(|event| !event.event_data.ignore_errors.unwrap_or(false))
        .map(|event| {
            let data = event.event_data;
            FailedStep {
                step: data.task.unwrap_or_else(|| "unknown".to_string()),
                host: data.host.unwrap_or_else(|| "localhost".to_string()),
                message: data.res.as_ref().map(result_message).unwrap_or_else(|| event.event.clone()),
            }
        })
        .collect()
}

/// Pick the most useful human-readable field out of a task result.
fn result_message(res: &Value) -> String {
    for key in ["msg", "stderr", "reason"] {
        if let Some(text) = res.get(key).and_then(Value::as_str)
            && !text.trim().is_empty()
        {
            return text.trim().to_string();
        }
    }
    res.to_string()
}
