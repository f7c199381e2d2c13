//! Interpretation of a provider call into a `CallResultEntry`.
//!
//! Pure functions: no store access, no clock except the `now` passed in.

use serde_json::Value;

use crate::db::{CallResultEntry, CapturedData};
use crate::provider::ProviderCall;
use crate::util::{format_ts, parse_ts};

/// End reasons that make a terminal call a failure. Compared case-insensitively;
/// any other reason, including ones we have never seen, counts as success.
pub const FAILED_END_REASONS: &[&str] = &[
    "no-answer",
    "busy",
    "failed",
    "error",
    "canceled",
    "rejected",
    "timeout",
    "no-answer-timeout",
];

/// A call is terminal once the provider says `ended` or reports an end time.
pub fn is_terminal(call: &ProviderCall) -> bool {
    let ended_status = call
        .status
        .as_deref()
        .map_or(false, |s| s.trim().eq_ignore_ascii_case("ended"));
    let has_end_time = call
        .ended_at
        .as_deref()
        .map_or(false, |t| !t.trim().is_empty());
    ended_status || has_end_time
}

pub fn is_failure_reason(ended_reason: Option<&str>) -> bool {
    ended_reason.map_or(false, |reason| {
        let reason = reason.trim();
        FAILED_END_REASONS
            .iter()
            .any(|failed| failed.eq_ignore_ascii_case(reason))
    })
}

/// Whole seconds between start and end, rounded. 0 unless both parse and end >= start.
pub fn call_duration_seconds(started_at: Option<&str>, ended_at: Option<&str>) -> i64 {
    let (Some(start), Some(end)) = (started_at.and_then(parse_ts), ended_at.and_then(parse_ts))
    else {
        return 0;
    };
    if end < start {
        return 0;
    }
    let millis = (end - start).num_milliseconds();
    (millis as f64 / 1000.0).round() as i64
}

/// Capture values from the first structured output that carries a `result`
/// object, restricted to `capture_keys`. `None` when nothing matched.
///
/// Numbers, strings and nulls are kept as-is; anything else is stored as text.
pub fn map_captured_data(
    structured_outputs: Option<&serde_json::Map<String, Value>>,
    capture_keys: &[String],
) -> Option<CapturedData> {
    let result = structured_outputs?
        .values()
        .find_map(|output| output.get("result").and_then(Value::as_object))?;

    let mut captured = CapturedData::new();
    for key in capture_keys {
        let Some(value) = result.get(key) else {
            continue;
        };
        let value = match value {
            Value::Number(_) | Value::String(_) | Value::Null => value.clone(),
            Value::Bool(b) => Value::String(b.to_string()),
            other => Value::String(other.to_string()),
        };
        captured.insert(key.clone(), value);
    }
    (!captured.is_empty()).then_some(captured)
}

/// Build the history entry for a terminal call.
pub fn terminal_outcome(
    call: &ProviderCall,
    capture_keys: &[String],
    now: chrono::DateTime<chrono::Utc>,
) -> CallResultEntry {
    let ended_reason = call
        .ended_reason
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string);
    let failed = is_failure_reason(ended_reason.as_deref());

    let attempted_at = call
        .ended_at
        .as_deref()
        .or(call.started_at.as_deref())
        .and_then(parse_ts)
        .map(format_ts)
        .unwrap_or_else(|| format_ts(now));

    let artifact = call.artifact.as_ref();
    let transcript = artifact
        .and_then(|a| a.transcript.clone())
        .filter(|t| !t.trim().is_empty());
    let recording_url = artifact
        .and_then(|a| a.recording.as_ref())
        .and_then(|r| r.url())
        .map(str::to_string);
    let captured_data = map_captured_data(
        artifact.and_then(|a| a.structured_outputs.as_ref()),
        capture_keys,
    );

    CallResultEntry {
        attempted_at,
        duration_seconds: if failed {
            0
        } else {
            call_duration_seconds(call.started_at.as_deref(), call.ended_at.as_deref())
        },
        transcript,
        recording_url,
        captured_data,
        failure_reason: if failed { ended_reason.clone() } else { None },
        ended_reason,
        provider_call_id: Some(call.id.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{CallArtifact, Recording};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn ended_call(reason: &str, seconds: i64) -> ProviderCall {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        ProviderCall {
            id: "call-1".to_string(),
            status: Some("ended".to_string()),
            ended_reason: Some(reason.to_string()),
            started_at: Some(format_ts(start)),
            ended_at: Some(format_ts(start + chrono::Duration::seconds(seconds))),
            ..ProviderCall::default()
        }
    }

    #[test]
    fn test_terminal_detection() {
        let mut call = ProviderCall {
            id: "c".to_string(),
            status: Some("in-progress".to_string()),
            ..ProviderCall::default()
        };
        assert!(!is_terminal(&call));
        call.status = Some("Ended".to_string());
        assert!(is_terminal(&call));
        call.status = Some("in-progress".to_string());
        call.ended_at = Some("2026-03-01T09:00:42Z".to_string());
        assert!(is_terminal(&call), "endedAt alone is terminal");
    }

    #[test]
    fn test_failure_reasons_case_insensitive() {
        assert!(is_failure_reason(Some("no-answer")));
        assert!(is_failure_reason(Some("BUSY")));
        assert!(is_failure_reason(Some(" No-Answer-Timeout ")));
        assert!(!is_failure_reason(Some("customer-ended-call")));
        assert!(!is_failure_reason(Some("some-reason-added-next-year")));
        assert!(!is_failure_reason(None));
    }

    #[test]
    fn test_duration_rules() {
        assert_eq!(
            call_duration_seconds(Some("2026-03-01T09:00:00Z"), Some("2026-03-01T09:00:42.400Z")),
            42
        );
        assert_eq!(
            call_duration_seconds(Some("2026-03-01T09:00:00Z"), Some("2026-03-01T09:00:42.500Z")),
            43
        );
        assert_eq!(
            call_duration_seconds(Some("2026-03-01T09:01:00Z"), Some("2026-03-01T09:00:00Z")),
            0
        );
        assert_eq!(call_duration_seconds(None, Some("2026-03-01T09:00:00Z")), 0);
        assert_eq!(call_duration_seconds(Some("garbage"), Some("2026-03-01T09:00:00Z")), 0);
    }

    #[test]
    fn test_captured_data_filtered_to_declared_keys() {
        let outputs = json!({
            "so-1": { "name": "answers", "result": {
                "interested": true,
                "budget": 250000,
                "notes": "call back",
                "preferredModel": null,
                "extras": ["a", "b"]
            }}
        });
        let captured = map_captured_data(
            outputs.as_object(),
            &keys(&["interested", "budget", "preferredModel", "extras", "missing"]),
        )
        .unwrap();
        assert_eq!(captured.get("interested"), Some(&json!("true")));
        assert_eq!(captured.get("budget"), Some(&json!(250000)));
        assert_eq!(captured.get("preferredModel"), Some(&Value::Null));
        assert_eq!(captured.get("extras"), Some(&json!("[\"a\",\"b\"]")));
        assert!(!captured.contains_key("notes"));
        assert!(!captured.contains_key("missing"));
    }

    #[test]
    fn test_captured_data_none_when_nothing_matches() {
        let outputs = json!({ "so-1": { "result": null }, "so-2": { "result": { "x": 1 } } });
        assert!(map_captured_data(outputs.as_object(), &keys(&["y"])).is_none());
        assert!(map_captured_data(None, &keys(&["y"])).is_none());
        let skipped_first = map_captured_data(outputs.as_object(), &keys(&["x"])).unwrap();
        assert_eq!(skipped_first.get("x"), Some(&json!(1)));
    }

    #[test]
    fn test_customer_ended_call_is_success_with_duration() {
        let mut call = ended_call("customer-ended-call", 42);
        call.artifact = Some(CallArtifact {
            transcript: Some("AI: Hi\nUser: Bye".to_string()),
            recording: Some(Recording::Url("https://rec/1.wav".to_string())),
            structured_outputs: None,
        });
        let entry = terminal_outcome(&call, &[], now());
        assert!(!entry.is_failure());
        assert_eq!(entry.duration_seconds, 42);
        assert_eq!(entry.attempted_at, "2026-03-01T09:00:42.000Z");
        assert_eq!(entry.recording_url.as_deref(), Some("https://rec/1.wav"));
        assert_eq!(entry.ended_reason.as_deref(), Some("customer-ended-call"));
        assert_eq!(entry.provider_call_id.as_deref(), Some("call-1"));
    }

    #[test]
    fn test_no_answer_is_failure_without_duration() {
        let entry = terminal_outcome(&ended_call("no-answer", 30), &[], now());
        assert_eq!(entry.failure_reason.as_deref(), Some("no-answer"));
        assert_eq!(entry.duration_seconds, 0);
    }

    #[test]
    fn test_unknown_reason_is_success() {
        let entry = terminal_outcome(&ended_call("assistant-said-goodbye-v2", 12), &[], now());
        assert!(!entry.is_failure());
        assert_eq!(entry.duration_seconds, 12);
    }

    #[test]
    fn test_missing_times_fall_back_to_now() {
        let call = ProviderCall {
            id: "call-9".to_string(),
            status: Some("ended".to_string()),
            ..ProviderCall::default()
        };
        let entry = terminal_outcome(&call, &[], now());
        assert_eq!(entry.attempted_at, "2026-03-01T12:00:00.000Z");
        assert_eq!(entry.duration_seconds, 0);
        assert!(!entry.is_failure());
        assert_eq!(entry.ended_reason, None);
    }
}
