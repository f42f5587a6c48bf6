//! Parameter parsing for host-level plugin actions.

use std::str::FromStr;
use std::time::Duration;

use lab_common::time::parse_iso;
use lab_common::{ModuleKind, ParamMap};
use serde_json::Value;

use crate::scheduler::{CronSchedule, JobSpec, ScheduleError, ScheduledCommand, Trigger};

/// Lease length used when `reserve` does not specify `lease_s`.
pub const DEFAULT_LEASE_S: u64 = 60;

/// Target device of a request. Must be usable as a topic segment.
pub(crate) fn device_id(params: &ParamMap) -> Result<&str, String> {
    let device_id = params
        .get("device_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| "missing device_id".to_string())?;
    if device_id.contains(['/', '+', '#']) {
        return Err(format!("invalid device_id: {device_id}"));
    }
    Ok(device_id)
}

/// `lease_s` as a duration. Accepts integers, non-negative floats
/// (truncated) and numeric strings.
pub(crate) fn lease_duration(params: &ParamMap) -> Result<Duration, String> {
    let seconds = match params.get("lease_s") {
        None | Some(Value::Null) => Some(DEFAULT_LEASE_S),
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        Some(_) => None,
    };
    seconds
        .map(Duration::from_secs)
        .ok_or_else(|| "lease_s must be a non-negative number of seconds".to_string())
}

/// Build a job from `schedule` parameters. `at` wins when both triggers are given.
pub(crate) fn job_spec(
    module: ModuleKind,
    actor: &str,
    params: &ParamMap,
) -> Result<JobSpec, ScheduleError> {
    let trigger = match (params.get("at"), params.get("cron")) {
        (Some(at), _) if !at.is_null() => {
            let raw = at
                .as_str()
                .ok_or_else(|| ScheduleError::InvalidInstant(at.to_string()))?;
            let instant =
                parse_iso(raw).ok_or_else(|| ScheduleError::InvalidInstant(raw.to_string()))?;
            Trigger::At(instant)
        }
        (_, Some(Value::String(expr))) => Trigger::Cron(CronSchedule::parse(expr)?),
        (_, Some(other)) if !other.is_null() => {
            return Err(ScheduleError::InvalidCron {
                expr: other.to_string(),
                reason: "expected a string".to_string(),
            });
        }
        _ => return Err(ScheduleError::MissingTrigger),
    };

    Ok(JobSpec {
        module,
        actor: actor.to_string(),
        trigger,
        commands: commands(params.get("commands"))?,
    })
}

fn commands(value: Option<&Value>) -> Result<Vec<ScheduledCommand>, ScheduleError> {
    let invalid = |reason: String| ScheduleError::InvalidCommands(reason);
    let Some(Value::Array(items)) = value else {
        return Err(invalid("commands must be a list".to_string()));
    };
    if items.is_empty() {
        return Err(invalid("commands must not be empty".to_string()));
    }

    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let Value::Object(entry) = item else {
                return Err(invalid(format!("command {index} is not an object")));
            };
            let device_id = device_id(entry).map_err(|e| invalid(format!("command {index}: {e}")))?;
            let action = entry
                .get("action")
                .and_then(Value::as_str)
                .filter(|a| !a.is_empty())
                .ok_or_else(|| invalid(format!("command {index}: missing action")))?;
            let params = match entry.get("params") {
                None | Some(Value::Null) => ParamMap::new(),
                Some(Value::Object(params)) => params.clone(),
                Some(_) => return Err(invalid(format!("command {index}: params must be an object"))),
            };
            let module = match entry.get("module") {
                None | Some(Value::Null) => None,
                Some(Value::String(name)) => Some(
                    ModuleKind::from_str(name)
                        .map_err(|_| invalid(format!("command {index}: unknown module {name}")))?,
                ),
                Some(_) => return Err(invalid(format!("command {index}: module must be a string"))),
            };
            Ok(ScheduledCommand {
                device_id: device_id.to_string(),
                module,
                action: action.to_string(),
                params,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn params(value: Value) -> ParamMap {
        value.as_object().cloned().unwrap_or_default()
    }

    #[rstest]
    #[case(json!({}), Some(60))]
    #[case(json!({"lease_s": 5}), Some(5))]
    #[case(json!({"lease_s": 2.9}), Some(2))]
    #[case(json!({"lease_s": "30"}), Some(30))]
    #[case(json!({"lease_s": -1}), None)]
    #[case(json!({"lease_s": [1]}), None)]
    fn test_lease_duration(#[case] input: Value, #[case] expected: Option<u64>) {
        let parsed = lease_duration(&params(input)).ok().map(|d| d.as_secs());
        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_device_id() {
        assert_eq!(device_id(&params(json!({"device_id": "dev1"}))), Ok("dev1"));
        assert!(device_id(&params(json!({}))).is_err());
        assert!(device_id(&params(json!({"device_id": ""}))).is_err());
        assert!(device_id(&params(json!({"device_id": "a/b"}))).is_err());
    }

    #[test]
    fn test_job_spec_at() {
        let spec = job_spec(
            ModuleKind::Ndi,
            "alice",
            &params(json!({
                "at": "2030-01-01T08:00:00Z",
                "commands": [
                    {"device_id": "dev1", "action": "start", "params": {"source": "CAM"}},
                    {"device_id": "dev2", "action": "off", "module": "led"},
                ],
            })),
        )
        .unwrap();
        assert!(matches!(spec.trigger, Trigger::At(_)));
        assert_eq!(spec.actor, "alice");
        assert_eq!(spec.commands.len(), 2);
        assert_eq!(spec.commands[0].params["source"], "CAM");
        assert_eq!(spec.commands[1].module, Some(ModuleKind::Led));
    }

    #[test]
    fn test_job_spec_cron() {
        let spec = job_spec(
            ModuleKind::Led,
            "alice",
            &params(json!({
                "cron": "0 18 * * 1-5",
                "commands": [{"device_id": "dev1", "action": "off"}],
            })),
        )
        .unwrap();
        assert!(matches!(spec.trigger, Trigger::Cron(_)));
    }

    #[rstest]
    #[case(json!({"commands": [{"device_id": "d", "action": "off"}]}), ScheduleError::MissingTrigger)]
    #[case(json!({"at": "soon", "commands": []}), ScheduleError::InvalidInstant("soon".into()))]
    fn test_job_spec_rejects(#[case] input: Value, #[case] expected: ScheduleError) {
        assert_eq!(
            job_spec(ModuleKind::Led, "a", &params(input)).unwrap_err(),
            expected
        );
    }

    #[rstest]
    #[case(json!({"at": "2030-01-01T08:00:00Z"}))]
    #[case(json!({"at": "2030-01-01T08:00:00Z", "commands": []}))]
    #[case(json!({"at": "2030-01-01T08:00:00Z", "commands": [{"action": "off"}]}))]
    #[case(json!({"at": "2030-01-01T08:00:00Z", "commands": [{"device_id": "d"}]}))]
    #[case(json!({"at": "2030-01-01T08:00:00Z", "commands": [{"device_id": "d", "action": "off", "module": "fog"}]}))]
    fn test_malformed_batch(#[case] input: Value) {
        assert!(matches!(
            job_spec(ModuleKind::Led, "a", &params(input)),
            Err(ScheduleError::InvalidCommands(_))
        ));
    }
}
