//! Deferred and recurring command batches.
//!
//! Each job runs as its own task and fires its batch on one-shot or cron
//! triggers. Leases are checked per command when the batch fires, never when
//! it is scheduled; a command whose lease is held by someone else is skipped
//! without an error and without retry.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lab_bus::{BusAdapter, Outgoing};
use lab_common::{Envelope, ModuleKind, ParamMap, lease_key, topics};
use regex::{Captures, Regex};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::Registry;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("schedule needs either 'at' or 'cron'")]
    MissingTrigger,

    #[error("invalid instant: {0}")]
    InvalidInstant(String),

    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("invalid commands: {0}")]
    InvalidCommands(String),
}

/// Day-of-week numbers.
static DOW_NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

const DOW_NAMES: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

/// A five-field crontab expression (minute, hour, day-of-month, month,
/// day-of-week) with crontab semantics: day-of-week 0 and 7 are Sunday.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let invalid = |reason: String| ScheduleError::InvalidCron {
            expr: expr.to_string(),
            reason,
        };
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let &[minute, hour, dom, month, dow] = fields.as_slice() else {
            return Err(invalid(format!("expected 5 fields, got {}", fields.len())));
        };
        let dow = crontab_day_names(dow).map_err(invalid)?;
        let normalized = format!("0 {minute} {hour} {dom} {month} {dow}");
        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;
        Ok(Self {
            expr: fields.join(" "),
            schedule,
        })
    }

    /// First firing strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    pub fn as_str(&self) -> &str {
        &self.expr
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

/// Rewrite crontab day-of-week numbers (0-7, Sunday = 0 or 7) as day names,
/// which the cron crate reads unambiguously.
fn crontab_day_names(field: &str) -> Result<String, String> {
    let items = field
        .split(',')
        .map(crontab_day_item)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items.join(","))
}

fn crontab_day_item(item: &str) -> Result<String, String> {
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => (base, Some(step)),
        None => (item, None),
    };

    // The cron crate numbers Sunday 1, so a named range ending on Sunday
    // would run backwards. Spell those out as a list.
    if let Some((start, end)) = base.split_once('-') {
        if let (Ok(start), Ok(7)) = (start.parse::<usize>(), end.parse::<usize>()) {
            if start > 7 {
                return Err(format!("day-of-week {start} out of range 0-7"));
            }
            let step = match step {
                None => 1,
                Some(raw) => raw
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| format!("invalid day-of-week step {raw}"))?,
            };
            let mut days: Vec<&str> = Vec::new();
            for day in (start..=7).step_by(step).map(|n| DOW_NAMES[n]) {
                if !days.contains(&day) {
                    days.push(day);
                }
            }
            return Ok(days.join(","));
        }
    }

    let mut error = None;
    let named = DOW_NUMBER.replace_all(base, |caps: &Captures<'_>| {
        match caps[0].parse::<usize>().ok().and_then(|n| DOW_NAMES.get(n)) {
            Some(name) => (*name).to_string(),
            None => {
                error = Some(format!("day-of-week {} out of range 0-7", &caps[0]));
                caps[0].to_string()
            }
        }
    });
    if let Some(e) = error {
        return Err(e);
    }
    Ok(match step {
        Some(step) => format!("{named}/{step}"),
        None => named.into_owned(),
    })
}

#[derive(Debug, Clone)]
pub enum Trigger {
    /// Fire once. Instants in the past fire immediately.
    At(DateTime<Utc>),
    Cron(CronSchedule),
}

impl Trigger {
    pub fn next_fire(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::At(at) => Some((*at).max(now)),
            Self::Cron(schedule) => schedule.next_after(now),
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::At(at) => write!(f, "at {}", lab_common::time::format_iso(*at)),
            Self::Cron(schedule) => write!(f, "cron {schedule}"),
        }
    }
}

/// One entry of a scheduled batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledCommand {
    pub device_id: String,
    /// Target module; the scheduling plugin's module when unset.
    pub module: Option<ModuleKind>,
    pub action: String,
    pub params: ParamMap,
}

#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Module of the plugin that scheduled the batch.
    pub module: ModuleKind,
    /// Requesting actor; leases are checked against it.
    pub actor: String,
    pub trigger: Trigger,
    pub commands: Vec<ScheduledCommand>,
}

impl JobSpec {
    /// Publish every command whose lease `actor` may use. Returns the number
    /// dispatched.
    pub async fn fire(&self, bus: &BusAdapter, registry: &Registry) -> usize {
        let actor = format!("host:{}", self.actor);
        let mut dispatched = 0;
        for command in &self.commands {
            let module = command.module.unwrap_or(self.module);
            let key = lease_key(module.as_str(), &command.device_id);
            if !registry.can_use(&key, &self.actor) {
                debug!(key = %key, actor = %self.actor, action = %command.action, "Skipping scheduled command, lease held by another actor");
                continue;
            }

            let mut params = command.params.clone();
            params.insert("device_id".into(), command.device_id.clone().into());
            let envelope = Envelope::new(actor.as_str(), command.action.as_str()).with_params(params);
            let topic = topics::module_cmd(&command.device_id, module.as_str());
            let message = Outgoing::new(topic.as_str(), envelope.to_bytes());
            match bus.publish(message).await {
                Ok(()) => {
                    debug!(topic = %topic, req_id = %envelope.req_id, action = %command.action, "Dispatched scheduled command");
                    dispatched += 1;
                }
                Err(e) => warn!(topic = %topic, error = %e, "Failed to dispatch scheduled command"),
            }
        }
        dispatched
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Listing entry for a pending job.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: JobId,
    pub module: ModuleKind,
    pub actor: String,
    pub trigger: String,
    pub commands: usize,
}

struct JobEntry {
    info: JobInfo,
    cancel: CancellationToken,
}

pub struct Scheduler {
    bus: Arc<BusAdapter>,
    registry: Arc<Registry>,
    jobs: Arc<DashMap<JobId, JobEntry>>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(bus: Arc<BusAdapter>, registry: Arc<Registry>) -> Self {
        Self {
            bus,
            registry,
            jobs: Arc::new(DashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Start a job. Returns its id and first firing time.
    pub fn schedule(&self, spec: JobSpec) -> (JobId, Option<DateTime<Utc>>) {
        let id = JobId(Uuid::new_v4());
        let cancel = self.cancel.child_token();
        let next = spec.trigger.next_fire(Utc::now());
        let info = JobInfo {
            id,
            module: spec.module,
            actor: spec.actor.clone(),
            trigger: spec.trigger.to_string(),
            commands: spec.commands.len(),
        };
        info!(job = %id, module = %spec.module, trigger = %info.trigger, commands = info.commands, "Job scheduled");
        self.jobs.insert(
            id,
            JobEntry {
                info,
                cancel: cancel.clone(),
            },
        );

        let bus = Arc::clone(&self.bus);
        let registry = Arc::clone(&self.registry);
        let jobs = Arc::clone(&self.jobs);
        tokio::spawn(async move {
            run_job(&spec, &bus, &registry, &cancel).await;
            jobs.remove(&id);
            debug!(job = %id, "Job finished");
        });
        (id, next)
    }

    pub fn list(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self.jobs.iter().map(|e| e.info.clone()).collect();
        jobs.sort_by_key(|info| info.id);
        jobs
    }

    /// Cancel a pending job. Returns whether it existed.
    pub fn cancel(&self, id: JobId) -> bool {
        match self.jobs.remove(&id) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                info!(job = %id, "Job cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every job.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.jobs.clear();
    }
}

async fn run_job(spec: &JobSpec, bus: &BusAdapter, registry: &Registry, cancel: &CancellationToken) {
    loop {
        let now = Utc::now();
        let Some(next) = spec.trigger.next_fire(now) else {
            warn!(trigger = %spec.trigger, "Trigger has no future firing");
            return;
        };
        let delay = (next - now).to_std().unwrap_or_default();
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let dispatched = spec.fire(bus, registry).await;
        debug!(trigger = %spec.trigger, dispatched, total = spec.commands.len(), "Job fired");
        if matches!(spec.trigger, Trigger::At(_)) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};
    use lab_bus::MemoryTransport;
    use rstest::rstest;
    use std::time::Duration;

    #[rstest]
    #[case("0", "SUN")]
    #[case("7", "SUN")]
    #[case("1-5", "MON-FRI")]
    #[case("*/2", "*/2")]
    #[case("1,3,5", "MON,WED,FRI")]
    #[case("mon", "mon")]
    #[case("*", "*")]
    #[case("5-7", "FRI,SAT,SUN")]
    #[case("1-7", "MON,TUE,WED,THU,FRI,SAT,SUN")]
    #[case("0-7/2", "SUN,TUE,THU,SAT")]
    #[case("1-5,7", "MON-FRI,SUN")]
    #[case("0-6/2", "SUN-SAT/2")]
    fn test_crontab_day_names(#[case] field: &str, #[case] expected: &str) {
        assert_eq!(crontab_day_names(field).unwrap(), expected);
    }

    #[test]
    fn test_day_of_week_out_of_range() {
        assert!(crontab_day_names("8").is_err());
        assert!(crontab_day_names("9-7").is_err());
        assert!(crontab_day_names("1-7/0").is_err());
    }

    #[test]
    fn test_range_ending_on_sunday() {
        let weekend = CronSchedule::parse("0 8 * * 5-7").unwrap();
        // Saturday 2024-05-04.
        let saturday = Utc.with_ymd_and_hms(2024, 5, 4, 12, 0, 0).unwrap();
        let next = weekend.next_after(saturday).unwrap();
        assert_eq!(next.weekday(), Weekday::Sun);
        assert_eq!(next.hour(), 8);

        let daily = CronSchedule::parse("0 8 * * 1-7").unwrap();
        let next = daily.next_after(saturday).unwrap();
        assert_eq!(next.weekday(), Weekday::Sun);
    }

    #[rstest]
    #[case("* * *")]
    #[case("0 0 * * * *")]
    #[case("61 * * * *")]
    #[case("")]
    fn test_invalid_cron(#[case] expr: &str) {
        assert!(matches!(
            CronSchedule::parse(expr),
            Err(ScheduleError::InvalidCron { .. })
        ));
    }

    #[test]
    fn test_cron_next_firing() {
        let schedule = CronSchedule::parse("30 9 * * 1-5").unwrap();
        // Saturday 2024-05-04.
        let saturday = Utc.with_ymd_and_hms(2024, 5, 4, 12, 0, 0).unwrap();
        let next = schedule.next_after(saturday).unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!((next.hour(), next.minute(), next.second()), (9, 30, 0));
    }

    #[test]
    fn test_cron_sunday_as_zero() {
        let schedule = CronSchedule::parse("0 8 * * 0").unwrap();
        let monday = Utc.with_ymd_and_hms(2024, 5, 6, 0, 0, 0).unwrap();
        assert_eq!(schedule.next_after(monday).unwrap().weekday(), Weekday::Sun);
    }

    #[test]
    fn test_past_instant_fires_now() {
        let now = Utc::now();
        let trigger = Trigger::At(now - chrono::Duration::hours(1));
        assert_eq!(trigger.next_fire(now), Some(now));
    }

    fn command(device_id: &str, action: &str) -> ScheduledCommand {
        ScheduledCommand {
            device_id: device_id.into(),
            module: None,
            action: action.into(),
            params: ParamMap::new(),
        }
    }

    #[tokio::test]
    async fn test_fire_skips_commands_leased_to_others() {
        let (transport, _events) = MemoryTransport::new();
        let transport = Arc::new(transport);
        let bus = BusAdapter::new(transport.clone());
        let registry = Registry::new();
        registry
            .lock("ndi:dev1", "bob", Duration::from_secs(60))
            .unwrap();

        let spec = JobSpec {
            module: ModuleKind::Ndi,
            actor: "alice".into(),
            trigger: Trigger::At(Utc::now()),
            commands: vec![command("dev1", "start"), command("dev2", "start")],
        };
        assert_eq!(spec.fire(&bus, &registry).await, 1);

        assert!(transport.published_to(&topics::module_cmd("dev1", "ndi")).is_empty());
        let sent = transport.published_json(&topics::module_cmd("dev2", "ndi"));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["actor"], "host:alice");
        assert_eq!(sent[0]["action"], "start");
        assert_eq!(sent[0]["params"]["device_id"], "dev2");
    }

    #[tokio::test]
    async fn test_fire_uses_fresh_request_ids() {
        let (transport, _events) = MemoryTransport::new();
        let transport = Arc::new(transport);
        let bus = BusAdapter::new(transport.clone());
        let registry = Registry::new();

        let spec = JobSpec {
            module: ModuleKind::Led,
            actor: "alice".into(),
            trigger: Trigger::At(Utc::now()),
            commands: vec![command("dev1", "off"), command("dev1", "solid")],
        };
        spec.fire(&bus, &registry).await;
        let sent = transport.published_json(&topics::module_cmd("dev1", "led"));
        assert_eq!(sent.len(), 2);
        assert_ne!(sent[0]["req_id"], sent[1]["req_id"]);
    }

    #[tokio::test]
    async fn test_one_shot_job_runs_and_is_removed() {
        let (transport, _events) = MemoryTransport::new();
        let transport = Arc::new(transport);
        let bus = Arc::new(BusAdapter::new(transport.clone()));
        let scheduler = Scheduler::new(bus, Arc::new(Registry::new()));

        let (id, next) = scheduler.schedule(JobSpec {
            module: ModuleKind::Led,
            actor: "alice".into(),
            trigger: Trigger::At(Utc::now() - chrono::Duration::seconds(5)),
            commands: vec![command("dev1", "off")],
        });
        assert!(next.is_some());

        tokio::time::timeout(Duration::from_secs(5), async {
            while transport.published_to(&topics::module_cmd("dev1", "led")).is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while scheduler.list().iter().any(|job| job.id == id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_and_shutdown() {
        let (transport, _events) = MemoryTransport::new();
        let bus = Arc::new(BusAdapter::new(Arc::new(transport)));
        let scheduler = Scheduler::new(bus, Arc::new(Registry::new()));
        let spec = JobSpec {
            module: ModuleKind::Ndi,
            actor: "alice".into(),
            trigger: Trigger::Cron(CronSchedule::parse("0 3 * * *").unwrap()),
            commands: vec![command("dev1", "start")],
        };

        let (first, _) = scheduler.schedule(spec.clone());
        scheduler.schedule(spec);
        assert_eq!(scheduler.list().len(), 2);
        assert_eq!(scheduler.list()[0].trigger, "cron 0 3 * * *");

        assert!(scheduler.cancel(first));
        assert!(!scheduler.cancel(first));
        assert_eq!(scheduler.list().len(), 1);

        scheduler.shutdown();
        assert!(scheduler.list().is_empty());
    }
}
