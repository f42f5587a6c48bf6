//! Process-group lifecycle: spawn, liveness, graceful-then-forced teardown.

use std::collections::BTreeMap;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::process::Child;
use tracing::{debug, warn};

use crate::tokio_command;

/// Default time a group gets to exit after a graceful signal.
const DEFAULT_GRACE: Duration = Duration::from_secs(3);

/// Default interval between liveness probes while waiting.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("empty command line")]
    EmptyCommand,

    #[error("failed to spawn {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// How long to wait for a group to go away before escalating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationPolicy {
    pub grace: Duration,
    pub poll_interval: Duration,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            grace: DEFAULT_GRACE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl TerminationPolicy {
    pub fn new(grace: Duration, poll_interval: Duration) -> Self {
        Self {
            grace,
            // A zero interval would spin.
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }
}

/// How a group ended up gone.
///
/// On Linux, zombie members do not count as alive. On other unix targets
/// they do, so a group whose exited members are never reaped is reported as
/// [`Killed`](Self::Killed) once the grace period runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// Nothing was left to signal.
    AlreadyExited,
    /// The group disappeared within the grace period after a graceful signal.
    Graceful,
    /// The grace period elapsed and the group was sent `SIGKILL`.
    Killed,
}

/// A child process leading its own process group.
#[derive(Debug)]
pub struct GroupChild {
    child: Child,
    pid: u32,
    program: String,
}

/// Spawn `argv` as the leader of a new process group.
///
/// Stdio is detached and `env` is applied on top of the inherited
/// environment.
pub fn spawn_group(argv: &[String], env: &BTreeMap<String, String>) -> Result<GroupChild, SpawnError> {
    let (program, args) = argv.split_first().ok_or(SpawnError::EmptyCommand)?;

    let mut cmd = tokio_command(program);
    cmd.args(args)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(false);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.as_std_mut().process_group(0);
    }

    let child = cmd.spawn().map_err(|source| SpawnError::Io {
        program: program.clone(),
        source,
    })?;
    let pid = child.id().ok_or_else(|| SpawnError::Io {
        program: program.clone(),
        source: io::Error::other("spawned process has no pid"),
    })?;

    debug!(pid, program = %program, "Spawned process group");
    Ok(GroupChild {
        child,
        pid,
        program: program.clone(),
    })
}

impl GroupChild {
    /// Pid of the leader, which is also the process group id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Exit status of the leader if it has already exited.
    pub fn try_exit_status(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Whether any member of the group is still alive.
    ///
    /// Reaps the leader if it has exited so a zombie leader does not keep the
    /// group visible.
    pub fn is_alive(&mut self) -> bool {
        let leader_running = matches!(self.child.try_wait(), Ok(None));
        if leader_running {
            return true;
        }
        #[cfg(target_os = "linux")]
        {
            nix::sys::signal::killpg(self.pgid(), None).is_ok()
                && group_has_running_member(self.pid).unwrap_or(true)
        }
        #[cfg(all(unix, not(target_os = "linux")))]
        {
            nix::sys::signal::killpg(self.pgid(), None).is_ok()
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    #[cfg(unix)]
    fn pgid(&self) -> nix::unistd::Pid {
        #[allow(clippy::cast_possible_wrap)]
        nix::unistd::Pid::from_raw(self.pid as i32)
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: nix::sys::signal::Signal) {
        match nix::sys::signal::killpg(self.pgid(), signal) {
            Ok(()) => debug!(pid = self.pid, signal = %signal, "Signalled process group"),
            Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => warn!(pid = self.pid, signal = %signal, error = %e, "Failed to signal process group"),
        }
    }

    /// Poll until the group is gone or the grace period runs out.
    async fn wait_gone(&mut self, policy: TerminationPolicy) -> bool {
        let deadline = tokio::time::Instant::now() + policy.grace;
        loop {
            if !self.is_alive() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(policy.poll_interval).await;
        }
    }

    /// `SIGTERM` the whole group, then `SIGKILL` it if it outlives the grace period.
    pub async fn terminate(mut self, policy: TerminationPolicy) -> TerminationOutcome {
        if !self.is_alive() {
            return TerminationOutcome::AlreadyExited;
        }

        #[cfg(unix)]
        {
            self.signal_group(nix::sys::signal::Signal::SIGTERM);
            if self.wait_gone(policy).await {
                return TerminationOutcome::Graceful;
            }
            warn!(
                pid = self.pid,
                program = %self.program,
                grace_ms = policy.grace.as_millis() as u64,
                "Process group outlived grace period, sending SIGKILL"
            );
            self.signal_group(nix::sys::signal::Signal::SIGKILL);
            self.reap(policy).await;
            TerminationOutcome::Killed
        }

        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
            self.reap(policy).await;
            TerminationOutcome::Killed
        }
    }

    /// `SIGINT` the group so it can finalize its output; fall back to
    /// [`terminate`](Self::terminate) if it is still around after the grace period.
    pub async fn interrupt(mut self, policy: TerminationPolicy) -> TerminationOutcome {
        if !self.is_alive() {
            return TerminationOutcome::AlreadyExited;
        }

        #[cfg(unix)]
        {
            self.signal_group(nix::sys::signal::Signal::SIGINT);
            if self.wait_gone(policy).await {
                return TerminationOutcome::Graceful;
            }
        }

        self.terminate(policy).await
    }

    /// Let the process run on its own; a background task reaps it when it exits.
    pub fn detach(mut self) {
        tokio::spawn(async move {
            if let Err(e) = self.child.wait().await {
                warn!(pid = self.pid, error = %e, "Error waiting for detached process");
            }
        });
    }

    async fn reap(&mut self, policy: TerminationPolicy) {
        if tokio::time::timeout(policy.grace, self.child.wait())
            .await
            .is_err()
        {
            warn!(pid = self.pid, "Process did not exit after SIGKILL");
        }
    }
}

/// Whether a non-zombie process belongs to group `pgid`. `None` when
/// `/proc` cannot be read.
#[cfg(target_os = "linux")]
fn group_has_running_member(pgid: u32) -> Option<bool> {
    let entries = std::fs::read_dir("/proc").ok()?;
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        // The process may be gone by now.
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        if let Some((state, pgrp)) = parse_stat(&stat) {
            if pgrp == pgid && state != 'Z' {
                return Some(true);
            }
        }
    }
    Some(false)
}

/// State and process group from a `/proc/<pid>/stat` line.
#[cfg(target_os = "linux")]
fn parse_stat(stat: &str) -> Option<(char, u32)> {
    // comm may itself contain ')' and spaces.
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let _ppid = fields.next()?;
    let pgrp = fields.next()?.parse().ok()?;
    Some((state, pgrp))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn fast_policy() -> TerminationPolicy {
        TerminationPolicy::new(Duration::from_millis(400), Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let argv = vec!["/definitely/not/here".to_string()];
        let err = spawn_group(&argv, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, SpawnError::Io { .. }));
    }

    #[tokio::test]
    async fn test_spawn_empty_command() {
        let err = spawn_group(&[], &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, SpawnError::EmptyCommand));
    }

    #[tokio::test]
    async fn test_terminate_graceful() {
        let child = spawn_group(&sh("sleep 30"), &BTreeMap::new()).unwrap();
        let outcome = child.terminate(fast_policy()).await;
        assert_eq!(outcome, TerminationOutcome::Graceful);
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let child = spawn_group(&sh("trap '' TERM; sleep 30"), &BTreeMap::new()).unwrap();
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = tokio::time::Instant::now();
        let outcome = child.terminate(fast_policy()).await;
        assert_eq!(outcome, TerminationOutcome::Killed);
        assert!(started.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_terminate_already_exited() {
        let mut child = spawn_group(&sh("exit 0"), &BTreeMap::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!child.is_alive());
        assert_eq!(
            child.terminate(fast_policy()).await,
            TerminationOutcome::AlreadyExited
        );
    }

    #[tokio::test]
    async fn test_env_is_applied() {
        let mut env = BTreeMap::new();
        env.insert("LAB_PROBE".to_string(), "1".to_string());
        let mut child = spawn_group(&sh("test \"$LAB_PROBE\" = 1"), &env).unwrap();
        let status = loop {
            if let Some(status) = child.try_exit_status().unwrap() {
                break status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_interrupt() {
        let child = spawn_group(&sh("sleep 30"), &BTreeMap::new()).unwrap();
        let outcome = child.interrupt(fast_policy()).await;
        assert_ne!(outcome, TerminationOutcome::AlreadyExited);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_parse_stat() {
        assert_eq!(
            parse_stat("4242 (odd) name) S 1 4240 4240 0 -1 4194560"),
            Some(('S', 4240))
        );
        assert_eq!(parse_stat("4242 (sleep) Z 1 4240 4240"), Some(('Z', 4240)));
        assert_eq!(parse_stat("garbage"), None);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_terminate_signals_whole_group() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("grandchild.pid");
        let script = format!("sleep 30 & echo $! > '{}'; wait", pidfile.display());
        let child = spawn_group(&sh(&script), &BTreeMap::new()).unwrap();

        let grandchild = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(raw) = std::fs::read_to_string(&pidfile) {
                    if let Ok(pid) = raw.trim().parse::<u32>() {
                        return pid;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let stat_path = format!("/proc/{grandchild}/stat");
        assert!(std::fs::read_to_string(&stat_path).is_ok());

        let outcome = child.terminate(fast_policy()).await;
        assert_eq!(outcome, TerminationOutcome::Graceful);

        // Gone, or a zombie nobody has reaped yet.
        if let Ok(stat) = std::fs::read_to_string(&stat_path) {
            let (state, _) = parse_stat(&stat).unwrap();
            assert_eq!(state, 'Z', "grandchild still running: {stat}");
        }
    }
}
