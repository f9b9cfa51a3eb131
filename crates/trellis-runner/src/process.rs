//! Process-group ownership for spawned shell commands.
//!
//! Every command runs as the leader of its own process group. Dropping the
//! owning [`ProcessGroup`] kills the whole group, so anything the command
//! forked or backgrounded goes down with it.

use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;

/// Build a `<shell> -c <command>` invocation in a fresh process group.
pub fn shell_command(shell: &str, command: &str) -> Command {
    let mut cmd = Command::new(shell);
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    #[cfg(unix)]
    {
        cmd.process_group(0);
    }

    cmd
}

/// Kills a spawned process group when dropped.
#[derive(Debug)]
pub struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    /// Take ownership of the group led by `child`.
    pub fn of(child: &Child) -> Self {
        Self { pgid: child.id() }
    }

    /// Let the group outlive this handle.
    pub fn release(mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: killpg only sends a signal; ESRCH just means the group is gone
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc == 0 {
        debug!(pgid, "Killed process group");
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

/// Process groups spawned on behalf of one job. Dropping the set ends every
/// process the job left behind.
#[derive(Debug, Default)]
pub struct ProcessGroups {
    groups: Vec<ProcessGroup>,
}

impl ProcessGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, group: ProcessGroup) {
        self.groups.push(group);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_dropping_group_kills_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let command = format!("(sleep 1; touch {}) & sleep 30", marker.display());

        let mut child = shell_command("sh", &command).spawn().unwrap();
        let group = ProcessGroup::of(&child);
        tokio::time::sleep(Duration::from_millis(100)).await;

        drop(group);
        let status = child.wait().await.unwrap();
        assert!(!status.success());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_released_group_survives() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let command = format!("(sleep 0.3; touch {}) &", marker.display());

        let mut child = shell_command("sh", &command).spawn().unwrap();
        let group = ProcessGroup::of(&child);
        assert!(child.wait().await.unwrap().success());
        group.release();

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(marker.exists());
    }
}
