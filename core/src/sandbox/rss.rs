//! Resident-set-size probing for process-based backends.
//!
//! The OS dispatch is isolated behind a tiny trait: each platform names the
//! command to run and how to read its output; the async execution path is
//! shared.

use std::io;

use tokio::process::Command;

trait RssProbe: Send + Sync {
    fn command(&self, pid: u32) -> Command;
    fn parse(&self, stdout: &str) -> Option<u64>;
}

struct PsProbe;

impl RssProbe for PsProbe {
    fn command(&self, pid: u32) -> Command {
        let mut cmd = Command::new("ps");
        cmd.args(["-o", "rss=", "-p", &pid.to_string()]);
        cmd
    }

    /// `ps` reports kilobytes.
    fn parse(&self, stdout: &str) -> Option<u64> {
        stdout.trim().parse::<u64>().ok().map(|kb| kb * 1024)
    }
}

#[cfg(windows)]
struct TasklistProbe;

#[cfg(windows)]
impl RssProbe for TasklistProbe {
    fn command(&self, pid: u32) -> Command {
        let mut cmd = Command::new("tasklist");
        cmd.args(["/FI", &format!("PID eq {pid}"), "/FO", "CSV", "/NH"]);
        cmd
    }

    /// CSV row ends with a memory column like `"12,345 K"`.
    fn parse(&self, stdout: &str) -> Option<u64> {
        let field = stdout.trim().rsplit(',').next()?;
        let digits: String = field.chars().filter(char::is_ascii_digit).collect();
        digits.parse::<u64>().ok().map(|kb| kb * 1024)
    }
}

fn platform_probe() -> &'static dyn RssProbe {
    #[cfg(windows)]
    {
        &TasklistProbe
    }
    #[cfg(not(windows))]
    {
        &PsProbe
    }
}

/// Current RSS of `pid` in bytes, or `None` when the process has already
/// exited or the probe output was unusable.
pub(crate) async fn probe(pid: u32) -> io::Result<Option<u64>> {
    let probe = platform_probe();
    let output = probe.command(pid).output().await?;
    if !output.status.success() {
        return Ok(None);
    }
    Ok(probe.parse(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ps_output_is_kilobytes() {
        assert_eq!(PsProbe.parse(" 2048\n"), Some(2 * 1024 * 1024));
        assert_eq!(PsProbe.parse(""), None);
        assert_eq!(PsProbe.parse("garbage"), None);
    }

    #[tokio::test]
    async fn probing_our_own_pid_reports_something() {
        if cfg!(windows) {
            return;
        }
        let rss = probe(std::process::id()).await.expect("probe");
        assert!(rss.is_some_and(|bytes| bytes > 0));
    }
}
