use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, warn};

/// Signal-level control over a running pipeline process.
pub trait ProcessControl {
    /// Freeze the process in place (SIGSTOP).
    fn pause(&self) -> io::Result<()>;
    /// Continue a paused process (SIGCONT).
    fn resume(&self) -> io::Result<()>;
    /// Ask the process to exit gracefully (SIGINT).
    fn interrupt(&self) -> io::Result<()>;
}

#[cfg(unix)]
fn send_signal(child: &Child, signal: libc::c_int) -> io::Result<()> {
    let pid = child
        .id()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "process has already been reaped"))?;

    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
impl ProcessControl for Child {
    fn pause(&self) -> io::Result<()> {
        send_signal(self, libc::SIGSTOP)
    }

    fn resume(&self) -> io::Result<()> {
        send_signal(self, libc::SIGCONT)
    }

    fn interrupt(&self) -> io::Result<()> {
        send_signal(self, libc::SIGINT)
    }
}

#[cfg(not(unix))]
impl ProcessControl for Child {
    fn pause(&self) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "pause requires unix signals"))
    }

    fn resume(&self) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "resume requires unix signals"))
    }

    fn interrupt(&self) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "interrupt requires unix signals"))
    }
}

/// Interrupt the process and reap it. If it is still alive after `grace`
/// it is killed. Returns only once the process has been waited on.
pub async fn terminate_and_wait(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    if let Err(e) = child.interrupt() {
        warn!("Failed to interrupt process {:?}: {}", child.id(), e);
    }
    // a stopped process only acts on the interrupt once continued
    if let Err(e) = child.resume() {
        debug!("Failed to continue process {:?}: {}", child.id(), e);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!("Process {:?} ignored interrupt for {:?}, killing it", child.id(), grace);
            child.kill().await?;
            let status = child.wait().await?;
            debug!("Killed process exited with {}", status);
            Ok(status)
        }
    }
}

/// Whether a process with this id exists (reaped processes do not).
#[cfg(all(test, unix))]
pub(crate) fn process_exists(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::process::Command;

    #[cfg(target_os = "linux")]
    fn process_state(pid: u32) -> char {
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).unwrap();
        // the state follows the parenthesised command name
        let after_name = &stat[stat.rfind(')').unwrap() + 2..];
        after_name.chars().next().unwrap()
    }

    #[tokio::test]
    async fn test_interrupt_terminates_and_reaps() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();
        let status = terminate_and_wait(&mut child, Duration::from_secs(5)).await.unwrap();
        assert!(!status.success());
        assert!(child.id().is_none());
        assert!(!process_exists(pid));
    }

    #[tokio::test]
    async fn test_process_ignoring_interrupt_is_killed() {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("trap '' INT; while true; do sleep 0.1; done")
            .spawn()
            .unwrap();
        // give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = terminate_and_wait(&mut child, Duration::from_millis(300)).await.unwrap();
        assert!(!status.success());
        assert!(child.id().is_none());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_pause_and_resume() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();

        child.pause().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(process_state(pid), 'T');

        child.resume().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_ne!(process_state(pid), 'T');

        terminate_and_wait(&mut child, Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_paused_process_still_terminates() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        child.pause().unwrap();
        let status = terminate_and_wait(&mut child, Duration::from_secs(5)).await.unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_already_exited_process() {
        let mut child = Command::new("true").spawn().unwrap();
        child.wait().await.unwrap();
        let status = terminate_and_wait(&mut child, Duration::from_secs(1)).await.unwrap();
        assert!(status.success());
    }
}
