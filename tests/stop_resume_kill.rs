use anyhow::Result;
use ntest::timeout;
use remora::{EventKind, EventStatus, Session};

mod support;
use support::pump_until;

#[test]
#[timeout(30000)]
fn stop_resume_kill_cycle() -> Result<()> {
    let mut session = Session::new()?;
    let process = session.spawn(None, &["/bin/sleep", "60"], None::<&[&str]>)?;
    let pid = process.pid();

    process.resume()?;

    // An asynchronous stop request surfaces as a SIGSTOP stop event.
    process.stop()?;
    let event = pump_until(process, EventStatus::Stop, |event| {
        event.kind == EventKind::Stopped && libc::WSTOPSIG(event.status) == libc::SIGSTOP
    })?;
    assert_eq!(event.tid, pid);
    assert_eq!(process.active_thread(), Some(pid));

    // The verdict was Stop, so the thread stayed stopped and register
    // state is inspectable.
    let thread = process.find_thread(pid).expect("stopped thread");
    assert!(thread.is_stopped());
    let ip = thread.instruction_pointer()?;
    assert_ne!(ip, 0);

    process.resume()?;
    process.kill()?;

    // The kill lands as a signal death (possibly preceded by the
    // exit-stage trap stop).
    let event = pump_until(process, EventStatus::Continue, |event| {
        matches!(event.kind, EventKind::Terminated | EventKind::Exited)
    })?;

    if event.kind == EventKind::Terminated {
        assert!(libc::WIFSIGNALED(event.status));
        assert_eq!(libc::WTERMSIG(event.status), libc::SIGKILL);
    }

    Ok(())
}
