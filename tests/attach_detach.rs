use std::collections::BTreeSet;
use std::process::Command;

use anyhow::Result;
use ntest::timeout;
use remora::{procfs, Pid, Session};

mod support;
use support::entry_point;

#[test]
#[timeout(15000)]
fn attach_tracks_every_thread_then_detaches() -> Result<()> {
    // An untraced child to attach to.
    let mut child = Command::new("/bin/sleep").arg("30").spawn()?;
    let pid = Pid::from_raw(child.id() as i32);

    {
        let mut session = Session::new()?;
        let process = session.attach(pid)?;

        // The thread table mirrors procfs at attach time.
        let attached: BTreeSet<_> = process.threads().map(|t| t.tid()).collect();
        let reported: BTreeSet<_> = procfs::threads(pid)?.into_iter().collect();
        assert_eq!(attached, reported);
        assert!(attached.contains(&pid));
        assert_eq!(process.active_thread(), Some(pid));

        // Every attached thread is held in its attach stop.
        for thread in process.threads() {
            assert!(thread.is_stopped());
        }

        // Target memory is reachable while attached.
        let entry = entry_point(pid)?;
        let mut word = [0u8; 8];
        assert_eq!(process.read_memory(entry, &mut word)?, 8);

        process.detach();
        assert_eq!(process.thread_count(), 0);
        assert_eq!(process.active_thread(), None);
    }

    // The detached child is alive and killable by normal means.
    assert!(child.try_wait()?.is_none());
    child.kill()?;
    child.wait()?;

    Ok(())
}

#[test]
#[timeout(10000)]
fn attaching_to_a_dead_pid_fails_typed() -> Result<()> {
    let mut child = Command::new("/bin/true").spawn()?;
    child.wait()?;
    let pid = Pid::from_raw(child.id() as i32);

    let mut session = Session::new()?;
    assert!(session.attach(pid).is_err());

    Ok(())
}
