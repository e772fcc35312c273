use std::time::Duration;

use remora::{Event, EventStatus, Pid, Process};

#[allow(unused)]
pub const PUMP_TIMEOUT: Duration = Duration::from_millis(500);

/// Pump until an event matches `pred`, answering `verdict` for the match
/// and `Continue` for everything else. Gives up after a bounded number of
/// idle pumps.
#[allow(unused)]
pub fn pump_until(
    process: &mut Process,
    verdict: EventStatus,
    mut pred: impl FnMut(&Event) -> bool,
) -> anyhow::Result<Event> {
    for _ in 0..40 {
        let mut found = None;

        process.next_debug_event(PUMP_TIMEOUT, |event| {
            if found.is_none() && pred(event) {
                found = Some(*event);
                verdict
            } else {
                EventStatus::Continue
            }
        })?;

        if let Some(event) = found {
            return Ok(event);
        }
    }

    anyhow::bail!("no matching debug event arrived");
}

/// Pump until the timeouts win, collecting every event seen on the way.
#[allow(unused)]
pub fn drain(process: &mut Process) -> anyhow::Result<Vec<Event>> {
    let mut events = vec![];

    for _ in 0..40 {
        let fired = process.next_debug_event(Duration::from_millis(200), |event| {
            events.push(*event);
            EventStatus::Continue
        })?;

        if !fired {
            break;
        }
    }

    Ok(events)
}

/// The target's entry point, read from its auxiliary vector. Valid once
/// the target is post-exec, and accounts for PIE relocation.
#[allow(unused)]
pub fn entry_point(pid: Pid) -> anyhow::Result<u64> {
    let raw = std::fs::read(format!("/proc/{pid}/auxv"))?;

    for chunk in raw.chunks_exact(16) {
        let key = u64::from_ne_bytes(chunk[..8].try_into()?);
        let value = u64::from_ne_bytes(chunk[8..].try_into()?);

        if key == libc::AT_ENTRY {
            return Ok(value);
        }
    }

    anyhow::bail!("no AT_ENTRY in auxv")
}
