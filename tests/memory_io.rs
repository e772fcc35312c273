use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;
use remora::Session;

mod support;
use support::entry_point;

#[test]
#[timeout(10000)]
fn both_read_paths_agree() -> Result<()> {
    let mut session = Session::new()?;
    let process = session.spawn(None, &["/bin/sleep", "30"], None::<&[&str]>)?;

    let entry = entry_point(process.pid())?;

    let mut via_memfd = [0u8; 64];
    let n = process.read_memory(entry, &mut via_memfd)?;
    assert_eq!(n, 64);

    let mut via_ptrace = [0u8; 64];
    let n = process.read_memory_ptrace(entry, &mut via_ptrace)?;
    assert_eq!(n, 64);

    assert_eq!(via_memfd, via_ptrace);

    process.kill()?;
    Ok(())
}

#[test]
#[timeout(10000)]
fn ptrace_write_handles_partial_words() -> Result<()> {
    let mut session = Session::new()?;
    let process = session.spawn(None, &["/bin/sleep", "30"], None::<&[&str]>)?;

    let regions = process.regions()?;
    let stack = regions.iter().find(|r| r.is_stack()).expect("stack region");
    assert!(stack.is_readable() && stack.is_writable());

    let addr = stack.start();

    let mut before = [0u8; 16];
    process.read_memory(addr, &mut before)?;

    // Three bytes: forces the read-modify-write of a partial word.
    let n = process.write_memory_ptrace(addr, &[0xde, 0xad, 0xbe])?;
    assert_eq!(n, 3);

    let mut after = [0u8; 16];
    process.read_memory(addr, &mut after)?;

    assert_eq!(&after[..3], &[0xde, 0xad, 0xbe]);
    assert_eq!(&after[3..], &before[3..]);

    process.kill()?;
    Ok(())
}

#[test]
#[timeout(10000)]
fn memfd_write_round_trips() -> Result<()> {
    let mut session = Session::new()?;
    let process = session.spawn(None, &["/bin/sleep", "30"], None::<&[&str]>)?;

    let regions = process.regions()?;
    let stack = regions.iter().find(|r| r.is_stack()).expect("stack region");
    let addr = stack.start() + 64;

    let payload = *b"remora was here!";
    assert_eq!(process.write_memory(addr, &payload)?, payload.len());

    let mut back = [0u8; 16];
    process.read_memory(addr, &mut back)?;
    assert_eq!(back, payload);

    // Zero-length accesses are no-ops.
    assert_eq!(process.read_memory(addr, &mut [])?, 0);
    assert_eq!(process.write_memory(addr, &[])?, 0);

    process.kill()?;
    Ok(())
}

#[test]
#[timeout(10000)]
fn memory_map_hash_tracks_changes() -> Result<()> {
    let mut session = Session::new()?;
    let process = session.spawn(None, &["/bin/sleep", "30"], None::<&[&str]>)?;

    // First observation always registers as a change; a second does not.
    assert!(process.memory_map_changed());
    assert!(!process.memory_map_changed());

    process.kill()?;
    Ok(())
}
