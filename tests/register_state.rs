use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;
use remora::{RegisterId, Session};

#[test]
#[timeout(10000)]
fn gp_writes_round_trip_with_width_aliasing() -> Result<()> {
    let mut session = Session::new()?;
    let process = session.spawn(None, &["/bin/sleep", "30"], None::<&[&str]>)?;
    let pid = process.pid();

    let thread = process.find_thread(pid).expect("initial thread");

    let mut ctx = thread.context()?;
    assert!(ctx.is_populated());
    assert!(ctx.is_64_bit());

    ctx.get(RegisterId::Rax).unwrap().set(0x1122_3344_5566_7788u64);
    ctx.get(RegisterId::R9).unwrap().set(0xdead_beefu64);
    thread.set_context(&ctx)?;

    // Read back through a fresh snapshot.
    let mut back = thread.context()?;
    assert_eq!(back.get(RegisterId::Rax).unwrap().get::<u64>(), 0x1122_3344_5566_7788);
    assert_eq!(back.get(RegisterId::Eax).unwrap().get::<u32>(), 0x5566_7788);
    assert_eq!(back.get(RegisterId::Ax).unwrap().get::<u16>(), 0x7788);
    assert_eq!(back.get(RegisterId::Ah).unwrap().get::<u8>(), 0x77);
    assert_eq!(back.get(RegisterId::Al).unwrap().get::<u8>(), 0x88);
    assert_eq!(back.get(RegisterId::R9).unwrap().get::<u64>(), 0xdead_beef);

    process.kill()?;
    Ok(())
}

#[test]
#[timeout(10000)]
fn instruction_pointer_shortcuts_agree_with_the_context() -> Result<()> {
    let mut session = Session::new()?;
    let process = session.spawn(None, &["/bin/sleep", "30"], None::<&[&str]>)?;
    let pid = process.pid();

    let thread = process.find_thread(pid).expect("initial thread");

    let ip = thread.instruction_pointer()?;
    let mut ctx = thread.context()?;
    assert_eq!(ctx.get(RegisterId::Xip).unwrap().get::<u64>(), ip);
    assert_eq!(ctx.get(RegisterId::Rip).unwrap().get::<u64>(), ip);

    // Poke the same value back through the shortcut; nothing changes.
    thread.set_instruction_pointer(ip)?;
    assert_eq!(thread.instruction_pointer()?, ip);

    process.kill()?;
    Ok(())
}

#[test]
#[timeout(10000)]
fn debug_registers_are_snapshotted() -> Result<()> {
    let mut session = Session::new()?;
    let process = session.spawn(None, &["/bin/sleep", "30"], None::<&[&str]>)?;
    let pid = process.pid();

    let thread = process.find_thread(pid).expect("initial thread");
    let mut ctx = thread.context()?;

    // A fresh tracee has no hardware breakpoints armed.
    for id in [RegisterId::Dr0, RegisterId::Dr1, RegisterId::Dr2, RegisterId::Dr3] {
        assert_eq!(ctx.get(id).unwrap().get::<u64>(), 0);
    }

    process.kill()?;
    Ok(())
}
