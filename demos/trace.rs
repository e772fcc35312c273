use std::env;
use std::time::Duration;

use remora::{EventStatus, Session};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let argv: Vec<String> = env::args().skip(1).collect();
    if argv.is_empty() {
        anyhow::bail!("usage: trace <program> [args...]");
    }

    let mut session = Session::new()?;
    session.set_disable_aslr(true);
    session.set_disable_lazy_binding(true);

    let process = session.spawn(None, &argv, None::<&[String]>)?;
    println!("tracing pid {}", process.pid());

    process.resume()?;

    while process.thread_count() > 0 {
        process.next_debug_event(Duration::from_millis(500), |event| {
            println!("{event:?}");
            EventStatus::Continue
        })?;
    }

    Ok(())
}
