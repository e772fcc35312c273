use std::env;

use remora::{procfs, Pid};

fn main() -> anyhow::Result<()> {
    let pid = env::args()
        .nth(1)
        .and_then(|arg| arg.parse::<i32>().ok())
        .map(Pid::from_raw)
        .unwrap_or_else(Pid::this);

    for region in procfs::regions(pid)? {
        println!(
            "{:016x}-{:016x} {}{}{}{} {}",
            region.start(),
            region.end(),
            if region.is_readable() { 'r' } else { '-' },
            if region.is_writable() { 'w' } else { '-' },
            if region.is_executable() { 'x' } else { '-' },
            if region.is_shared() { 's' } else { 'p' },
            region.name(),
        );
    }

    println!("maps hash: {:#018x}", procfs::hash_regions(pid));

    Ok(())
}
