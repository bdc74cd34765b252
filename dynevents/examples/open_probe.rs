//! Kprobe demo: trace openat calls through do_sys_openat2
//!
//! Registers a kprobe decoding the file name, flags, and mode arguments,
//! enables it in a fresh tracing instance for a few seconds, then tears
//! everything down. Requires root and a mounted tracefs.

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use traceforge_dynevents::fields::AddressSpace;
use traceforge_dynevents::{Kprobe, ProbeFields};
use traceforge_tracefs::{Instance, TraceDir};

fn main() -> Result<()> {
    init_tracing();

    let top = TraceDir::top().context("tracefs not available")?;

    let mut fields = ProbeFields::new();
    fields.add_string_arg("file", 2, AddressSpace::User)?;
    fields.add_ptr_arg("flags", 3, "x64", 0)?;
    fields.add_ptr_arg("mode", 3, "x64", 8)?;

    let mut probe = Kprobe::new("open", "do_sys_openat2", fields);
    info!("definition: {}", probe.definition());
    probe.register(&top)?;

    let mut instance = Instance::create(&top, Some("traceforge_open"), true)?;
    probe.enable(instance.dir())?;
    info!("probe enabled; collecting for 5 seconds");
    std::thread::sleep(std::time::Duration::from_secs(5));

    probe.disable(instance.dir())?;
    let trace = instance.dir().read_control("trace")?;
    println!("{}", trace);

    probe.close()?;
    instance.close()?;
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
