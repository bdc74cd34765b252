//! Histogram demo: kmalloc requests by call site
//!
//! Builds a two-dimensional histogram over kmem/kmalloc with the call site
//! shown as a kernel symbol and bytes_alloc accumulated per bin, sorted by
//! requested size in descending order. Requires root and a mounted tracefs.

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use traceforge_dynevents::{AxisDisplay, EventHandle, Histogram, SortDirection};
use traceforge_tracefs::TraceDir;

fn main() -> Result<()> {
    init_tracing();

    let top = TraceDir::top().context("tracefs not available")?;
    let kmalloc = EventHandle::lookup(&top, "kmem", "kmalloc")?;

    let mut hist = Histogram::new("h1", kmalloc);
    hist.add_axis("call_site", AxisDisplay::Sym)?;
    hist.add_axis("bytes_req", AxisDisplay::Normal)?;
    hist.add_value("bytes_alloc")?;
    hist.sort_keys(&["bytes_req", "bytes_alloc"])?;
    hist.sort_key_direction("bytes_req", SortDirection::Descending)?;

    info!("trigger: {}", hist.trigger()?);

    hist.start(&top)?;
    info!("histogram active; collecting for 5 seconds");
    std::thread::sleep(std::time::Duration::from_secs(5));
    hist.stop()?;

    println!("{}", hist.read()?);

    hist.clear()?;
    hist.close()?;
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
