//! Synthetic-event demo: wakeup latency
//!
//! Correlates sched_waking with the following sched_switch of the same
//! task and records the time between them in nanoseconds. Requires root
//! and a mounted tracefs.

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use traceforge_dynevents::{DerivedField, EventHandle, EventItem, SynthEvent};
use traceforge_tracefs::TraceDir;

fn main() -> Result<()> {
    init_tracing();

    let top = TraceDir::top().context("tracefs not available")?;

    let waking = EventHandle::lookup(&top, "sched", "sched_waking")?;
    let switch = EventHandle::lookup(&top, "sched", "sched_switch")?;

    // Export target_cpu (renamed to cpu) and prio from the start event,
    // prev_prio from the end event, and correlate on pid == next_pid.
    let start = EventItem::new(waking, "pid", &["target_cpu", "prio"])
        .rename("target_cpu", "cpu")?;
    let end = EventItem::new(switch, "next_pid", &["prev_prio"]);

    let mut synth = SynthEvent::new("wakeup_latency", start, end).with_match_name("pid");
    synth.add_derived(DerivedField::delta_t(true))?;

    println!("{}", synth.descriptor(&top)?);

    synth.register(&top)?;
    synth.set_filter(&top, "prio < 100")?;
    synth.enable(&top)?;
    info!("synthetic event enabled; collecting for 5 seconds");
    std::thread::sleep(std::time::Duration::from_secs(5));

    synth.disable(&top)?;
    println!("{}", top.read_control("trace")?);

    synth.close()?;
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
