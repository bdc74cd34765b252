//! Integration test: dependency-ordered teardown
//!
//! An eprobe targeting a synthetic event must be destroyed before the
//! synthetic event itself. The tracker enforces the order explicitly
//! instead of relying on construction sequence.

use std::fs;
use std::path::Path;

use tempfile::TempDir;

use traceforge_dynevents::{Eprobe, EventHandle, EventItem, ProbeFields, SynthEvent};
use traceforge_tracefs::{Error, KernelResource, ResourceTracker, TraceDir};

fn seed_event(root: &Path, system: &str, name: &str, id: i32, fields: &[(&str, &str)]) {
    let dir = root.join("events").join(system).join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("id"), format!("{}\n", id)).unwrap();
    fs::write(dir.join("trigger"), "").unwrap();

    let mut format = format!("name: {}\nID: {}\nformat:\n", name, id);
    for (i, (ty, fname)) in fields.iter().enumerate() {
        format.push_str(&format!(
            "\tfield:{} {};\toffset:{};\tsize:4;\tsigned:1;\n",
            ty,
            fname,
            8 + i * 4
        ));
    }
    fs::write(dir.join("format"), format).unwrap();
}

fn fake_tracefs() -> TempDir {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("dynamic_events"), "").unwrap();
    fs::write(tmp.path().join("synthetic_events"), "").unwrap();
    seed_event(tmp.path(), "sched", "sched_waking", 310, &[("pid_t", "pid")]);
    seed_event(
        tmp.path(),
        "sched",
        "sched_switch",
        316,
        &[("pid_t", "next_pid")],
    );
    seed_event(tmp.path(), "synthetic", "wakeup_latency", 1800, &[]);
    seed_event(tmp.path(), "eprobes", "wl_probe", 2100, &[]);
    tmp
}

fn build_graph(top: &TraceDir) -> (SynthEvent, Eprobe) {
    let waking = EventHandle::lookup(top, "sched", "sched_waking").unwrap();
    let switch = EventHandle::lookup(top, "sched", "sched_switch").unwrap();
    let start = EventItem::new(waking, "pid", &[]);
    let end = EventItem::new(switch, "next_pid", &[]);
    let mut synth = SynthEvent::new("wakeup_latency", start, end).with_match_name("pid");

    // Producers register before dependents.
    synth.register(top).unwrap();
    let mut probe = Eprobe::new("wl_probe", synth.handle().clone(), ProbeFields::new());
    probe.register(top).unwrap();

    (synth, probe)
}

#[test]
fn test_tracker_refuses_to_close_a_referenced_producer() {
    let tmp = fake_tracefs();
    let top = TraceDir::at(tmp.path());
    let (synth, probe) = build_graph(&top);

    let mut tracker = ResourceTracker::new();
    let synth_id = tracker.track(Box::new(synth));
    let probe_id = tracker.track(Box::new(probe));
    tracker.depends_on(probe_id, synth_id).unwrap();

    let err = tracker.close(synth_id).unwrap_err();
    assert!(matches!(err, Error::Lifecycle(_)));

    // Dependents first, then the producer goes down cleanly.
    tracker.close(probe_id).unwrap();
    tracker.close(synth_id).unwrap();

    let dynamic = fs::read_to_string(tmp.path().join("dynamic_events")).unwrap();
    assert!(dynamic.ends_with("-:eprobes/wl_probe\n"));
    let declared = fs::read_to_string(tmp.path().join("synthetic_events")).unwrap();
    assert!(declared.ends_with("!wakeup_latency\n"));
}

#[test]
fn test_close_all_tears_down_in_reverse_dependency_order() {
    let tmp = fake_tracefs();
    let top = TraceDir::at(tmp.path());
    let (synth, probe) = build_graph(&top);

    let mut tracker = ResourceTracker::new();
    let synth_id = tracker.track(Box::new(synth));
    let probe_id = tracker.track(Box::new(probe));
    tracker.depends_on(probe_id, synth_id).unwrap();

    tracker.close_all().unwrap();

    let dynamic = fs::read_to_string(tmp.path().join("dynamic_events")).unwrap();
    assert!(dynamic.ends_with("-:eprobes/wl_probe\n"));
    let declared = fs::read_to_string(tmp.path().join("synthetic_events")).unwrap();
    assert!(declared.ends_with("!wakeup_latency\n"));
}

#[test]
fn test_close_all_skips_detached_entries() {
    let tmp = fake_tracefs();
    let top = TraceDir::at(tmp.path());
    let (synth, probe) = build_graph(&top);

    let mut tracker = ResourceTracker::new();
    let synth_id = tracker.track(Box::new(synth));
    let probe_id = tracker.track(Box::new(probe));
    tracker.depends_on(probe_id, synth_id).unwrap();

    // Hand both objects to another owner; teardown must leave the kernel
    // state alone.
    tracker.resource_mut(synth_id).unwrap().detach();
    tracker.resource_mut(probe_id).unwrap().detach();
    tracker.close_all().unwrap();

    let dynamic = fs::read_to_string(tmp.path().join("dynamic_events")).unwrap();
    assert!(!dynamic.contains("-:"));
    let declared = fs::read_to_string(tmp.path().join("synthetic_events")).unwrap();
    assert!(!declared.contains('!'));
}
