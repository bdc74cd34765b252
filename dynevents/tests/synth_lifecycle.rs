//! Integration test: synthetic-event composition and registration order
//!
//! A synthetic event is three coordinated kernel definitions. These tests
//! check the exact strings landing in `synthetic_events` and the two
//! trigger files, the teardown order, and the rollback on partial failure.

use std::fs;
use std::path::Path;

use tempfile::TempDir;

use traceforge_dynevents::{DerivedField, EventHandle, EventItem, SynthEvent};
use traceforge_tracefs::TraceDir;

fn seed_event(root: &Path, system: &str, name: &str, id: i32, fields: &[(&str, &str)]) {
    let dir = root.join("events").join(system).join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("id"), format!("{}\n", id)).unwrap();
    fs::write(dir.join("enable"), "0\n").unwrap();
    fs::write(dir.join("filter"), "none\n").unwrap();
    fs::write(dir.join("trigger"), "").unwrap();

    let mut format = format!("name: {}\nID: {}\nformat:\n", name, id);
    format.push_str("\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;\n\n");
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
    fs::write(tmp.path().join("synthetic_events"), "").unwrap();
    seed_event(
        tmp.path(),
        "sched",
        "sched_waking",
        310,
        &[("pid_t", "pid"), ("int", "target_cpu"), ("int", "prio")],
    );
    seed_event(
        tmp.path(),
        "sched",
        "sched_switch",
        316,
        &[
            ("pid_t", "next_pid"),
            ("int", "next_prio"),
            ("int", "prev_prio"),
        ],
    );
    seed_event(tmp.path(), "synthetic", "wakeup_latency", 1800, &[]);
    tmp
}

fn wakeup_synth(top: &TraceDir) -> SynthEvent {
    let waking = EventHandle::lookup(top, "sched", "sched_waking").unwrap();
    let switch = EventHandle::lookup(top, "sched", "sched_switch").unwrap();
    let start = EventItem::new(waking, "pid", &["target_cpu", "prio"])
        .rename("target_cpu", "cpu")
        .unwrap();
    let end = EventItem::new(switch, "next_pid", &["prev_prio"]);
    let mut synth = SynthEvent::new("wakeup_latency", start, end).with_match_name("pid");
    synth.add_derived(DerivedField::delta_t(true)).unwrap();
    synth
}

#[test]
fn test_declaration_resolves_field_types() {
    let tmp = fake_tracefs();
    let top = TraceDir::at(tmp.path());
    let synth = wakeup_synth(&top);

    assert_eq!(
        synth.declaration(&top).unwrap(),
        "wakeup_latency pid_t pid; int cpu; int prio; int prev_prio; u64 delta_T"
    );
}

#[test]
fn test_register_writes_three_definitions() {
    let tmp = fake_tracefs();
    let top = TraceDir::at(tmp.path());
    let mut synth = wakeup_synth(&top);

    synth.register(&top).unwrap();
    assert_eq!(synth.handle().id(), 1800);

    let declared = fs::read_to_string(tmp.path().join("synthetic_events")).unwrap();
    assert_eq!(
        declared,
        "wakeup_latency pid_t pid; int cpu; int prio; int prev_prio; u64 delta_T\n"
    );

    let start = fs::read_to_string(tmp.path().join("events/sched/sched_waking/trigger")).unwrap();
    assert_eq!(
        start,
        "hist:keys=pid:__arg_1=pid:__arg_2=target_cpu:__arg_3=prio:__ts0=common_timestamp\n"
    );

    let end = fs::read_to_string(tmp.path().join("events/sched/sched_switch/trigger")).unwrap();
    assert_eq!(
        end,
        "hist:keys=next_pid:delta_T=common_timestamp-$__ts0:onmatch(sched.sched_waking)\
         .trace(wakeup_latency,$__arg_1,$__arg_2,$__arg_3,prev_prio,$delta_T)\n"
    );

    synth.close().unwrap();
}

#[test]
fn test_unregister_removes_triggers_before_declaration() {
    let tmp = fake_tracefs();
    let top = TraceDir::at(tmp.path());
    let mut synth = wakeup_synth(&top);

    synth.register(&top).unwrap();
    synth.unregister().unwrap();

    // Both hooks carry a removal line after the original trigger.
    let start = fs::read_to_string(tmp.path().join("events/sched/sched_waking/trigger")).unwrap();
    let start_lines: Vec<&str> = start.lines().collect();
    assert_eq!(start_lines.len(), 2);
    assert!(start_lines[1].starts_with("!hist:keys=pid:"));

    let end = fs::read_to_string(tmp.path().join("events/sched/sched_switch/trigger")).unwrap();
    let end_lines: Vec<&str> = end.lines().collect();
    assert_eq!(end_lines.len(), 2);
    assert!(end_lines[1].starts_with("!hist:keys=next_pid:"));

    let declared = fs::read_to_string(tmp.path().join("synthetic_events")).unwrap();
    assert!(declared.ends_with("!wakeup_latency\n"));

    // Re-registrable after an explicit unregister.
    synth.register(&top).unwrap();
    synth.close().unwrap();
}

#[test]
fn test_partial_registration_rolls_back() {
    let tmp = fake_tracefs();
    // Remove the end event so its trigger write fails mid-registration.
    fs::remove_dir_all(tmp.path().join("events/sched/sched_switch")).unwrap();
    let top = TraceDir::at(tmp.path());

    let waking = EventHandle::lookup(&top, "sched", "sched_waking").unwrap();
    let switch = EventHandle::dynamic("sched", "sched_switch");
    let start = EventItem::new(waking, "pid", &["prio"]);
    let end = EventItem::new(switch, "next_pid", &[]);
    let mut synth = SynthEvent::new("wakeup_latency", start, end);

    assert!(synth.register(&top).is_err());
    assert!(!synth.is_registered());

    // The declaration and the start trigger were rolled back.
    let declared = fs::read_to_string(tmp.path().join("synthetic_events")).unwrap();
    assert!(declared.ends_with("!wakeup_latency\n"));
    let start = fs::read_to_string(tmp.path().join("events/sched/sched_waking/trigger")).unwrap();
    let lines: Vec<&str> = start.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[1].starts_with('!'));
}

#[test]
fn test_descriptor_lists_all_three_surfaces() {
    let tmp = fake_tracefs();
    let top = TraceDir::at(tmp.path());
    let synth = wakeup_synth(&top);

    let descriptor = synth.descriptor(&top).unwrap();
    let lines: Vec<&str> = descriptor.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("synthetic_events: wakeup_latency "));
    assert!(lines[1].starts_with("events/sched/sched_waking/trigger: hist:keys=pid"));
    assert!(lines[2].starts_with("events/sched/sched_switch/trigger: hist:keys=next_pid"));
}

#[test]
fn test_filter_and_enable_after_register() {
    let tmp = fake_tracefs();
    let top = TraceDir::at(tmp.path());
    let mut synth = wakeup_synth(&top);

    assert!(synth.enable(&top).is_err());

    synth.register(&top).unwrap();
    synth.set_filter(&top, "prio < 100").unwrap();
    synth.enable(&top).unwrap();

    let filter =
        fs::read_to_string(tmp.path().join("events/synthetic/wakeup_latency/filter")).unwrap();
    assert!(filter.contains("prio < 100"));
    let enable =
        fs::read_to_string(tmp.path().join("events/synthetic/wakeup_latency/enable")).unwrap();
    assert!(enable.ends_with("1\n"));

    synth.disable(&top).unwrap();
    synth.close().unwrap();
}
