//! End-to-end engine scenarios through the event pipeline.

use ingen_core::{Atom, Path, Status, Uri};
use rand::{Rng, SeedableRng};

use crate::event::keys;
use crate::internals::{BLOCK_DELAY_URI, CONTROLLER_URI};
use crate::tests::utils::{Note, TestEngine, CONST_URI, GAIN_URI};

fn has_root_arc(t: &TestEngine, tail: &str, head: &str) -> bool {
    let store = t.engine.store();
    let store = store.lock().unwrap();
    let root = store.block(&Path::root()).unwrap();
    // Safety: offline test, nothing else is running.
    unsafe { &*root }
        .graph()
        .unwrap()
        .has_arc(&Path::parse(tail).unwrap(), &Path::parse(head).unwrap())
}

#[test]
fn create_connect_run() {
    let mut t = TestEngine::new();
    let s1 = t.create_block("/a", CONTROLLER_URI);
    let s2 = t.create_block("/b", CONTROLLER_URI);
    let s3 = t.connect("/a/output", "/b/controller");
    t.sync();

    assert_eq!(t.status_of(s1), Some(Status::Success));
    assert_eq!(t.status_of(s2), Some(Status::Success));
    assert_eq!(t.status_of(s3), Some(Status::Success));
    assert!(t.store_contains("/a"));
    assert!(t.store_contains("/b"));
    assert!(t.store_contains("/a/output"));
    assert!(has_root_arc(&t, "/a/output", "/b/controller"));

    // Single arc with matching polyphony: the head joined the tail's
    // buffer, zero copy.
    let tail = t.port_buffers("/a/output");
    let head = t.port_buffers("/b/controller");
    assert!(tail[0].ptr_eq(&head[0]));

    t.run_cycles(2);
}

#[test]
fn duplicate_put_is_idempotent() {
    let mut t = TestEngine::new();
    t.create_block("/a", GAIN_URI);
    t.sync();
    let before = {
        let store = t.engine.store();
        let len = store.lock().unwrap().len();
        len
    };
    let again = t.create_block("/a", GAIN_URI);
    t.sync();
    assert_eq!(t.status_of(again), Some(Status::Success));
    let store = t.engine.store();
    assert_eq!(store.lock().unwrap().len(), before);
}

#[test]
fn feedback_is_refused() {
    let mut t = TestEngine::new();
    t.create_block("/x", GAIN_URI);
    t.create_block("/y", GAIN_URI);
    let first = t.connect("/x/out", "/y/in");
    t.sync();
    let second = t.connect("/y/out", "/x/in");
    t.sync();

    assert_eq!(t.status_of(first), Some(Status::Success));
    assert_eq!(t.status_of(second), Some(Status::CompilationFailed));
    assert!(has_root_arc(&t, "/x/out", "/y/in"));
    assert!(!has_root_arc(&t, "/y/out", "/x/in"));
}

#[test]
fn block_delay_breaks_feedback() {
    let mut t = TestEngine::new();
    t.create_block("/x", GAIN_URI);
    t.create_block("/y", GAIN_URI);
    t.create_block("/d", BLOCK_DELAY_URI);
    t.create_block("/s", CONST_URI);
    let a1 = t.connect("/x/out", "/d/input");
    let a2 = t.connect("/d/output", "/y/in");
    let a3 = t.connect("/y/out", "/x/in");
    t.connect("/s/out", "/x/in");
    t.set_port_value("/s/value", 1.0);

    // First cycle: everything installs at the cycle boundary, then the
    // loop contributes silence and x passes the constant.
    t.sync();
    for seq in [a1, a2, a3] {
        assert_eq!(t.status_of(seq), Some(Status::Success));
    }
    assert!(has_root_arc(&t, "/y/out", "/x/in"));
    assert_eq!(t.port_value("/y/out"), 0.0);
    assert_eq!(t.port_value("/x/out"), 1.0);
    // From here on, y sees what the delay received one cycle earlier.
    t.sync();
    assert_eq!(t.port_value("/y/out"), 1.0);
    assert_eq!(t.port_value("/x/out"), 2.0);
    t.sync();
    assert_eq!(t.port_value("/y/out"), 2.0);
}

#[test]
fn polyphonic_fan_out_joins_single_buffer() {
    let mut t = TestEngine::new();
    t.create_graph("/g", 4);
    t.sync();
    t.create_block("/g/s", CONST_URI);
    t.create_polyphonic_block("/g/p", GAIN_URI);
    t.sync();
    let c = t.connect("/g/s/out", "/g/p/in");
    t.sync();
    assert_eq!(t.status_of(c), Some(Status::Success));

    let source = t.port_buffers("/g/s/out");
    let voices = t.port_buffers("/g/p/in");
    assert_eq!(source.len(), 1);
    assert_eq!(voices.len(), 4);
    for v in &voices {
        assert!(v.ptr_eq(&source[0]));
    }
    // Registry entry + owner voice + four joined voices, plus the four
    // handles this test just cloned.
    assert_eq!(source[0].strong_count(), 6 + voices.len() + 1);
}

#[test]
fn mixing_conserves_constant_level() {
    let mut t = TestEngine::new();
    t.create_graph("/g", 4);
    t.sync();
    t.create_polyphonic_block("/g/p", CONST_URI);
    t.create_block("/g/m", GAIN_URI);
    t.sync();
    t.connect("/g/p/out", "/g/m/in");
    t.set_port_value("/g/p/value", 0.8);
    t.sync();
    t.run_cycles(2);
    // Four voices of 0.8 averaged into the mono input.
    assert!((t.port_value("/g/m/in") - 0.8).abs() < 1e-6);
    assert!((t.port_value("/g/m/out") - 0.8).abs() < 1e-6);
}

#[test]
fn two_sources_mix_by_sum() {
    let mut t = TestEngine::new();
    t.create_block("/s1", CONST_URI);
    t.create_block("/s2", CONST_URI);
    t.create_block("/m", GAIN_URI);
    t.sync();
    t.connect("/s1/out", "/m/in");
    t.connect("/s2/out", "/m/in");
    t.set_port_value("/s1/value", 0.25);
    t.set_port_value("/s2/value", 0.5);
    t.sync();
    t.run_cycles(2);
    assert!((t.port_value("/m/out") - 0.75).abs() < 1e-6);
}

#[test]
fn bundle_is_one_undo_entry_and_atomic_to_clients() {
    let mut t = TestEngine::new();
    t.create_block("/a", GAIN_URI);
    t.sync();
    assert_eq!(t.engine.undo_depth(), 1);

    let begin = t.seq();
    t.handle.bundle_begin(t.client, begin);
    t.delete("/a");
    t.create_block("/a", CONST_URI);
    let end = t.seq();
    t.handle.bundle_end(t.client, end);
    t.sync();

    assert_eq!(t.engine.undo_depth(), 2);
    assert!(t.store_contains("/a"));

    // The client saw the whole change inside one bundle: no deletion is
    // visible outside the delimiters.
    let notes = t.notes.lock().unwrap();
    let begin_idx = notes.iter().position(|n| *n == Note::BundleBegin).unwrap();
    let end_idx = notes.iter().rposition(|n| *n == Note::BundleEnd).unwrap();
    let delete_idx = notes
        .iter()
        .position(|n| *n == Note::Deleted("ingen:/a".into()))
        .unwrap();
    assert!(begin_idx < delete_idx && delete_idx < end_idx);
}

#[test]
fn undo_of_delete_restores_arcs() {
    let mut t = TestEngine::new();
    t.create_block("/x", CONST_URI);
    t.create_block("/y", GAIN_URI);
    t.connect("/x/out", "/y/in");
    t.set_port_value("/x/value", 0.5);
    t.sync();
    t.run_cycles(1);
    assert!((t.port_value("/y/out") - 0.5).abs() < 1e-6);

    let del = t.delete("/x");
    t.sync();
    assert_eq!(t.status_of(del), Some(Status::Success));
    assert!(!t.store_contains("/x"));
    assert!(!has_root_arc(&t, "/x/out", "/y/in"));

    let undo_seq = t.seq();
    t.handle.undo(t.client, undo_seq);
    t.sync();
    t.sync();
    assert!(t.store_contains("/x"));
    assert!(t.store_contains("/y"));
    assert!(has_root_arc(&t, "/x/out", "/y/in"));
    // The restored arc is typed and joined like the original.
    let tail = t.port_buffers("/x/out");
    let head = t.port_buffers("/y/in");
    assert!(tail[0].ptr_eq(&head[0]));
}

#[test]
fn disconnect_then_undo_round_trips() {
    let mut t = TestEngine::new();
    t.create_block("/x", CONST_URI);
    t.create_block("/y", GAIN_URI);
    t.connect("/x/out", "/y/in");
    t.sync();

    t.disconnect("/x/out", "/y/in");
    t.sync();
    assert!(!has_root_arc(&t, "/x/out", "/y/in"));

    let undo_seq = t.seq();
    t.handle.undo(t.client, undo_seq);
    t.sync();
    t.sync();
    assert!(has_root_arc(&t, "/x/out", "/y/in"));

    let redo_seq = t.seq();
    t.handle.redo(t.client, redo_seq);
    t.sync();
    t.sync();
    assert!(!has_root_arc(&t, "/x/out", "/y/in"));
}

#[test]
fn move_renames_subtree_and_arcs() {
    let mut t = TestEngine::new();
    t.create_block("/x", CONST_URI);
    t.create_block("/y", GAIN_URI);
    t.connect("/x/out", "/y/in");
    t.sync();

    let mv = t.seq();
    t.handle.mv(
        t.client,
        mv,
        Path::parse("/x").unwrap(),
        Path::parse("/z").unwrap(),
    );
    t.sync();
    assert_eq!(t.status_of(mv), Some(Status::Success));
    assert!(!t.store_contains("/x"));
    assert!(t.store_contains("/z"));
    assert!(t.store_contains("/z/out"));
    assert!(has_root_arc(&t, "/z/out", "/y/in"));
    t.run_cycles(1);
}

#[test]
fn copy_clones_a_block() {
    let mut t = TestEngine::new();
    t.create_block("/x", CONST_URI);
    t.sync();
    let seq = t.seq();
    t.handle.copy(
        t.client,
        seq,
        Uri::parse("ingen:/x").unwrap(),
        Uri::parse("ingen:/x2").unwrap(),
    );
    t.sync();
    assert_eq!(t.status_of(seq), Some(Status::Success));
    assert!(t.store_contains("/x2"));
    assert!(t.store_contains("/x2/out"));
}

#[test]
fn missing_objects_report_not_found() {
    let mut t = TestEngine::new();
    let c = t.connect("/nope/out", "/also/in");
    let d = t.delete("/nothing");
    t.sync();
    assert_eq!(t.status_of(c), Some(Status::NotFound));
    assert_eq!(t.status_of(d), Some(Status::NotFound));
}

#[test]
fn bad_poly_is_refused() {
    let mut t = TestEngine::new();
    t.create_graph("/g", 4);
    t.sync();
    let seq = t.seq();
    t.handle.set_property(
        t.client,
        seq,
        Uri::parse("ingen:/g").unwrap(),
        keys::uri(keys::POLYPHONY),
        Atom::Int(0),
    );
    t.sync();
    assert_eq!(t.status_of(seq), Some(Status::InvalidPoly));
}

#[test]
fn graph_disable_stops_its_blocks() {
    let mut t = TestEngine::new();
    t.create_graph("/g", 1);
    t.sync();
    t.create_block("/g/s", CONST_URI);
    t.sync();
    t.set_port_value("/g/s/value", 1.0);
    t.sync();
    t.run_cycles(1);
    assert_eq!(t.port_value("/g/s/out"), 1.0);

    let seq = t.seq();
    t.handle.set_property(
        t.client,
        seq,
        Uri::parse("ingen:/g").unwrap(),
        keys::uri(keys::ENABLED),
        Atom::Bool(false),
    );
    t.sync();
    assert_eq!(t.status_of(seq), Some(Status::Success));
    // While disabled, the blocks inside stop running: a value change no
    // longer reaches the output.
    t.set_port_value("/g/s/value", 0.3);
    t.sync();
    t.run_cycles(1);
    assert_eq!(t.port_value("/g/s/out"), 1.0);

    let seq = t.seq();
    t.handle.set_property(
        t.client,
        seq,
        Uri::parse("ingen:/g").unwrap(),
        keys::uri(keys::ENABLED),
        Atom::Bool(true),
    );
    t.sync();
    t.run_cycles(1);
    assert_eq!(t.port_value("/g/s/out"), 0.3);
}

#[test]
fn monitored_port_emits_value_notifications() {
    let mut t = TestEngine::new();
    t.create_block("/s", CONST_URI);
    t.sync();
    let seq = t.seq();
    t.handle.set_property(
        t.client,
        seq,
        Uri::parse("ingen:/s/value").unwrap(),
        keys::uri(keys::MONITORED),
        Atom::Bool(true),
    );
    t.set_port_value("/s/value", 0.7);
    t.sync();
    t.run_cycles(1);
    let notes = t.notes.lock().unwrap();
    assert!(notes
        .iter()
        .any(|n| *n == Note::PortValue("/s/value".into(), 0.7)));
}

#[test]
fn get_returns_a_recursive_snapshot() {
    let mut t = TestEngine::new();
    t.create_graph("/g", 1);
    t.sync();
    t.create_block("/g/s", CONST_URI);
    t.sync();
    let seq = t.seq();
    t.handle.get(t.client, seq, Uri::parse("ingen:/").unwrap());
    t.sync();
    let notes = t.notes.lock().unwrap();
    assert!(notes.iter().any(|n| *n == Note::Put("ingen:/g".into())));
    assert!(notes.iter().any(|n| *n == Note::Put("ingen:/g/s".into())));
    assert!(notes.iter().any(|n| *n == Note::Put("ingen:/g/s/out".into())));
}

#[test]
fn undo_is_inverse_over_random_event_sequences() {
    let mut t = TestEngine::new();
    t.create_block("/x", CONST_URI);
    t.create_block("/y", GAIN_URI);
    t.sync();

    let snapshot = |t: &TestEngine| {
        let store = t.engine.store();
        let paths: Vec<String> = store
            .lock()
            .unwrap()
            .iter()
            .map(|(p, _)| p.to_string())
            .collect();
        let arc = has_root_arc(t, "/x/out", "/y/in");
        let value = t.port_value("/x/value");
        (paths, arc, value)
    };

    let mut rng = rand::rngs::StdRng::seed_from_u64(0xACE5);
    let mut connected = false;
    for _ in 0..40 {
        let before = snapshot(&t);
        let op = rng.random_range(0..3);
        let seq = match op {
            0 => t.set_port_value("/x/value", rng.random_range(0..100) as f32 / 100.0),
            1 if !connected => t.connect("/x/out", "/y/in"),
            _ => t.disconnect("/x/out", "/y/in"),
        };
        t.sync();
        let status = t.status_of(seq).unwrap();
        if status != Status::Success {
            // Failed events must leave no trace and push no undo entry.
            assert_eq!(snapshot(&t), before);
            continue;
        }
        connected = has_root_arc(&t, "/x/out", "/y/in");

        let undo_seq = t.seq();
        t.handle.undo(t.client, undo_seq);
        t.sync();
        t.sync();
        assert_eq!(snapshot(&t), before, "undo of op {op} restored state");
        connected = has_root_arc(&t, "/x/out", "/y/in");
    }
}

#[test]
fn work_stealing_pool_matches_single_threaded_result() {
    let mut t = TestEngine::with_workers(2);
    for name in ["/a", "/b", "/c", "/d"] {
        t.create_block(name, CONST_URI);
    }
    t.create_block("/m", GAIN_URI);
    t.sync();
    for name in ["/a", "/b", "/c", "/d"] {
        t.connect(&format!("{name}/out"), "/m/in");
        t.set_port_value(&format!("{name}/value"), 0.25);
    }
    t.sync();
    t.run_cycles(4);
    assert!((t.port_value("/m/out") - 1.0).abs() < 1e-6);
}

#[test]
fn internal_blocks_run_in_the_engine() {
    let mut t = TestEngine::new();
    t.create_block("/c", CONTROLLER_URI);
    t.sync();
    t.run_cycles(2);
    assert!(t.store_contains("/c/output"));
    assert!(t.store_contains("/c/input"));
}
