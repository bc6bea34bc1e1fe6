#![forbid(unsafe_code)]

use bastion_core::{LabelQuery, ListOptions, Phase, StateError};
use bastion_resources::network::ProbeStatusSpec;
use bastion_resources::secrets::CertSanSpec;
use bastion_resources::time::TimeStatusSpec;
use bastion_resources::{Resource, ResourceRegistry, TypedSpec};
use bastion_store::{safe, Event, State, StateOptions, Writer};

fn state() -> State { State::new(ResourceRegistry::with_all()) }

fn status(id: &str, success: bool) -> Resource { Resource::new(id, ProbeStatusSpec { success, last_error: String::new() }) }

#[test]
fn versions_increase_on_every_accepted_update() {
    let st = state();
    let r1 = st.create(status("a", false)).unwrap();
    let mut next = r1.clone();
    next.spec = ProbeStatusSpec { success: true, last_error: String::new() }.into_spec();
    let r2 = st.update(r1.metadata.version, next.clone()).unwrap();
    assert!(r2.metadata.version > r1.metadata.version);

    let err = st.update(r1.metadata.version, next).unwrap_err();
    assert!(err.is_conflict());

    assert!(st.create(status("a", true)).unwrap_err().is_already_exists());
    assert!(st.get(&ProbeStatusSpec::resource_id("missing")).unwrap_err().is_not_found());
}

#[test]
fn unregistered_kinds_are_rejected() {
    let mut reg = ResourceRegistry::new();
    reg.register::<CertSanSpec>();
    let st = State::new(reg);
    let err = st.create(status("a", true)).unwrap_err();
    assert_eq!(err, StateError::UnknownKind(ProbeStatusSpec::KIND));
}

#[test]
fn only_the_owner_mutates() {
    let st = state();
    let owned = st.as_owner("ProbeController");
    let r = owned.create(status("a", true)).unwrap();
    assert_eq!(r.metadata.owner, "ProbeController");

    let user = st.as_owner("");
    let err = user.update(r.metadata.version, status("a", false)).unwrap_err();
    assert!(matches!(err, StateError::OwnershipViolation { .. }));
    assert!(matches!(user.destroy(&r.pointer()).unwrap_err(), StateError::OwnershipViolation { .. }));

    let err = safe::modify::<ProbeStatusSpec, _, _, StateError>(&st.as_owner("Other"), "a", |s| {
        s.success = false;
        Ok(())
    })
    .unwrap_err();
    assert!(matches!(err, StateError::OwnershipViolation { .. }));
}

#[test]
fn finalizers_gate_destroy_and_teardown_keeps_resource_readable() {
    let st = state();
    let w = st.as_owner("owner");
    let r = w.create(status("a", true)).unwrap();
    let id = r.pointer();

    st.add_finalizer(&id, "consumer").unwrap();
    st.add_finalizer(&id, "consumer").unwrap();
    let with_fin = st.get(&id).unwrap();
    assert_eq!(with_fin.metadata.finalizers.len(), 1);
    assert!(with_fin.metadata.version > r.metadata.version);

    assert!(!w.teardown(&id).unwrap());
    let torn = st.get(&id).unwrap();
    assert_eq!(torn.metadata.phase, Phase::TearingDown);
    assert!(matches!(w.destroy(&id).unwrap_err(), StateError::HasFinalizers { .. }));
    assert!(matches!(st.add_finalizer(&id, "late").unwrap_err(), StateError::PhaseConflict { .. }));

    st.remove_finalizer(&id, "consumer").unwrap();
    assert!(w.teardown(&id).unwrap());
    w.destroy(&id).unwrap();
    assert!(st.get(&id).unwrap_err().is_not_found());
}

#[test]
fn repeated_modify_bumps_version_once() {
    let st = state();
    let w = st.as_owner("TimeSyncController");
    let set = |s: &mut TimeStatusSpec| -> Result<(), StateError> {
        s.synced = true;
        s.epoch = 2;
        Ok(())
    };
    let first = safe::modify(&w, "node", set).unwrap();
    let second = safe::modify(&w, "node", set).unwrap();
    let third = safe::modify(&w, "node", set).unwrap();
    assert_eq!(first.metadata.version, second.metadata.version);
    assert_eq!(second.metadata.version, third.metadata.version);
    assert!(third.spec.synced);
}

#[test]
fn list_is_sorted_and_filtered() {
    let st = state();
    for id in ["eth1", "eth0", "lo"] {
        let mut r = status(id, true);
        if id != "lo" {
            r.metadata.labels.insert("physical".into(), "true".into());
        }
        st.create(r).unwrap();
    }
    let all = st.list("network", ProbeStatusSpec::KIND, &ListOptions::default()).unwrap();
    let ids: Vec<_> = all.iter().map(|r| r.metadata.id.as_str()).collect();
    assert_eq!(ids, vec!["eth0", "eth1", "lo"]);

    let physical = ListOptions::with_labels(LabelQuery::default().exists("physical"));
    assert_eq!(safe::list::<ProbeStatusSpec, _>(&st, &physical).unwrap().len(), 2);

    let by_re = ListOptions::default().with_id_regex(regex::Regex::new("^lo$").unwrap());
    assert_eq!(safe::list::<ProbeStatusSpec, _>(&st, &by_re).unwrap().len(), 1);
}

#[test]
fn typed_access_detects_kind_mismatch() {
    let st = state();
    st.create(status("a", true)).unwrap();
    let err = safe::get_by_id::<TimeStatusSpec, _>(&st, &ProbeStatusSpec::resource_id("a")).unwrap_err();
    assert!(matches!(err, StateError::TypeMismatch { .. }));
    assert!(safe::get_opt::<ProbeStatusSpec, _>(&st, "b").unwrap().is_none());
}

#[test]
fn update_with_conflicts_requires_existing_resource() {
    let st = state();
    let w = st.as_owner("");
    let err = safe::update_with_conflicts::<ProbeStatusSpec, _, _, StateError>(&w, "a", |_| Ok(())).unwrap_err();
    assert!(err.is_not_found());

    w.create(status("a", false)).unwrap();
    let mut calls = 0;
    let r = safe::update_with_conflicts::<ProbeStatusSpec, _, _, StateError>(&w, "a", |s| {
        calls += 1;
        s.success = true;
        Ok(())
    })
    .unwrap();
    assert!(r.spec.success);
    assert_eq!(calls, 1);
}

#[tokio::test]
async fn watch_delivers_snapshot_then_commits_in_order() {
    let st = state();
    st.create(status("b", true)).unwrap();
    st.create(status("a", true)).unwrap();

    let mut w = st.watch_kind("network", ProbeStatusSpec::KIND, ListOptions::default()).unwrap();
    let r = st.get(&ProbeStatusSpec::resource_id("a")).unwrap();
    st.update(r.metadata.version, status("a", false)).unwrap();
    st.destroy(&ProbeStatusSpec::resource_id("b"), "", None).unwrap();

    let mut seen = Vec::new();
    for _ in 0..5 {
        let ev = w.recv().await.unwrap();
        seen.push((ev.kind_str(), ev.resource().map(|r| r.metadata.id.clone())));
    }
    assert_eq!(
        seen,
        vec![
            ("created", Some("a".to_string())),
            ("created", Some("b".to_string())),
            ("bootstrapped", None),
            ("updated", Some("a".to_string())),
            ("destroyed", Some("b".to_string())),
        ]
    );
}

#[tokio::test]
async fn single_id_watch_ignores_other_ids() {
    let st = state();
    let mut w = st.watch(&ProbeStatusSpec::resource_id("a")).unwrap();
    st.create(status("b", true)).unwrap();
    st.create(status("a", true)).unwrap();
    assert_eq!(w.recv().await, Some(Event::Bootstrapped));
    match w.recv().await {
        Some(Event::Created(r)) => assert_eq!(r.metadata.id, "a"),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn overflowing_watcher_is_closed_with_error() {
    let st = State::with_options(ResourceRegistry::with_all(), StateOptions { watch_buffer: 1 });
    let mut w = st.watch_kind("network", ProbeStatusSpec::KIND, ListOptions::default()).unwrap();
    for id in ["a", "b", "c"] {
        st.create(status(id, true)).unwrap();
    }
    assert_eq!(w.recv().await, Some(Event::Bootstrapped));
    assert!(matches!(w.recv().await, Some(Event::Created(_))));
    assert_eq!(w.recv().await, Some(Event::Errored(StateError::WatchOverflow)));
    assert_eq!(w.recv().await, None);
}
