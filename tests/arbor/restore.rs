use crate::support::Fixture;

#[test]
fn configuration_survives_a_slave_restart() {
    let fix = Fixture::new();
    let ct = fix.create("web");
    ct.set_property(&fix.holder, "command", "/bin/sleep 3")
        .unwrap();
    ct.set_property(&fix.holder, "memory_limit", "104857600")
        .unwrap();
    ct.set_property(&fix.holder, "env", "MODE=prod").unwrap();
    ct.set_property(&fix.holder, "respawn", "true").unwrap();
    let id = ct.id;
    drop(ct);

    let fix = fix.restart();
    let ct = fix.holder.get("web").expect("restored");
    assert_eq!(ct.id, id);
    assert_eq!(fix.state_of("web"), "stopped");
    assert_eq!(
        ct.get_property(&fix.holder, "command").unwrap(),
        "/bin/sleep 3"
    );
    assert_eq!(
        ct.get_property(&fix.holder, "memory_limit").unwrap(),
        "104857600"
    );
    assert_eq!(ct.get_property(&fix.holder, "env").unwrap(), "MODE=prod");
    assert_eq!(ct.get_property(&fix.holder, "respawn").unwrap(), "true");
    assert_eq!(
        ct.get_property(&fix.holder, "isolate").unwrap(),
        "false"
    );
}

#[test]
fn parents_restore_before_children() {
    let fix = Fixture::new();
    fix.create_meta("p");
    let child = fix.create("p/c");
    child
        .set_property(&fix.holder, "private", "leaf")
        .unwrap();
    drop(child);

    let fix = fix.restart();
    let parent = fix.holder.get("p").expect("parent restored");
    let child = fix.holder.get("p/c").expect("child restored");
    assert!(parent.id < child.id);
    assert_eq!(
        child.get_property(&fix.holder, "private").unwrap(),
        "leaf"
    );
    assert_eq!(child.parent.as_ref().unwrap().name, "p");
}

#[test]
fn live_meta_state_is_reconciled_with_the_freezer() {
    let fix = Fixture::new();
    fix.create_meta("m");
    assert_eq!(fix.state_of("m"), "meta");

    // the freezer cgroup survives the restart, so the container is
    // still considered live
    let fix = fix.restart();
    assert_eq!(fix.state_of("m"), "meta");
}

#[test]
fn recorded_running_state_without_a_freezer_degrades_to_stopped() {
    let fix = Fixture::new();
    let ct = fix.create("gone");
    ct.set_property(&fix.holder, "command", "/bin/sleep 3")
        .unwrap();
    ct.start(&fix.holder, false).unwrap();
    assert_eq!(fix.state_of("gone"), "running");

    // wipe the kernel side, as a reboot would
    std::fs::remove_dir_all(fix.cgroup_root()).unwrap();
    drop(ct);

    let fix = fix.restart();
    assert_eq!(fix.state_of("gone"), "stopped");
}

#[test]
fn destroyed_containers_leave_no_node_behind() {
    let fix = Fixture::new();
    let ct = fix.create("tmp");
    let id = ct.id;
    assert!(fix.holder.kv().node(id).exists());
    drop(ct);
    fix.holder.destroy("tmp").unwrap();
    assert!(!fix.holder.kv().node(id).exists());

    let fix = fix.restart();
    assert!(fix.holder.get("tmp").is_err());
}

#[test]
fn broken_nodes_are_dropped_not_fatal() {
    let fix = Fixture::new();
    fix.create("ok");

    // a node with no name is unrecoverable
    std::fs::write(fix.holder.kv().root().join("99"), "state = running\n").unwrap();

    let fix = fix.restart();
    assert!(fix.holder.get("ok").is_ok());
    assert!(!fix.holder.kv().node(99).exists());
}
