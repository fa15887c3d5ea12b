use arbord::arbor::util::error::ErrorKind;

use crate::support::Fixture;

#[test]
fn static_properties_lock_after_start() {
    let fix = Fixture::new();
    let ct = fix.create_meta("a");

    let err = ct
        .set_property(&fix.holder, "command", "/bin/true")
        .expect_err("command is static");
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    // dynamic properties stay settable on a live container
    ct.set_property(&fix.holder, "memory_limit", "104857600")
        .expect("memory_limit is dynamic");
    assert_eq!(
        ct.get_property(&fix.holder, "memory_limit").unwrap(),
        "104857600"
    );
}

#[test]
fn unknown_and_read_only_properties_are_refused() {
    let fix = Fixture::new();
    let ct = fix.create("a");

    let err = ct
        .set_property(&fix.holder, "bogus", "1")
        .expect_err("unknown property");
    assert_eq!(err.kind(), ErrorKind::InvalidProperty);

    let err = ct
        .set_property(&fix.holder, "exit_status", "0")
        .expect_err("read-only property");
    assert_eq!(err.kind(), ErrorKind::InvalidProperty);

    let err = ct
        .get_property(&fix.holder, "bogus")
        .expect_err("unknown property");
    assert_eq!(err.kind(), ErrorKind::InvalidProperty);
}

#[test]
fn system_containers_are_read_only() {
    let fix = Fixture::new();
    let root = fix.holder.get("/").unwrap();
    let err = root
        .set_property(&fix.holder, "memory_limit", "1")
        .expect_err("root is read only");
    assert_eq!(err.kind(), ErrorKind::Permission);
    assert_eq!(fix.state_of("/"), "meta");
}

#[test]
fn bad_values_leave_no_trace() {
    let fix = Fixture::new();
    let ct = fix.create("a");

    assert!(ct
        .set_property(&fix.holder, "memory_limit", "plenty")
        .is_err());
    assert_eq!(ct.get_property(&fix.holder, "memory_limit").unwrap(), "0");

    assert!(ct.set_property(&fix.holder, "cpu_policy", "warp").is_err());
    assert_eq!(ct.get_property(&fix.holder, "cpu_policy").unwrap(), "normal");
}

#[test]
fn snapshot_is_written_on_every_mutation() {
    let fix = Fixture::new();
    let ct = fix.create("web");
    ct.set_property(&fix.holder, "command", "/bin/sleep 3")
        .unwrap();
    ct.set_property(&fix.holder, "env", "A=1;B=2").unwrap();
    ct.set_property(&fix.holder, "memory_limit", "104857600")
        .unwrap();

    let node = fix.holder.kv().node(ct.id).load().expect("kv node");
    assert_eq!(node["id"], ct.id.to_string());
    assert_eq!(node["name"], "web");
    assert_eq!(node["state"], "stopped");
    assert_eq!(node["command"], "/bin/sleep 3");
    assert_eq!(node["env"], "A=1;B=2");
    assert_eq!(node["memory_limit"], "104857600");
    // unset properties never appear
    assert!(!node.contains_key("hostname"));
}

#[test]
fn capabilities_above_the_ceiling_need_a_memory_limit() {
    let fix = Fixture::new();
    let ct = fix
        .holder
        .create("cap", 12345, 12345, &[])
        .expect("create container");
    ct.set_property(&fix.holder, "isolate", "false").unwrap();
    ct.set_property(&fix.holder, "command", "/bin/sleep 3")
        .unwrap();
    ct.set_property(&fix.holder, "capabilities", "CAP_SYS_ADMIN")
        .unwrap();

    let err = ct.start(&fix.holder, false).expect_err("needs memory limit");
    assert_eq!(err.kind(), ErrorKind::Permission);
    assert!(err.context().contains("memory limit"), "{}", err);
    assert_eq!(fix.state_of("cap"), "stopped");
}

#[test]
fn access_level_never_widens_down_the_tree() {
    let fix = Fixture::new();
    let parent = fix.create("p");
    parent
        .set_property(&fix.holder, "access_level", "read-only")
        .unwrap();

    let child = fix.create("p/c");
    assert_eq!(
        child.get_property(&fix.holder, "access_level").unwrap(),
        "read-only"
    );

    // widening the child is accepted at set time and clamped on start
    child
        .set_property(&fix.holder, "access_level", "normal")
        .unwrap();
    parent.start(&fix.holder, true).unwrap();
    child.start(&fix.holder, true).unwrap();
    assert_eq!(
        child.get_property(&fix.holder, "access_level").unwrap(),
        "read-only"
    );
}

#[test]
fn cgroup_passthrough_reads_need_a_live_container() {
    let fix = Fixture::new();
    let ct = fix.create("a");

    let err = ct
        .get_property(&fix.holder, "memory.usage_in_bytes")
        .expect_err("stopped container");
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    ct.start(&fix.holder, true).unwrap();
    let memcg = fix
        .cgroup_root()
        .join("memory/arbor/a/memory.usage_in_bytes");
    std::fs::write(&memcg, "4096\n").unwrap();
    assert_eq!(
        ct.get_property(&fix.holder, "memory.usage_in_bytes").unwrap(),
        "4096\n"
    );

    let err = ct
        .get_property(&fix.holder, "memory.made_up_knob")
        .expect_err("unknown knob");
    assert_eq!(err.kind(), ErrorKind::InvalidProperty);
}
