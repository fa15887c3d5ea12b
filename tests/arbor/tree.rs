use arbord::arbor::events::Event;
use arbord::arbor::util::error::ErrorKind;

use crate::support::Fixture;

#[test]
fn names_resolve_to_parents() {
    let fix = Fixture::new();
    fix.create_meta("parent");
    let child = fix.create("parent/child");
    assert_eq!(child.parent.as_ref().unwrap().name, "parent");
    assert_eq!(child.level, 3);

    let err = fix
        .holder
        .create("ghost/child", 0, 0, &[])
        .expect_err("missing parent");
    assert_eq!(err.kind(), ErrorKind::InvalidValue);

    let err = fix
        .holder
        .create("parent", 0, 0, &[])
        .expect_err("duplicate");
    assert_eq!(err.kind(), ErrorKind::ContainerAlreadyExists);
}

#[test]
fn listing_is_sorted_and_complete() {
    let fix = Fixture::new();
    fix.create("b");
    fix.create("a");
    fix.create_meta("c");
    fix.create("c/d");

    assert_eq!(
        fix.holder.list(),
        vec!["/", "/arbor", "a", "b", "c", "c/d"]
    );
}

#[test]
fn destroy_refuses_children_and_system_containers() {
    let fix = Fixture::new();
    fix.create_meta("parent");
    let child = fix.create("parent/child");
    child
        .set_property(&fix.holder, "command", "/bin/true")
        .unwrap();

    let err = fix.holder.destroy("parent").expect_err("has children");
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let err = fix.holder.destroy("/").expect_err("root is off limits");
    assert_eq!(err.kind(), ErrorKind::Permission);

    drop(child);
    fix.holder.destroy("parent/child").expect("destroy child");
    fix.holder.destroy("parent").expect("destroy parent");
    assert_eq!(fix.holder.list(), vec!["/", "/arbor"]);
}

#[test]
fn exit_reaps_the_whole_subtree() {
    let fix = Fixture::new();
    let parent = fix.create_meta("parent");
    let child = fix.create("parent/child");
    child
        .set_property(&fix.holder, "command", "/bin/sleep 3")
        .unwrap();
    child.start(&fix.holder, false).unwrap();
    assert_eq!(fix.state_of("parent"), "meta");
    assert_eq!(fix.state_of("parent/child"), "running");

    let pid: i32 = child
        .get_property(&fix.holder, "root_pid")
        .unwrap()
        .parse()
        .unwrap();
    fix.holder.deliver_event(&Event::Exit { pid, status: 0 });

    assert_eq!(fix.state_of("parent/child"), "dead");
    assert_eq!(fix.state_of("parent"), "meta");

    // reaping the parent folds the dead child in first
    parent.exit(&fix.holder, 0, false);
    assert_eq!(fix.state_of("parent"), "stopped");
}

#[test]
fn pause_refuses_acquired_descendants() {
    let fix = Fixture::new();
    let parent = fix.create_meta("parent");
    let child = fix.create("parent/child");

    assert!(child.acquire());
    let err = parent.pause(&fix.holder).expect_err("child is busy");
    assert_eq!(err.kind(), ErrorKind::Busy);
    child.release();

    parent.pause(&fix.holder).expect("pause");
    parent.resume(&fix.holder).expect("resume");
}

#[test]
fn destroy_of_acquired_container_is_busy() {
    let fix = Fixture::new();
    let ct = fix.create("busy");
    assert!(ct.acquire());
    let err = fix.holder.destroy("busy").expect_err("acquired");
    assert_eq!(err.kind(), ErrorKind::Busy);
    ct.release();
    fix.holder.destroy("busy").expect("destroy after release");
}

#[test]
fn meta_soft_limit_follows_running_children() {
    let fix = Fixture::new();
    let meta = fix.create_meta("m");

    let root_knob = fix
        .cgroup_root()
        .join("memory/memory.soft_limit_in_bytes");
    std::fs::write(&root_knob, "9223372036854771712\n").unwrap();
    let meta_knob = fix
        .cgroup_root()
        .join("memory/arbor/m/memory.soft_limit_in_bytes");
    std::fs::write(&meta_knob, "9223372036854771712\n").unwrap();

    meta.update_soft_limit(&fix.holder).unwrap();
    assert_eq!(
        std::fs::read_to_string(&meta_knob).unwrap(),
        (1u64 << 20).to_string()
    );

    let child = fix.create("m/c");
    child
        .set_property(&fix.holder, "command", "/bin/sleep 3")
        .unwrap();
    child.start(&fix.holder, false).unwrap();
    assert_eq!(
        std::fs::read_to_string(&meta_knob).unwrap(),
        "9223372036854771712"
    );
}

#[test]
fn deep_trees_stop_at_the_level_limit() {
    let fix = Fixture::new();
    let mut name = String::new();
    for segment in ["a", "b", "c", "d", "e", "f", "g"] {
        if !name.is_empty() {
            name.push('/');
        }
        name.push_str(segment);
        if name.len() == 1 {
            fix.create_meta(&name);
        } else if name.len() < 13 {
            let ct = fix.create(&name);
            ct.start(&fix.holder, true).unwrap();
        } else {
            fix.create(&name);
        }
    }

    let err = fix
        .holder
        .create("a/b/c/d/e/f/g/h", 0, 0, &[])
        .expect_err("too deep");
    assert_eq!(err.kind(), ErrorKind::InvalidValue);
}
