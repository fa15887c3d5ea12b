use arbord::arbor::events::Event;
use arbord::arbor::util::error::ErrorKind;

use crate::support::Fixture;

#[test]
fn meta_cycle_and_idempotence() {
    let fix = Fixture::new();
    let ct = fix.create_meta("a");
    assert_eq!(fix.state_of("a"), "meta");

    ct.stop(&fix.holder, 0).expect("stop");
    assert_eq!(fix.state_of("a"), "stopped");

    let second = ct.stop(&fix.holder, 0).expect_err("second stop refused");
    assert_eq!(second.kind(), ErrorKind::InvalidState);

    fix.holder.destroy("a").expect("destroy");
    assert!(fix.holder.get("a").is_err());

    let again = fix.holder.destroy("a").expect_err("second destroy refused");
    assert_eq!(again.kind(), ErrorKind::InvalidValue);
}

#[test]
fn start_requires_stopped_state() {
    let fix = Fixture::new();
    let ct = fix.create_meta("a");
    let err = ct.start(&fix.holder, true).expect_err("double start refused");
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[test]
fn start_requires_a_command_for_non_meta() {
    let fix = Fixture::new();
    let ct = fix.create("empty");
    let err = ct.start(&fix.holder, false).expect_err("no command");
    assert_eq!(err.kind(), ErrorKind::InvalidValue);
    assert_eq!(fix.state_of("empty"), "stopped");
}

#[test]
fn start_requires_a_live_parent() {
    let fix = Fixture::new();
    fix.create("p");
    let child = fix.create("p/c");
    child
        .set_property(&fix.holder, "command", "/bin/sleep 3")
        .unwrap();
    let err = child.start(&fix.holder, false).expect_err("parent stopped");
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[test]
fn pause_resume_cycle() {
    let fix = Fixture::new();
    let ct = fix.create_meta("a");

    ct.pause(&fix.holder).expect("pause");
    assert_eq!(fix.state_of("a"), "paused");

    let err = ct.pause(&fix.holder).expect_err("second pause refused");
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    ct.resume(&fix.holder).expect("resume");
    assert_eq!(fix.state_of("a"), "meta");

    let err = ct.resume(&fix.holder).expect_err("second resume refused");
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[test]
fn task_runs_until_exit_is_delivered() {
    let fix = Fixture::new();
    let ct = fix.create("web");
    ct.set_property(&fix.holder, "command", "/bin/sleep 3")
        .unwrap();
    ct.set_property(&fix.holder, "memory_limit", "104857600")
        .unwrap();
    ct.start(&fix.holder, false).expect("start");

    assert_eq!(fix.state_of("web"), "running");
    let pid: i32 = ct
        .get_property(&fix.holder, "root_pid")
        .expect("root pid")
        .parse()
        .expect("numeric pid");
    assert!(pid > 0);
    assert!(arbord::arbor::util::pid_exists(nix::unistd::Pid::from_raw(
        pid
    )));

    fix.holder.deliver_event(&Event::Exit { pid, status: 0 });
    assert_eq!(fix.state_of("web"), "dead");
    assert_eq!(
        ct.get_property(&fix.holder, "exit_status").expect("status"),
        "0"
    );
    assert_eq!(
        ct.get_property(&fix.holder, "oom_killed").expect("oom flag"),
        "false"
    );

    ct.stop(&fix.holder, 0).expect("stop dead container");
    fix.holder.destroy("web").expect("destroy");
}

#[test]
fn signal_exit_status_is_recorded() {
    let fix = Fixture::new();
    let ct = fix.create("sig");
    ct.set_property(&fix.holder, "command", "/bin/sleep 3")
        .unwrap();
    ct.start(&fix.holder, false).expect("start");

    let pid: i32 = ct
        .get_property(&fix.holder, "root_pid")
        .unwrap()
        .parse()
        .unwrap();
    // killed by SIGKILL, kernel encoding
    fix.holder.deliver_event(&Event::Exit { pid, status: 9 });
    assert_eq!(fix.state_of("sig"), "dead");
    assert_eq!(ct.get_property(&fix.holder, "exit_status").unwrap(), "9");
}

#[test]
fn aged_dead_container_is_swept_to_stopped() {
    let fix = Fixture::new();
    let ct = fix.create("old");
    ct.set_property(&fix.holder, "command", "/bin/sleep 3")
        .unwrap();
    ct.set_property(&fix.holder, "aging_time", "0").unwrap();
    ct.start(&fix.holder, false).expect("start");

    let pid: i32 = ct
        .get_property(&fix.holder, "root_pid")
        .unwrap()
        .parse()
        .unwrap();
    fix.holder.deliver_event(&Event::Exit { pid, status: 0 });
    assert_eq!(fix.state_of("old"), "dead");
    assert!(ct.can_remove_dead());

    fix.holder.heartbeat();
    assert_eq!(fix.state_of("old"), "stopped");
}

#[test]
fn respawn_counts_up_to_the_limit() {
    let fix = Fixture::new();
    let ct = fix.create("rr");
    ct.set_property(&fix.holder, "command", "/bin/sleep 3")
        .unwrap();
    ct.set_property(&fix.holder, "respawn", "true").unwrap();
    ct.set_property(&fix.holder, "max_respawns", "3").unwrap();
    ct.start(&fix.holder, false).expect("start");

    for round in 0..4 {
        let pid: i32 = ct
            .get_property(&fix.holder, "root_pid")
            .unwrap()
            .parse()
            .unwrap();
        fix.holder.deliver_event(&Event::Exit { pid, status: 256 });
        assert_eq!(fix.state_of("rr"), "dead");

        if round < 3 {
            assert!(ct.may_respawn(), "round {} should respawn", round);
            ct.respawn(&fix.holder).expect("respawn");
            assert_eq!(fix.state_of("rr"), "running");
        }
    }

    assert!(!ct.may_respawn());
    assert_eq!(ct.get_property(&fix.holder, "respawn_count").unwrap(), "3");
    assert_eq!(fix.state_of("rr"), "dead");
}

#[test]
fn weak_container_destruction_goes_through_the_queue() {
    let fix = Fixture::new();
    let ct = fix.create("w");
    ct.set_property(&fix.holder, "weak", "true").unwrap();

    ct.destroy_weak(&fix.holder);
    let due = fix.holder.queue().take_due();
    assert_eq!(
        due,
        vec![Event::DestroyWeak {
            name: "w".to_string()
        }]
    );
    for event in due {
        fix.holder.deliver_event(&event);
    }
    assert!(fix.holder.get("w").is_err());
}

#[test]
fn kill_requires_a_running_container() {
    let fix = Fixture::new();
    let ct = fix.create_meta("m");
    let err = ct
        .kill(nix::sys::signal::Signal::SIGTERM)
        .expect_err("meta has no task");
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}
