/*
 * Copyright (C) 2025 The Arbor Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! The master/slave split. The master is the subreaper: it peeks every
//! descendant exit with waitid(WNOWAIT), forwards `(pid, status)` pairs
//! to the slave over the event pipe and holds the wait status until the
//! slave acknowledges the pid over the ack pipe. A slave crash therefore
//! loses no exit: unacknowledged statuses are replayed into the next
//! slave's pipe. On update the master snapshots the pending map to disk
//! and re-execs itself.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::path::Path;

use log::{error, info, warn};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{waitid, waitpid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, pipe2, ForkResult, Pid};
use serde::{Deserialize, Serialize};

use crate::arbor::config::Config;
use crate::arbor::events::{EpollLoop, SourceTag};
use crate::arbor::util::current_time_ms;
use crate::arbor::util::error::{ArborError, Result};
use crate::arbor::util::wait_deadline;
use crate::arbor::{REAP_ACK_FD, REAP_EVT_FD};

/// Exit statuses the master has seen but the slave has not yet recorded.
/// Acks may arrive before the corresponding exit is peeked (the slave saw
/// the pid through a race), so both directions are remembered.
#[derive(Debug, Default)]
pub struct ReapMap {
    exited: BTreeMap<i32, i32>,
    acked: BTreeMap<i32, ()>,
}

impl ReapMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a peeked exit. Returns false when the pid is already
    /// pending or was pre-acknowledged, meaning it must not be forwarded
    /// again (a pre-acknowledged pid is reaped immediately).
    pub fn record_exit(&mut self, pid: i32, status: i32) -> RecordOutcome {
        if self.acked.remove(&pid).is_some() {
            return RecordOutcome::AlreadyAcked;
        }
        if self.exited.contains_key(&pid) {
            return RecordOutcome::Duplicate;
        }
        self.exited.insert(pid, status);
        RecordOutcome::Forward
    }

    /// Handles an ack from the slave. Returns true when the pid may now
    /// be reaped with waitpid.
    pub fn record_ack(&mut self, pid: i32) -> bool {
        if self.exited.remove(&pid).is_some() {
            return true;
        }
        warn!("acknowledge for unknown pid {}", pid);
        self.acked.insert(pid, ());
        false
    }

    pub fn pending(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        self.exited.iter().map(|(pid, status)| (*pid, *status))
    }

    pub fn len(&self) -> usize {
        self.exited.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exited.is_empty()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RecordOutcome {
    /// New exit, forward to the slave.
    Forward,
    /// Already queued, skip.
    Duplicate,
    /// The slave already recorded it, reap right away.
    AlreadyAcked,
}

#[derive(Debug, Serialize, Deserialize)]
struct PidMapEntry {
    pid: i32,
    status: i32,
}

/// Snapshot of unacknowledged statuses carried across a master re-exec.
pub fn save_pidmap(map: &ReapMap, path: &Path) -> Result<()> {
    let entries: Vec<PidMapEntry> = map
        .pending()
        .map(|(pid, status)| PidMapEntry { pid, status })
        .collect();
    let text = serde_json::to_string(&entries)
        .map_err(|err| ArborError::unknown(format!("serialize pidmap: {}", err)))?;
    std::fs::write(path, text).map_err(|err| ArborError::from(err).wrap("write pidmap"))?;
    Ok(())
}

pub fn load_pidmap(path: &Path) -> ReapMap {
    let mut map = ReapMap::new();
    let Ok(text) = std::fs::read_to_string(path) else {
        return map;
    };
    let _ = std::fs::remove_file(path);
    match serde_json::from_str::<Vec<PidMapEntry>>(&text) {
        Ok(entries) => {
            for entry in entries {
                map.exited.insert(entry.pid, entry.status);
            }
        }
        Err(err) => warn!("cannot parse pidmap: {}", err),
    }
    map
}

fn encode_wait_status(status: WaitStatus) -> Option<(i32, i32)> {
    match status {
        WaitStatus::Exited(pid, code) => Some((pid.as_raw(), code << 8)),
        WaitStatus::Signaled(pid, sig, dumped) => {
            Some((pid.as_raw(), (sig as i32) | if dumped { 0x80 } else { 0 }))
        }
        _ => None,
    }
}

fn reap(pid: i32) {
    let _ = waitpid(Pid::from_raw(pid), None);
}

fn deliver_pid_status(evt_fd: BorrowedFd, pid: i32, status: i32, queued: usize) {
    info!("deliver {} status {} ({} queued)", pid, status, queued);
    let mut buf = [0u8; 8];
    buf[..4].copy_from_slice(&pid.to_ne_bytes());
    buf[4..].copy_from_slice(&status.to_ne_bytes());
    if let Err(errno) = nix::unistd::write(evt_fd, &buf) {
        error!("write(status pipe): {}", errno);
    }
}

/// Peeks every reapable descendant without consuming the status. Slave
/// exits end the current slave generation and return its status.
fn reap_dead(evt_fd: BorrowedFd, map: &mut ReapMap, slave_pid: i32) -> Option<i32> {
    loop {
        let status = match waitid(
            Id::All,
            WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT,
        ) {
            Ok(status) => status,
            Err(Errno::ECHILD) => return None,
            Err(errno) => {
                error!("waitid: {}", errno);
                return None;
            }
        };

        let Some((pid, encoded)) = encode_wait_status(status) else {
            return None;
        };
        if pid <= 0 {
            return None;
        }

        if pid == slave_pid {
            reap(pid);
            return Some(encoded);
        }

        match map.record_exit(pid, encoded) {
            RecordOutcome::Forward => deliver_pid_status(evt_fd, pid, encoded, map.len()),
            RecordOutcome::AlreadyAcked => reap(pid),
            RecordOutcome::Duplicate => return None,
        }
    }
}

fn receive_acks(ack_fd: BorrowedFd, map: &mut ReapMap) -> usize {
    let mut count = 0;
    let mut buf = [0u8; 4];
    loop {
        match nix::unistd::read(&ack_fd, &mut buf) {
            Ok(4) => {
                let pid = i32::from_ne_bytes(buf);
                if pid <= 0 {
                    continue;
                }
                if map.record_ack(pid) {
                    reap(pid);
                    info!("acknowledged {} ({} queued)", pid, map.len());
                }
                count += 1;
            }
            Ok(_) => break,
            Err(Errno::EAGAIN) => break,
            Err(errno) => {
                error!("read(ack pipe): {}", errno);
                break;
            }
        }
    }
    count
}

/// Writes one recorded pid back to the master. Failure is unrecoverable:
/// losing an ack would leak a zombie forever, so the process dies and the
/// external supervisor restarts the daemon cleanly.
pub fn ack_exit_status(pid: i32) {
    if pid == 0 {
        return;
    }
    let fd = unsafe { BorrowedFd::borrow_raw(REAP_ACK_FD) };
    match nix::unistd::write(fd, &pid.to_ne_bytes()) {
        Ok(4) => info!("acknowledge exit status for {}", pid),
        other => {
            error!("cannot acknowledge exit status for {}: {:?}", pid, other);
            std::process::abort();
        }
    }
}

/// Drains `(pid, status)` pairs queued by the master. Called first in
/// every slave loop iteration so clients observe up-to-date state.
pub fn drain_exit_events(mut sink: impl FnMut(i32, i32)) -> usize {
    let fd = unsafe { BorrowedFd::borrow_raw(REAP_EVT_FD) };
    let mut drained = 0;
    let mut buf = [0u8; 8];
    // bounded, the pipe may be refilled while we read
    for _ in 0..1000 {
        match nix::unistd::read(&fd, &mut buf) {
            Ok(8) => {
                let pid = i32::from_ne_bytes(buf[..4].try_into().expect("fixed slice"));
                let status = i32::from_ne_bytes(buf[4..].try_into().expect("fixed slice"));
                sink(pid, status);
                drained += 1;
            }
            Ok(0) => break,
            Ok(n) => {
                error!("short read from status pipe: {} bytes", n);
                break;
            }
            Err(Errno::EAGAIN) => break,
            Err(errno) => {
                error!("read(status pipe): {}", errno);
                break;
            }
        }
    }
    drained
}

fn blocked_signalfd() -> Result<SignalFd> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.add(Signal::SIGHUP);
    mask.add(Signal::SIGCHLD);
    mask.thread_block()
        .map_err(|errno| ArborError::from(errno).wrap("block signals"))?;
    SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
        .map_err(|errno| ArborError::from(errno).wrap("signalfd"))
}

/// One slave generation: fork, wire the pipes onto the fixed
/// descriptors, replay unacknowledged statuses, then pump acks and
/// signals until the slave exits or a termination signal arrives.
fn spawn_slave(
    map: &mut ReapMap,
    slave_entry: &dyn Fn() -> i32,
    sigfd: &mut SignalFd,
    epoll: &EpollLoop,
) -> Result<SlaveOutcome> {
    let (evt_read, evt_write) =
        pipe2(OFlag::O_NONBLOCK).map_err(|errno| ArborError::from(errno).wrap("event pipe"))?;
    let (ack_read, ack_write) =
        pipe2(OFlag::O_NONBLOCK).map_err(|errno| ArborError::from(errno).wrap("ack pipe"))?;

    let slave_pid = match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            drop(evt_read);
            drop(ack_write);
            child.as_raw()
        }
        Ok(ForkResult::Child) => {
            drop(evt_write);
            drop(ack_read);
            unsafe {
                libc::dup2(evt_read.as_raw_fd(), REAP_EVT_FD);
                libc::dup2(ack_write.as_raw_fd(), REAP_ACK_FD);
            }
            drop(evt_read);
            drop(ack_write);
            std::process::exit(slave_entry());
        }
        Err(errno) => return Err(ArborError::from(errno).wrap("fork slave")),
    };

    info!("spawned slave {}", slave_pid);

    for (pid, status) in map.pending().collect::<Vec<_>>() {
        deliver_pid_status(evt_write.as_fd_ref(), pid, status, map.len());
    }

    epoll.add_source(ack_read.as_raw_fd(), SourceTag::Fixed)?;
    epoll.add_source(sigfd.as_raw_fd(), SourceTag::Fixed)?;

    let outcome = loop {
        let ready = epoll.wait(None)?;

        let mut termination = None;
        let mut update = false;
        while let Ok(Some(info)) = sigfd.read_signal() {
            match info.ssi_signo as i32 {
                libc::SIGINT | libc::SIGTERM => {
                    termination = Some(info.ssi_signo as i32);
                }
                libc::SIGHUP => update = true,
                libc::SIGCHLD => {}
                other => warn!("unexpected signal: {}", other),
            }
        }

        if update {
            info!("updating");
            if let Err(err) = save_pidmap(map, &Config::PidMapFile.get_path()) {
                error!("cannot snapshot pidmap: {}", err);
            }
            if kill(Pid::from_raw(slave_pid), Signal::SIGHUP).is_ok() {
                reap(slave_pid);
            }
            break SlaveOutcome::Update;
        }

        if let Some(signo) = termination {
            if kill(Pid::from_raw(slave_pid), Signal::try_from(signo).ok()).is_err() {
                error!("cannot signal slave");
            }
            info!("waiting for slave to exit");
            let deadline = current_time_ms() + 1000;
            loop {
                match waitpid(Pid::from_raw(slave_pid), Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::StillAlive) => {}
                    _ => break,
                }
                if wait_deadline(deadline) {
                    let _ = kill(Pid::from_raw(slave_pid), Signal::SIGKILL);
                    reap(slave_pid);
                    break;
                }
            }
            break SlaveOutcome::Terminate(signo);
        }

        for fd in ready {
            if fd == ack_read.as_raw_fd() {
                receive_acks(ack_read.as_fd_ref(), map);
            }
        }

        if let Some(status) = reap_dead(evt_write.as_fd_ref(), map, slave_pid) {
            info!("slave exited with {}", status);
            break SlaveOutcome::SlaveExited(status);
        }
    };

    epoll.remove_source(ack_read.as_raw_fd());
    epoll.remove_source(sigfd.as_raw_fd());
    Ok(outcome)
}

enum SlaveOutcome {
    SlaveExited(i32),
    Terminate(i32),
    /// Re-exec the daemon binary after an update signal.
    Update,
}

trait AsFdRef {
    fn as_fd_ref(&self) -> BorrowedFd<'_>;
}

impl AsFdRef for OwnedFd {
    fn as_fd_ref(&self) -> BorrowedFd<'_> {
        unsafe { BorrowedFd::borrow_raw(self.as_raw_fd()) }
    }
}

/// The master process: subreaper for every container task, restarting
/// the slave until told to stop.
pub fn master_run(respawn: bool, slave_entry: &dyn Fn() -> i32) -> i32 {
    if unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1) } < 0 {
        error!(
            "cannot become a subreaper, kernel too old: {}",
            Errno::last()
        );
        return 1;
    }

    if let Err(err) = std::fs::write("/proc/self/oom_score_adj", "-1000") {
        warn!("cannot adjust oom score: {}", err);
    }

    let mut sigfd = match blocked_signalfd() {
        Ok(sigfd) => sigfd,
        Err(err) => {
            error!("{}", err);
            return 1;
        }
    };
    let epoll = match EpollLoop::new() {
        Ok(epoll) => epoll,
        Err(err) => {
            error!("{}", err);
            return 1;
        }
    };

    let mut map = load_pidmap(&Config::PidMapFile.get_path());

    loop {
        let started = current_time_ms();
        match spawn_slave(&mut map, slave_entry, &mut sigfd, &epoll) {
            Ok(SlaveOutcome::Terminate(signo)) => return 128 + signo,
            Ok(SlaveOutcome::SlaveExited(_)) if !respawn => return 0,
            Ok(SlaveOutcome::SlaveExited(_)) => {
                let next = started + crate::arbor::config::respawn_delay_ms();
                while !wait_deadline(next) {}
            }
            Ok(SlaveOutcome::Update) => {
                let args: Vec<CString> = std::env::args()
                    .filter_map(|arg| CString::new(arg).ok())
                    .collect();
                let exe = CString::new("/proc/self/exe").expect("static path");
                let err = nix::unistd::execv(&exe, &args);
                error!("cannot re-exec daemon: {:?}", err);
                return 1;
            }
            Err(err) => {
                error!("cannot spawn slave: {}", err);
                return 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn exit_statuses_follow_waitid_encoding() {
        let exited = encode_wait_status(WaitStatus::Exited(Pid::from_raw(7), 3)).unwrap();
        assert_eq!(exited, (7, 3 << 8));

        let killed =
            encode_wait_status(WaitStatus::Signaled(Pid::from_raw(8), Signal::SIGKILL, false))
                .unwrap();
        assert_eq!(killed, (8, 9));

        let dumped =
            encode_wait_status(WaitStatus::Signaled(Pid::from_raw(9), Signal::SIGSEGV, true))
                .unwrap();
        assert_eq!(dumped, (9, 11 | 0x80));

        assert!(encode_wait_status(WaitStatus::StillAlive).is_none());
    }

    #[test]
    fn exits_are_held_until_acknowledged() {
        let mut map = ReapMap::new();
        assert_eq!(map.record_exit(100, 0), RecordOutcome::Forward);
        assert_eq!(map.record_exit(100, 0), RecordOutcome::Duplicate);
        assert_eq!(map.len(), 1);

        assert!(map.record_ack(100));
        assert!(map.is_empty());
    }

    #[test]
    fn early_ack_is_remembered() {
        let mut map = ReapMap::new();
        assert!(!map.record_ack(200));
        assert_eq!(map.record_exit(200, 9), RecordOutcome::AlreadyAcked);
        assert!(map.is_empty());
    }

    #[test]
    fn pidmap_survives_a_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("pidmap");

        let mut map = ReapMap::new();
        map.record_exit(100, 0);
        map.record_exit(101, 9);
        save_pidmap(&map, &path).unwrap();

        let restored = load_pidmap(&path);
        let pending: Vec<(i32, i32)> = restored.pending().collect();
        assert_eq!(pending, vec![(100, 0), (101, 9)]);
        // the snapshot is consumed on load
        assert!(!path.exists());
        assert!(load_pidmap(&path).is_empty());
    }

    #[test]
    fn missing_pidmap_loads_empty() {
        let temp = TempDir::new().unwrap();
        let map = load_pidmap(&temp.path().join("absent"));
        assert!(map.is_empty());
    }
}
