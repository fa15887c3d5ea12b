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

pub mod error;

use std::fs;
use std::io::ErrorKind;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::sys::signal::Signal;
use nix::unistd::Pid;

/// Monotonic-enough wall clock in milliseconds, used for deadlines and
/// start/death timestamps persisted to the key-value store.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Sleeps one polling quantum and reports whether the deadline has passed.
/// A zero deadline is always expired. Callers loop:
/// `while !done() && !wait_deadline(deadline) {}`.
pub fn wait_deadline(deadline_ms: u64) -> bool {
    if current_time_ms() >= deadline_ms {
        return true;
    }
    thread::sleep(Duration::from_millis(10));
    current_time_ms() >= deadline_ms
}

/// Encodes a wait status the way the kernel reports it through waitid:
/// exited -> code << 8, signaled -> signo, dumped -> signo | 0x80.
pub fn encode_exit_status(code: Option<i32>, signal: Option<(Signal, bool)>) -> i32 {
    match (code, signal) {
        (Some(code), _) => code << 8,
        (None, Some((sig, dumped))) => (sig as i32) | if dumped { 0x80 } else { 0 },
        _ => 0,
    }
}

pub fn status_exit_code(status: i32) -> Option<i32> {
    if status & 0xff == 0 {
        Some((status >> 8) & 0xff)
    } else {
        None
    }
}

pub fn status_signal(status: i32) -> Option<i32> {
    let sig = status & 0x7f;
    if sig != 0 {
        Some(sig)
    } else {
        None
    }
}

pub fn format_exit_status(status: i32) -> String {
    match (status_exit_code(status), status_signal(status)) {
        (Some(code), _) => format!("exited with {code}"),
        (None, Some(sig)) => {
            if status & 0x80 != 0 {
                format!("killed by signal {sig} (core dumped)")
            } else {
                format!("killed by signal {sig}")
            }
        }
        _ => format!("status {status}"),
    }
}

/// Reads the one-character process state from /proc/<pid>/stat. The comm
/// field may contain spaces and parentheses, so scan from the last ')'.
fn proc_stat_state(pid: Pid) -> Option<char> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid.as_raw())).ok()?;
    let rparen = stat.rfind(')')?;
    stat[rparen + 1..].split_whitespace().next()?.chars().next()
}

pub fn pid_exists(pid: Pid) -> bool {
    if pid.as_raw() <= 0 {
        return false;
    }
    match fs::metadata(format!("/proc/{}", pid.as_raw())) {
        Ok(_) => true,
        Err(err) => err.kind() != ErrorKind::NotFound,
    }
}

pub fn pid_is_zombie(pid: Pid) -> bool {
    proc_stat_state(pid) == Some('Z')
}

/// Parent pid from /proc/<pid>/stat, field 4.
pub fn pid_ppid(pid: Pid) -> Option<Pid> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid.as_raw())).ok()?;
    let rparen = stat.rfind(')')?;
    let ppid: i32 = stat[rparen + 1..].split_whitespace().nth(1)?.parse().ok()?;
    Some(Pid::from_raw(ppid))
}

/// True when both pids live in the same pid namespace.
pub fn in_same_pid_namespace(a: Pid, b: Pid) -> bool {
    let ns = |pid: Pid| fs::read_link(format!("/proc/{}/ns/pid", pid.as_raw())).ok();
    match (ns(a), ns(b)) {
        (Some(left), Some(right)) => left == right,
        _ => false,
    }
}

pub fn host_name() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default()
}

/// Login name for a uid, falling back to the numeric form.
pub fn user_name(uid: u32) -> String {
    match nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_round_trip() {
        let exited = encode_exit_status(Some(3), None);
        assert_eq!(status_exit_code(exited), Some(3));
        assert_eq!(status_signal(exited), None);

        let killed = encode_exit_status(None, Some((Signal::SIGKILL, false)));
        assert_eq!(status_signal(killed), Some(9));
        assert_eq!(status_exit_code(killed), None);

        let dumped = encode_exit_status(None, Some((Signal::SIGSEGV, true)));
        assert_eq!(status_signal(dumped), Some(11));
        assert!(dumped & 0x80 != 0);
    }

    #[test]
    fn zero_deadline_is_expired() {
        assert!(wait_deadline(0));
    }

    #[test]
    fn own_process_exists_and_is_not_zombie() {
        let me = Pid::this();
        assert!(pid_exists(me));
        assert!(!pid_is_zombie(me));
    }

    #[test]
    fn format_exit_status_names_signals() {
        let killed = encode_exit_status(None, Some((Signal::SIGKILL, false)));
        assert_eq!(format_exit_status(killed), "killed by signal 9");
        assert_eq!(format_exit_status(0), "exited with 0");
    }
}
