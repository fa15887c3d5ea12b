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

//! Minimal in-container init. As pid 1 of an isolated container it reaps
//! adopted zombies and, given a payload after `--`, supervises the user
//! command: termination signals are forwarded to it and its exit status
//! becomes this process's own, with fatal signals encoded as 128 + signo
//! (pid 1 cannot kill itself with the original signal).

use std::ffi::CString;

use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::SignalFd;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

fn payload_args() -> Vec<String> {
    let mut args = std::env::args().skip(1);
    for arg in args.by_ref() {
        if arg == "--" {
            break;
        }
    }
    args.collect()
}

fn reap_zombies(payload: Option<Pid>) -> Option<i32> {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                if payload == Some(pid) {
                    return Some(code);
                }
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                if payload == Some(pid) {
                    return Some(128 + sig as i32);
                }
            }
            Ok(WaitStatus::StillAlive) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

fn main() {
    let payload = payload_args();

    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask.add(Signal::SIGTERM);
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGQUIT);
    mask.add(Signal::SIGHUP);
    if mask.thread_block().is_err() {
        std::process::exit(1);
    }
    let mut sigfd = match SignalFd::new(&mask) {
        Ok(sigfd) => sigfd,
        Err(_) => std::process::exit(1),
    };

    let child = if payload.is_empty() {
        None
    } else {
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => Some(child),
            Ok(ForkResult::Child) => {
                let _ = mask.thread_unblock();
                let args: Vec<CString> = payload
                    .iter()
                    .filter_map(|arg| CString::new(arg.as_str()).ok())
                    .collect();
                match nix::unistd::execvp(&args[0], &args) {
                    Ok(_) => unreachable!(),
                    Err(errno) => std::process::exit(errno as i32),
                }
            }
            Err(_) => std::process::exit(1),
        }
    };

    loop {
        if let Some(code) = reap_zombies(child) {
            std::process::exit(code);
        }
        match sigfd.read_signal() {
            Ok(Some(info)) => {
                let signo = info.ssi_signo as i32;
                if signo == libc::SIGCHLD {
                    continue;
                }
                if let (Some(child), Ok(sig)) = (child, Signal::try_from(signo)) {
                    let _ = nix::sys::signal::kill(child, sig);
                }
            }
            Ok(None) => {}
            Err(_) => {}
        }
    }
}
