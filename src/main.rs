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

use std::fs::File;
use std::os::fd::AsRawFd;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};

use arbord::arbor::cgroup::{CgroupSet, SubsystemKind};
use arbord::arbor::config::{self, Config};
use arbord::arbor::events::{Event, SourceTag};
use arbord::arbor::holder::Holder;
use arbord::arbor::kv::KvStore;
use arbord::arbor::logger::{self, LogFormat};
use arbord::arbor::net::{Network, NullNetlink};
use arbord::arbor::supervisor;
use arbord::arbor::util::current_time_ms;
use arbord::arbor::volume;
use arbord::arbor::{ARBOR_DAEMON_CGROUP, REAP_EVT_FD};

/// The Arbor container supervision daemon.
#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
struct Args {
    /// Run the slave supervisor instead of the master reaper.
    #[arg(long)]
    slave: bool,

    /// Log to stdout/stderr instead of the log file.
    #[arg(long)]
    stdlog: bool,

    #[arg(long)]
    verbose: bool,

    /// Do not restart the slave when it dies.
    #[arg(long)]
    norespawn: bool,

    /// Dump the key-value storage and exit.
    #[arg(long = "kv-dump")]
    kv_dump: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_log: bool,
}

fn running_in_container() -> bool {
    if std::process::id() == 1 {
        return std::env::var_os("container").is_some();
    }
    match std::fs::read("/proc/1/environ") {
        Ok(environ) => environ
            .split(|byte| *byte == 0)
            .any(|entry| entry.starts_with(b"container=")),
        Err(_) => false,
    }
}

fn kv_dump() -> i32 {
    match KvStore::open(
        &Config::KeyValueDir.get_path(),
        &Config::LockFile.get_path(),
    ) {
        Ok(store) => match store.dump_all() {
            Ok(text) => {
                print!("{}", text);
                0
            }
            Err(err) => {
                eprintln!("cannot dump key-value storage: {}", err);
                1
            }
        },
        Err(err) => {
            eprintln!("cannot open key-value storage: {}", err);
            1
        }
    }
}

fn write_pid_file(cfg: Config) {
    let path = cfg.get_path();
    if let Err(err) = std::fs::write(&path, std::process::id().to_string()) {
        warn!("cannot write pid file {}: {}", path.display(), err);
    }
}

/// Puts the daemon processes into their own accounting cgroup, master
/// included.
fn init_daemon_cgroups(cgroups: &CgroupSet) {
    for kind in [SubsystemKind::Memory, SubsystemKind::Cpuacct] {
        let subsys = cgroups.subsystem(kind);
        if !subsys.is_leader() {
            continue;
        }
        let cg = cgroups.cgroup(kind, ARBOR_DAEMON_CGROUP);
        if !cg.exists() {
            if let Err(err) = cg.create() {
                warn!("cannot create daemon cgroup: {}", err);
                continue;
            }
        }
        let _ = cg.attach(nix::unistd::Pid::this());
        let _ = cg.attach(nix::unistd::getppid());
    }
}

fn slave_main() -> i32 {
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) } < 0 {
        error!("cannot set parent death signal");
        return 1;
    }
    let _ = std::fs::write("/proc/self/oom_score_adj", "0");
    write_pid_file(Config::SlavePidFile);
    info!("slave started");

    let kv = match KvStore::open(
        &Config::KeyValueDir.get_path(),
        &Config::LockFile.get_path(),
    ) {
        Ok(kv) => kv,
        Err(err) => {
            error!("cannot mount containers keyvalue: {}", err);
            return 1;
        }
    };

    let cgroups = match CgroupSet::initialize(&Config::SysfsRoot.get_path()) {
        Ok(cgroups) => cgroups,
        Err(err) => {
            error!("cannot initialize cgroups: {}", err);
            return 1;
        }
    };
    init_daemon_cgroups(&cgroups);

    let holder = match Holder::new(
        kv,
        cgroups,
        Network::new(Arc::new(NullNetlink)),
        volume::default_backend(),
        &Config::WorkDir.get_path(),
    ) {
        Ok(holder) => holder,
        Err(err) => {
            error!("cannot initialize holder: {}", err);
            return 1;
        }
    };

    if let Err(err) = holder.bootstrap() {
        error!("cannot bootstrap system containers: {}", err);
        return 1;
    }
    holder.restore_from_storage();
    info!("done restoring");

    slave_loop(&holder)
}

fn slave_loop(holder: &Holder) -> i32 {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.add(Signal::SIGHUP);
    mask.add(Signal::SIGCHLD);
    if let Err(errno) = mask.thread_block() {
        error!("cannot block signals: {}", errno);
        return 1;
    }
    let mut sigfd =
        match SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC) {
            Ok(sigfd) => sigfd,
            Err(errno) => {
                error!("cannot create signalfd: {}", errno);
                return 1;
            }
        };

    if let Err(err) = holder.epoll().add_source(REAP_EVT_FD, SourceTag::Fixed) {
        error!("cannot add master fd to epoll: {}", err);
        return 1;
    }
    if let Err(err) = holder
        .epoll()
        .add_source(sigfd.as_raw_fd(), SourceTag::Fixed)
    {
        error!("cannot add signal fd to epoll: {}", err);
        return 1;
    }

    let rotate_period = config::rotate_logs_period_ms();
    let mut next_rotate = current_time_ms() + rotate_period;

    loop {
        let timer = holder.queue().next_delay_ms();
        let rotate_in = next_rotate.saturating_sub(current_time_ms());
        let timeout = Some(timer.map_or(rotate_in, |t| t.min(rotate_in)));

        let ready = match holder.epoll().wait(timeout) {
            Ok(ready) => ready,
            Err(err) => {
                error!("slave: epoll error {}", err);
                return 1;
            }
        };

        // exits from the master are handled before anything else so
        // clients observe up-to-date state
        supervisor::drain_exit_events(|pid, status| {
            holder.queue().add(0, Event::Exit { pid, status });
        });

        for fd in ready {
            if fd == sigfd.as_raw_fd() {
                while let Ok(Some(info)) = sigfd.read_signal() {
                    match info.ssi_signo as i32 {
                        libc::SIGINT | libc::SIGTERM => {
                            info!("shutting down");
                            return 128 + info.ssi_signo as i32;
                        }
                        libc::SIGHUP => {
                            info!("updating");
                            return 0;
                        }
                        libc::SIGCHLD => {}
                        other => warn!("unexpected signal: {}", other),
                    }
                }
            } else if fd == REAP_EVT_FD {
                // drained above
            } else if let Some(SourceTag::Oom { .. }) = holder.epoll().source(fd) {
                // no repeated events from one OOM fd
                holder.epoll().stop_input(fd);
                holder.queue().add(0, Event::Oom { fd });
            }
        }

        if current_time_ms() >= next_rotate {
            holder.heartbeat();
            next_rotate = current_time_ms() + rotate_period;
        }

        for event in holder.queue().take_due() {
            holder.deliver_event(&event);
            if let Event::Exit { pid, .. } = event {
                supervisor::ack_exit_status(pid);
            }
        }
    }
}

fn main() {
    let args = Args::parse();

    logger::init(
        args.stdlog || args.kv_dump,
        &Config::LogFile.get_path(),
        args.verbose,
    );
    if args.json_log {
        logger::set_log_format(LogFormat::Json);
    }

    if args.kv_dump {
        std::process::exit(kv_dump());
    }

    if !nix::unistd::geteuid().is_root() {
        eprintln!("need root privileges to start");
        std::process::exit(1);
    }
    if running_in_container() {
        eprintln!("cannot start in container");
        std::process::exit(1);
    }

    if args.slave {
        std::process::exit(slave_main());
    }

    if !args.stdlog {
        for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
            if let Ok(null) = File::options().read(true).write(true).open("/dev/null") {
                unsafe { libc::dup2(null.as_raw_fd(), target) };
            }
        }
    }

    write_pid_file(Config::MasterPidFile);
    info!("master started");

    let code = supervisor::master_run(!args.norespawn, &slave_main);
    info!("stopped with {}", code);
    std::process::exit(code);
}
