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

//! The task launcher: turns a validated container configuration into a
//! running process under cgroup and namespace isolation.
//!
//! The pipeline is staged: the supervisor forks an intermediate process
//! which enters the parent namespaces, unshares a pid namespace when
//! isolation is requested, forks the final task and reports its pids over
//! a socketpair before exiting. The final task becomes an orphan, so the
//! master subreaper owns its exit status. In app mode with isolation the
//! task is `arbor-init`, which reaps zombies and supervises the user
//! command as pid 2.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sched::{setns, unshare, CloneFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::socket::{
    setsockopt, socketpair, sockopt, AddressFamily, SockFlag, SockType,
};
use nix::sys::time::TimeVal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{
    chdir, chroot, execvpe, fork, pipe, setgid, setgroups, sethostname, setsid, setuid,
    ForkResult, Gid, Pid, Uid,
};

use crate::arbor::caps::{self, CapSet};
use crate::arbor::container::{ContainerInner, VirtMode};
use crate::arbor::device::Device;
use crate::arbor::stream::StdStream;
use crate::arbor::util::error::{ArborError, ErrorKind, Result};
use crate::arbor::util::{host_name, pid_is_zombie, pid_ppid, user_name};

const SYNC_TIMEOUT_S: i64 = 30;

const MSG_PIDS: u8 = 0;
const MSG_ERROR: u8 = 1;

/// Handle to a launched or restored task pid.
#[derive(Debug, Clone, Copy)]
pub struct Task {
    pub pid: i32,
}

impl Task {
    pub fn new(pid: i32) -> Self {
        Self { pid }
    }

    pub fn kill(&self, sig: Signal) -> Result<()> {
        if self.pid == 0 {
            return Err(ArborError::invalid_state("task has no pid"));
        }
        kill(Pid::from_raw(self.pid), sig)
            .map_err(|errno| ArborError::from(errno).wrap(format!("kill({}, {})", self.pid, sig)))
    }

    pub fn exists(&self) -> bool {
        self.pid != 0 && crate::arbor::util::pid_exists(Pid::from_raw(self.pid))
    }

    pub fn is_zombie(&self) -> bool {
        self.pid != 0 && pid_is_zombie(Pid::from_raw(self.pid))
    }

    pub fn ppid(&self) -> Option<Pid> {
        if self.pid == 0 {
            return None;
        }
        pid_ppid(Pid::from_raw(self.pid))
    }
}

/// Pids recorded after a successful launch.
#[derive(Debug, Clone, Copy)]
pub struct TaskHandles {
    /// Host-namespace pid the supervisor tracks.
    pub pid: i32,
    /// Pid of the user command inside the container.
    pub vpid: i32,
    /// Pid whose exit status the master forwards. Equal to `pid` here;
    /// restored containers may carry a distinct value from older records.
    pub wait_pid: i32,
}

#[derive(Debug, Clone)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: PathBuf,
    pub read_only: bool,
}

impl BindMount {
    pub fn parse(entry: &str) -> Result<Self> {
        let fields: Vec<&str> = entry.split_whitespace().collect();
        match fields.as_slice() {
            [source, target] => Ok(Self {
                source: PathBuf::from(source),
                target: PathBuf::from(target),
                read_only: false,
            }),
            [source, target, mode] if *mode == "ro" || *mode == "rw" => Ok(Self {
                source: PathBuf::from(source),
                target: PathBuf::from(target),
                read_only: *mode == "ro",
            }),
            _ => Err(ArborError::invalid_value(format!(
                "bad bind mount entry: {}",
                entry
            ))),
        }
    }
}

struct EnvEntry {
    name: String,
    value: String,
    locked: bool,
}

/// Everything the forked child needs, collected up front. Nothing here
/// allocates after the fork; the child only consumes file descriptors
/// and plain values.
pub struct TaskEnv {
    pub container_name: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub root: PathBuf,
    pub root_ro: bool,
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
    pub umask: u32,
    pub hostname: String,
    pub rlimits: BTreeMap<String, (u64, u64)>,
    pub bind_mounts: Vec<BindMount>,
    pub resolv_conf: Vec<String>,
    pub bind_dns: bool,
    pub devices: Vec<Device>,
    pub cap_ambient: CapSet,
    pub cap_limit: CapSet,
    pub virt_mode: VirtMode,
    pub isolate: bool,
    pub new_mount_ns: bool,
    pub triple_fork: bool,
    pub quadro_fork: bool,
    pub cgroup_paths: Vec<PathBuf>,
    pub init_path: PathBuf,
    work_dir: PathBuf,
    stdin: StdStream,
    stdout: StdStream,
    stderr: StdStream,
    env: Vec<EnvEntry>,
    /// Snapshot of the parent's namespaces, entered in order.
    namespaces: Vec<(&'static str, File)>,
}

impl TaskEnv {
    pub fn new(name: &str, ct: &ContainerInner, work_dir: &Path) -> Result<Self> {
        let args: Vec<String> = ct.command.split_whitespace().map(str::to_string).collect();

        let mut bind_mounts = Vec::new();
        for entry in &ct.bind_mounts {
            bind_mounts.push(BindMount::parse(entry)?);
        }

        let mut devices = Vec::new();
        for entry in &ct.devices {
            let device = Device::parse(entry).map_err(|err| err.wrap(format!("device: {}", entry)))?;
            device
                .permitted(Uid::from_raw(ct.owner_uid), Gid::from_raw(ct.owner_gid))
                .map_err(|err| err.wrap(format!("device: {}", entry)))?;
            devices.push(device);
        }

        let (uid, gid, groups) = match ct.virt_mode {
            VirtMode::Os => (0, 0, Vec::new()),
            VirtMode::App => (ct.owner_uid, ct.owner_gid, ct.owner_groups.clone()),
        };

        let new_mount_ns = ct.isolate
            || !bind_mounts.is_empty()
            || !ct.hostname.is_empty()
            || !ct.resolv_conf.is_empty()
            || ct.root_path != Path::new("/")
            || ct.root_ro;

        let init_path = std::fs::read_link("/proc/self/exe")
            .map(|exe| exe.with_file_name("arbor-init"))
            .map_err(|err| ArborError::from(err).wrap("resolve arbor-init"))?;

        let mut env = TaskEnv {
            container_name: name.to_string(),
            args,
            cwd: PathBuf::from(&ct.cwd),
            root: ct.root_path.clone(),
            root_ro: ct.root_ro,
            uid,
            gid,
            groups,
            umask: ct.umask,
            hostname: ct.hostname.clone(),
            rlimits: ct.ulimits.clone(),
            bind_mounts,
            resolv_conf: ct.resolv_conf.clone(),
            bind_dns: ct.bind_dns,
            devices,
            cap_ambient: ct.cap_ambient,
            cap_limit: ct.cap_limit,
            virt_mode: ct.virt_mode,
            isolate: ct.isolate,
            new_mount_ns,
            triple_fork: false,
            quadro_fork: false,
            cgroup_paths: Vec::new(),
            init_path,
            work_dir: work_dir.to_path_buf(),
            stdin: ct.stdin.clone(),
            stdout: ct.stdout.clone(),
            stderr: ct.stderr.clone(),
            env: Vec::new(),
            namespaces: Vec::new(),
        };

        env.set_env(
            "PATH",
            "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
            true,
            false,
        );
        env.set_env("HOME", &ct.cwd, true, false);
        env.set_env("USER", &user_name(ct.owner_uid), true, false);
        env.set_env("container", "lxc", true, false);
        env.set_env("ARBOR_NAME", name, true, true);
        env.set_env("ARBOR_HOST", &host_name(), true, true);

        env.parse_env(&ct.env, true)?;

        Ok(env)
    }

    fn set_env(&mut self, name: &str, value: &str, overwrite: bool, locked: bool) {
        if let Some(entry) = self.env.iter_mut().find(|e| e.name == name) {
            if entry.locked || !overwrite {
                return;
            }
            entry.value = value.to_string();
            return;
        }
        self.env.push(EnvEntry {
            name: name.to_string(),
            value: value.to_string(),
            locked,
        });
    }

    fn parse_env(&mut self, entries: &[String], overwrite: bool) -> Result<()> {
        for entry in entries {
            let (name, value) = entry.split_once('=').ok_or_else(|| {
                ArborError::invalid_value(format!("environment entry without '=': {}", entry))
            })?;
            self.set_env(name, value, overwrite, false);
        }
        Ok(())
    }

    /// Folds in environment from ancestors up to the isolation domain
    /// boundary, closest ancestor first, never overwriting.
    pub fn inherit_env(&mut self, ancestors: &[Vec<String>]) -> Result<()> {
        for entries in ancestors {
            for entry in entries {
                if let Some((name, value)) = entry.split_once('=') {
                    self.set_env(name, value, false, false);
                }
            }
        }
        Ok(())
    }

    pub fn env_vars(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|e| format!("{}={}", e.name, e.value))
            .collect()
    }

    /// Captures the parent container's namespaces. The user namespace is
    /// intentionally left out.
    pub fn open_parent_namespaces(&mut self, parent_pid: i32) -> Result<()> {
        for ns in ["ipc", "uts", "net", "pid", "mnt"] {
            let path = format!("/proc/{}/ns/{}", parent_pid, ns);
            let file = File::open(&path)
                .map_err(|err| ArborError::from(err).wrap(format!("open {}", path)))?;
            self.namespaces.push((ns, file));
        }
        Ok(())
    }

    /// Forks the launch pipeline and synchronizes with it. Blocks until
    /// the intermediate child reports pids or dies; on failure the child
    /// tree is killed and the error carries the child's errno.
    pub fn start(&self) -> Result<TaskHandles> {
        let stdin_file = self.stdin.open(
            &self.work_dir,
            Uid::from_raw(self.uid),
            Gid::from_raw(self.gid),
        )?;
        let stdout_file = self.stdout.open(
            &self.work_dir,
            Uid::from_raw(self.uid),
            Gid::from_raw(self.gid),
        )?;
        let stderr_file = self.stderr.open(
            &self.work_dir,
            Uid::from_raw(self.uid),
            Gid::from_raw(self.gid),
        )?;

        let (parent_sock, child_sock) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|errno| ArborError::from(errno).wrap("socketpair"))?;

        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                drop(child_sock);
                self.sync_with_child(child, parent_sock)
            }
            Ok(ForkResult::Child) => {
                drop(parent_sock);
                let code = self.run_intermediate(
                    child_sock,
                    stdin_file,
                    stdout_file,
                    stderr_file,
                );
                std::process::exit(code);
            }
            Err(errno) => Err(ArborError::from(errno).wrap("fork task")),
        }
    }

    fn sync_with_child(&self, child: Pid, sock: OwnedFd) -> Result<TaskHandles> {
        setsockopt(
            &sock,
            sockopt::ReceiveTimeout,
            &TimeVal::new(SYNC_TIMEOUT_S, 0),
        )
        .map_err(|errno| ArborError::from(errno).wrap("set sync timeout"))?;

        let mut stream = std::os::unix::net::UnixStream::from(sock);
        let mut msg = [0u8; 9];
        let sync = stream.read_exact(&mut msg);

        let result = match sync {
            Err(err) => Err(ArborError::from(err).wrap("task sync lost")),
            Ok(()) if msg[0] == MSG_ERROR => {
                let errno = i32::from_ne_bytes(msg[1..5].try_into().expect("fixed slice"));
                Err(ArborError::with_errno(
                    ErrorKind::Unknown,
                    Errno::from_raw(errno),
                    "task setup failed",
                ))
            }
            Ok(()) if msg[0] == MSG_PIDS => {
                let pid = i32::from_ne_bytes(msg[1..5].try_into().expect("fixed slice"));
                let vpid = i32::from_ne_bytes(msg[5..9].try_into().expect("fixed slice"));
                // release the task only after the pids are recorded
                stream
                    .write_all(&[0u8])
                    .map_err(|err| ArborError::from(err).wrap("task sync ack"))?;
                Ok(TaskHandles {
                    pid,
                    vpid,
                    wait_pid: pid,
                })
            }
            Ok(()) => Err(ArborError::unknown(format!(
                "unexpected task sync message: {}",
                msg[0]
            ))),
        };

        match &result {
            Ok(_) => {
                match waitpid(child, None) {
                    Ok(WaitStatus::Exited(_, 0)) => {}
                    Ok(status) => {
                        warn!("task intermediate exited with {:?}", status);
                    }
                    Err(errno) => warn!("cannot reap task intermediate: {}", errno),
                }
            }
            Err(_) => {
                // reclaim the whole tree, pids included
                let _ = kill(child, Signal::SIGKILL);
                let _ = waitpid(child, None);
            }
        }
        if let Err(err) = &result {
            error!("task launch for {} failed: {}", self.container_name, err);
        }
        result
    }

    /// The intermediate process: enters namespaces, unshares the new pid
    /// namespace, forks the final task and reports its pids.
    fn run_intermediate(
        &self,
        sock: OwnedFd,
        stdin_file: File,
        stdout_file: File,
        stderr_file: File,
    ) -> i32 {
        let mut stream = std::os::unix::net::UnixStream::from(sock);

        let spawned = self.spawn_task(stdin_file, stdout_file, stderr_file);
        match spawned {
            Ok((pid, vpid, gate)) => {
                let mut msg = [0u8; 9];
                msg[0] = MSG_PIDS;
                msg[1..5].copy_from_slice(&pid.to_ne_bytes());
                msg[5..9].copy_from_slice(&vpid.to_ne_bytes());
                if stream.write_all(&msg).is_err() {
                    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
                    return 1;
                }

                let mut ack = [0u8; 1];
                if stream.read_exact(&mut ack).is_err() {
                    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
                    return 1;
                }

                // pids are recorded, let the task exec
                let gate_file = File::from(gate);
                let _ = (&gate_file).write_all(&[0u8]);
                0
            }
            Err(err) => {
                let errno = err.errno().map(|e| e as i32).unwrap_or(0);
                let mut msg = [0u8; 9];
                msg[0] = MSG_ERROR;
                msg[1..5].copy_from_slice(&errno.to_ne_bytes());
                let _ = stream.write_all(&msg);
                1
            }
        }
    }

    fn spawn_task(
        &self,
        stdin_file: File,
        stdout_file: File,
        stderr_file: File,
    ) -> Result<(i32, i32, OwnedFd)> {
        // die with the supervisor
        if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) } < 0 {
            return Err(ArborError::from(Errno::last()).wrap("set pdeathsig"));
        }

        let self_pid = Pid::this();
        for path in &self.cgroup_paths {
            std::fs::write(path.join("cgroup.procs"), self_pid.to_string())
                .map_err(|err| ArborError::from(err).wrap(format!("attach to {}", path.display())))?;
        }

        for (name, file) in &self.namespaces {
            if *name == "mnt" {
                // a new mount tree is built below instead
                if self.new_mount_ns {
                    continue;
                }
            }
            setns(file.as_fd(), CloneFlags::empty())
                .map_err(|errno| ArborError::from(errno).wrap(format!("setns {}", name)))?;
        }

        if self.isolate {
            unshare(CloneFlags::CLONE_NEWPID)
                .map_err(|errno| ArborError::from(errno).wrap("unshare pid namespace"))?;
        }

        let (gate_read, gate_write) = pipe().map_err(|errno| ArborError::from(errno).wrap("pipe"))?;

        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                drop(gate_read);
                let vpid = if self.isolate {
                    if self.quadro_fork {
                        2
                    } else {
                        1
                    }
                } else {
                    child.as_raw()
                };
                Ok((child.as_raw(), vpid, gate_write))
            }
            Ok(ForkResult::Child) => {
                drop(gate_write);
                let code = self.run_task(gate_read, stdin_file, stdout_file, stderr_file);
                std::process::exit(code);
            }
            Err(errno) => Err(ArborError::from(errno).wrap("fork final task")),
        }
    }

    /// The final task. Never returns on success; exits the exec error
    /// code otherwise.
    fn run_task(
        &self,
        gate: OwnedFd,
        stdin_file: File,
        stdout_file: File,
        stderr_file: File,
    ) -> i32 {
        let mut gate_file = File::from(gate);
        let mut token = [0u8; 1];
        if gate_file.read_exact(&mut token).is_err() {
            return 1;
        }
        drop(gate_file);

        match self.setup_task(stdin_file, stdout_file, stderr_file) {
            Ok(()) => {}
            Err(err) => {
                error!("task setup: {}", err);
                return 1;
            }
        }

        let argv = self.exec_argv();
        let program = argv[0].clone();
        let args: Vec<CString> = argv
            .into_iter()
            .filter_map(|a| CString::new(a).ok())
            .collect();
        let env: Vec<CString> = self
            .env_vars()
            .into_iter()
            .filter_map(|e| CString::new(e).ok())
            .collect();

        debug!("exec {}", program);
        match execvpe(&args[0], &args, &env) {
            Ok(_) => 0,
            Err(errno) => {
                error!("exec {} failed: {}", program, errno);
                errno as i32
            }
        }
    }

    fn exec_argv(&self) -> Vec<String> {
        if self.args.is_empty() || self.quadro_fork {
            let mut argv = vec![self.init_path.to_string_lossy().into_owned()];
            if !self.args.is_empty() {
                argv.push("--".to_string());
                argv.extend(self.args.iter().cloned());
            }
            argv
        } else {
            self.args.clone()
        }
    }

    fn setup_task(
        &self,
        stdin_file: File,
        stdout_file: File,
        stderr_file: File,
    ) -> Result<()> {
        let _ = setsid();

        if self.new_mount_ns {
            self.setup_mount_tree()?;
        }

        if !self.hostname.is_empty() {
            sethostname(&self.hostname)
                .map_err(|errno| ArborError::from(errno).wrap("sethostname"))?;
        }

        self.apply_rlimits()?;

        let _ = std::fs::write("/proc/self/oom_score_adj", "0");

        chdir(&self.cwd).map_err(|errno| {
            ArborError::from(errno).wrap(format!("chdir {}", self.cwd.display()))
        })?;

        nix::unistd::dup2_stdin(&stdin_file)
            .map_err(|errno| ArborError::from(errno).wrap("dup stdin"))?;
        nix::unistd::dup2_stdout(&stdout_file)
            .map_err(|errno| ArborError::from(errno).wrap("dup stdout"))?;
        nix::unistd::dup2_stderr(&stderr_file)
            .map_err(|errno| ArborError::from(errno).wrap("dup stderr"))?;
        drop(stdin_file);
        drop(stdout_file);
        drop(stderr_file);

        unsafe { libc::umask(self.umask) };

        // a daemon running unprivileged keeps its own credentials
        if Uid::effective().is_root() {
            let groups: Vec<Gid> = self.groups.iter().map(|g| Gid::from_raw(*g)).collect();
            setgroups(&groups).map_err(|errno| ArborError::from(errno).wrap("setgroups"))?;
            setgid(Gid::from_raw(self.gid))
                .map_err(|errno| ArborError::from(errno).wrap("setgid"))?;

            caps::apply_bounding_set(self.cap_limit)?;

            setuid(Uid::from_raw(self.uid))
                .map_err(|errno| ArborError::from(errno).wrap("setuid"))?;

            caps::apply_ambient_set(self.cap_ambient)?;
        }

        Ok(())
    }

    fn setup_mount_tree(&self) -> Result<()> {
        use nix::mount::{mount, MsFlags};

        unshare(CloneFlags::CLONE_NEWNS)
            .map_err(|errno| ArborError::from(errno).wrap("unshare mount namespace"))?;

        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&str>,
        )
        .map_err(|errno| ArborError::from(errno).wrap("remount / private"))?;

        let chrooting = self.root != Path::new("/");
        if chrooting {
            mount(
                Some(&self.root),
                &self.root,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None::<&str>,
            )
            .map_err(|errno| ArborError::from(errno).wrap("bind root"))?;

            if self.root_ro {
                mount(
                    Some(&self.root),
                    &self.root,
                    None::<&str>,
                    MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                    None::<&str>,
                )
                .map_err(|errno| ArborError::from(errno).wrap("remount root read-only"))?;
            }

            self.mount_core_filesystems()?;
        }

        for bind in &self.bind_mounts {
            let target = if chrooting {
                self.root.join(bind.target.strip_prefix("/").unwrap_or(&bind.target))
            } else {
                bind.target.clone()
            };
            mount(
                Some(&bind.source),
                &target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None::<&str>,
            )
            .map_err(|errno| {
                ArborError::from(errno).wrap(format!("bind {}", bind.source.display()))
            })?;
            if bind.read_only {
                mount(
                    Some(&bind.source),
                    &target,
                    None::<&str>,
                    MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                    None::<&str>,
                )
                .map_err(|errno| {
                    ArborError::from(errno)
                        .wrap(format!("remount {} read-only", bind.source.display()))
                })?;
            }
        }

        if !self.resolv_conf.is_empty() || self.bind_dns {
            self.setup_resolv_conf(chrooting)?;
        }

        if chrooting {
            chroot(&self.root).map_err(|errno| ArborError::from(errno).wrap("chroot"))?;
            chdir("/").map_err(|errno| ArborError::from(errno).wrap("chdir /"))?;
        }

        Ok(())
    }

    fn mount_core_filesystems(&self) -> Result<()> {
        use nix::mount::{mount, MsFlags};

        let base = MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV;
        let mounts: [(&str, &str, &str, MsFlags, Option<&str>); 5] = [
            ("proc", "proc", "proc", base, None),
            ("sysfs", "sys", "sysfs", base, None),
            (
                "tmpfs",
                "dev",
                "tmpfs",
                MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
                Some("mode=755,size=65536k"),
            ),
            (
                "devpts",
                "dev/pts",
                "devpts",
                MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
                Some("newinstance,ptmxmode=0666,mode=0620,gid=5"),
            ),
            (
                "tmpfs",
                "dev/shm",
                "tmpfs",
                base,
                Some("mode=1777,size=65536k"),
            ),
        ];

        for (source, target, fstype, flags, data) in mounts {
            let target = self.root.join(target);
            std::fs::create_dir_all(&target)
                .map_err(|err| ArborError::from(err).wrap(format!("mkdir {}", target.display())))?;
            mount(Some(source), &target, Some(fstype), flags, data)
                .map_err(|errno| {
                    ArborError::from(errno).wrap(format!("mount {}", target.display()))
                })?;
        }

        for device in &self.devices {
            let target = self
                .root
                .join(device.path.strip_prefix("/").unwrap_or(&device.path));
            nix::sys::stat::mknod(
                &target,
                nix::sys::stat::SFlag::from_bits_truncate(device.node_mode()),
                nix::sys::stat::Mode::from_bits_truncate(device.node_mode()),
                nix::sys::stat::makedev(device.major, device.minor),
            )
            .map_err(|errno| {
                ArborError::from(errno).wrap(format!("mknod {}", target.display()))
            })?;
        }

        let dev = self.root.join("dev");
        for (link, target) in [
            ("fd", "/proc/self/fd"),
            ("stdin", "/proc/self/fd/0"),
            ("stdout", "/proc/self/fd/1"),
            ("stderr", "/proc/self/fd/2"),
            ("ptmx", "pts/ptmx"),
        ] {
            let link = dev.join(link);
            if !link.exists() {
                std::os::unix::fs::symlink(target, &link).map_err(|err| {
                    ArborError::from(err).wrap(format!("symlink {}", link.display()))
                })?;
            }
        }

        for node in ["null", "zero", "full", "random", "urandom", "tty"] {
            let host = Path::new("/dev").join(node);
            if self.devices.iter().any(|d| d.path == host) {
                continue;
            }
            if let Ok(device) = Device::parse(&format!("/dev/{} rwm", node)) {
                let target = dev.join(node);
                let _ = nix::sys::stat::mknod(
                    &target,
                    nix::sys::stat::SFlag::from_bits_truncate(device.node_mode()),
                    nix::sys::stat::Mode::from_bits_truncate(device.node_mode()),
                    nix::sys::stat::makedev(device.major, device.minor),
                );
            }
        }

        Ok(())
    }

    fn setup_resolv_conf(&self, chrooting: bool) -> Result<()> {
        let target = if chrooting {
            self.root.join("etc/resolv.conf")
        } else {
            PathBuf::from("/etc/resolv.conf")
        };

        if !self.resolv_conf.is_empty() {
            let mut text = self.resolv_conf.join("\n");
            text.push('\n');
            std::fs::write(&target, text)
                .map_err(|err| ArborError::from(err).wrap("write resolv.conf"))?;
        } else if self.bind_dns && chrooting {
            use nix::mount::{mount, MsFlags};
            if !target.exists() {
                if let Some(parent) = target.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                let _ = std::fs::write(&target, "");
            }
            mount(
                Some("/etc/resolv.conf"),
                &target,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(|errno| ArborError::from(errno).wrap("bind resolv.conf"))?;
        }
        Ok(())
    }

    fn apply_rlimits(&self) -> Result<()> {
        for (name, (soft, hard)) in &self.rlimits {
            let resource = match name.as_str() {
                "core" => libc::RLIMIT_CORE,
                "cpu" => libc::RLIMIT_CPU,
                "data" => libc::RLIMIT_DATA,
                "fsize" => libc::RLIMIT_FSIZE,
                "memlock" => libc::RLIMIT_MEMLOCK,
                "nofile" => libc::RLIMIT_NOFILE,
                "nproc" => libc::RLIMIT_NPROC,
                "stack" => libc::RLIMIT_STACK,
                _ => {
                    info!("unknown ulimit {}, skipped", name);
                    continue;
                }
            };
            let limit = libc::rlimit {
                rlim_cur: if *soft == u64::MAX {
                    libc::RLIM_INFINITY
                } else {
                    *soft
                },
                rlim_max: if *hard == u64::MAX {
                    libc::RLIM_INFINITY
                } else {
                    *hard
                },
            };
            if unsafe { libc::setrlimit(resource, &limit) } < 0 {
                return Err(ArborError::from(Errno::last()).wrap(format!("setrlimit {}", name)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbor::container::ContainerInner;

    fn task_env(ct: &ContainerInner) -> TaskEnv {
        TaskEnv::new("web", ct, Path::new("/tmp/arbor-test/containers/web")).unwrap()
    }

    #[test]
    fn bind_mount_entries_parse() {
        let bind = BindMount::parse("/host/data /data ro").unwrap();
        assert_eq!(bind.source, Path::new("/host/data"));
        assert_eq!(bind.target, Path::new("/data"));
        assert!(bind.read_only);

        assert!(!BindMount::parse("/a /b").unwrap().read_only);
        assert!(BindMount::parse("/only-source").is_err());
        assert!(BindMount::parse("/a /b rx").is_err());
    }

    #[test]
    fn environment_carries_identity_and_locks() {
        let mut ct = ContainerInner::new_for_tests();
        ct.command = "/bin/sleep 3".to_string();
        ct.env = vec!["FOO=bar".to_string(), "ARBOR_NAME=spoofed".to_string()];

        let env = task_env(&ct);
        let vars = env.env_vars();
        assert!(vars.contains(&"container=lxc".to_string()));
        assert!(vars.contains(&"FOO=bar".to_string()));
        assert!(vars.contains(&"ARBOR_NAME=web".to_string()));
        assert!(!vars.contains(&"ARBOR_NAME=spoofed".to_string()));
    }

    #[test]
    fn inherited_env_never_overwrites() {
        let mut ct = ContainerInner::new_for_tests();
        ct.command = "/bin/true".to_string();
        ct.env = vec!["FOO=own".to_string()];

        let mut env = task_env(&ct);
        env.inherit_env(&[vec!["FOO=parent".to_string(), "EXTRA=1".to_string()]])
            .unwrap();
        let vars = env.env_vars();
        assert!(vars.contains(&"FOO=own".to_string()));
        assert!(vars.contains(&"EXTRA=1".to_string()));
    }

    #[test]
    fn command_splits_into_argv() {
        let mut ct = ContainerInner::new_for_tests();
        ct.command = "/bin/sleep 3".to_string();
        let env = task_env(&ct);
        assert_eq!(env.args, vec!["/bin/sleep", "3"]);
        assert_eq!(env.exec_argv(), vec!["/bin/sleep", "3"]);
    }

    #[test]
    fn meta_with_isolation_execs_the_init_stub() {
        let mut ct = ContainerInner::new_for_tests();
        ct.command.clear();
        let env = task_env(&ct);
        let argv = env.exec_argv();
        assert!(argv[0].ends_with("arbor-init"));
        assert_eq!(argv.len(), 1);
    }

    #[test]
    fn quadro_fork_wraps_the_command_with_init() {
        let mut ct = ContainerInner::new_for_tests();
        ct.command = "/bin/sleep 100".to_string();
        let mut env = task_env(&ct);
        env.quadro_fork = true;
        let argv = env.exec_argv();
        assert!(argv[0].ends_with("arbor-init"));
        assert_eq!(argv[1], "--");
        assert_eq!(&argv[2..], ["/bin/sleep", "100"]);
    }

    #[test]
    fn os_mode_runs_as_root() {
        let mut ct = ContainerInner::new_for_tests();
        ct.command = "/sbin/init".to_string();
        ct.owner_uid = 1000;
        ct.owner_gid = 1000;
        ct.virt_mode = VirtMode::Os;
        let env = task_env(&ct);
        assert_eq!((env.uid, env.gid), (0, 0));
    }

    #[test]
    fn mount_namespace_follows_configuration() {
        let mut ct = ContainerInner::new_for_tests();
        ct.command = "/bin/true".to_string();
        ct.isolate = false;
        let env = task_env(&ct);
        assert!(!env.new_mount_ns);

        ct.hostname = "box".to_string();
        let env = task_env(&ct);
        assert!(env.new_mount_ns);

        ct.hostname.clear();
        ct.isolate = true;
        let env = task_env(&ct);
        assert!(env.new_mount_ns);
    }
}
