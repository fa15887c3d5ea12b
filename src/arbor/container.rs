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

//! The container entity: per-container configuration and runtime state,
//! the lifecycle state machine, resource allocation and release, and
//! persistence. Lock order is strictly parent before child; anything an
//! operation needs from its ancestors is collected before the container's
//! own lock is taken.

use std::collections::BTreeMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Duration;

use log::{error, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::arbor::caps::{
    self, CapSet, ALL_CAPS, APP_MODE_CAPS, MEMCG_CAPS, NETNS_CAPS, NO_CAPS, OS_MODE_CAPS,
    PIDNS_CAPS, SUID_CAPS,
};
use crate::arbor::cgroup::{memory, Cgroup, SubsystemKind};
use crate::arbor::config;
use crate::arbor::events::{Event, SourceTag};
use crate::arbor::holder::Holder;
use crate::arbor::net::{self, NetMode, UintMap};
use crate::arbor::property::{self, Prop, PropMask};
use crate::arbor::stream::StdStream;
use crate::arbor::task::{Task, TaskEnv};
use crate::arbor::util::error::{ArborError, ErrorKind, Result};
use crate::arbor::util::{current_time_ms, wait_deadline};
use crate::arbor::volume::VolumeHandle;
use crate::arbor::{
    ARBOR_ROOT_CGROUP, ARBOR_ROOT_CONTAINER_ID, ROOT_CONTAINER_ID,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Stopped,
    Dead,
    Running,
    Paused,
    Meta,
    Unknown,
}

impl ContainerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerState::Stopped => "stopped",
            ContainerState::Dead => "dead",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Meta => "meta",
            ContainerState::Unknown => "unknown",
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        match text {
            "stopped" => Ok(ContainerState::Stopped),
            "dead" => Ok(ContainerState::Dead),
            "running" => Ok(ContainerState::Running),
            "paused" => Ok(ContainerState::Paused),
            "meta" => Ok(ContainerState::Meta),
            "unknown" => Ok(ContainerState::Unknown),
            _ => Err(ArborError::invalid_value(format!(
                "unknown container state: {}",
                text
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VirtMode {
    #[default]
    App,
    Os,
}

impl VirtMode {
    pub fn as_str(self) -> &'static str {
        match self {
            VirtMode::App => "app",
            VirtMode::Os => "os",
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        match text {
            "app" => Ok(VirtMode::App),
            "os" => Ok(VirtMode::Os),
            _ => Err(ArborError::invalid_value(format!(
                "unknown virt mode: {}",
                text
            ))),
        }
    }
}

/// Client access grade, monotonically non-increasing from parent to
/// child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessLevel {
    None,
    ReadOnly,
    ChildOnly,
    Normal,
    SuperUser,
    Internal,
}

impl AccessLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessLevel::None => "none",
            AccessLevel::ReadOnly => "read-only",
            AccessLevel::ChildOnly => "child-only",
            AccessLevel::Normal => "normal",
            AccessLevel::SuperUser => "super-user",
            AccessLevel::Internal => "internal",
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        match text {
            "none" => Ok(AccessLevel::None),
            "read-only" => Ok(AccessLevel::ReadOnly),
            "child-only" => Ok(AccessLevel::ChildOnly),
            "normal" => Ok(AccessLevel::Normal),
            "super-user" => Ok(AccessLevel::SuperUser),
            "internal" => Ok(AccessLevel::Internal),
            _ => Err(ArborError::invalid_value(format!(
                "unknown access level: {}",
                text
            ))),
        }
    }
}

/// A client wait on container state, woken when the container leaves the
/// live states or a meta container runs out of running children. Expiry
/// is the caller's timeout on `wait_timeout`.
pub struct Waiter {
    slot: Mutex<Option<String>>,
    cond: Condvar,
}

impl Waiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    pub fn notify(&self, name: &str) {
        let mut slot = self.slot.lock().expect("waiter lock poisoned");
        *slot = Some(name.to_string());
        self.cond.notify_all();
    }

    pub fn wait_timeout(&self, timeout_ms: u64) -> Option<String> {
        let slot = self.slot.lock().expect("waiter lock poisoned");
        let (mut slot, _timeout) = self
            .cond
            .wait_timeout_while(slot, Duration::from_millis(timeout_ms), |slot| {
                slot.is_none()
            })
            .expect("waiter lock poisoned");
        slot.take()
    }
}

/// Everything protected by the container lock.
#[derive(Debug)]
pub struct ContainerInner {
    pub state: ContainerState,

    pub owner_uid: u32,
    pub owner_gid: u32,
    pub owner_groups: Vec<u32>,

    pub command: String,
    pub cwd: String,
    pub root: String,
    pub root_ro: bool,
    pub umask: u32,
    pub env: Vec<String>,
    pub hostname: String,
    pub bind_mounts: Vec<String>,
    pub resolv_conf: Vec<String>,
    pub devices: Vec<String>,
    pub ulimits: BTreeMap<String, (u64, u64)>,
    pub ip_list: Vec<String>,
    pub default_gw: Vec<String>,
    pub net_prop: Vec<String>,

    pub stdin: StdStream,
    pub stdout: StdStream,
    pub stderr: StdStream,

    pub mem_limit: u64,
    pub mem_guarantee: u64,
    pub anon_limit: u64,
    pub dirty_limit: u64,
    pub recharge_on_pgfault: bool,
    pub io_policy: String,
    pub io_limit: u64,
    pub io_ops_limit: u64,
    pub cpu_policy: String,
    pub cpu_limit: f64,
    pub cpu_guarantee: f64,
    pub net_priority: UintMap,
    pub net_limit: UintMap,
    pub net_guarantee: UintMap,

    pub cap_ambient: CapSet,
    pub cap_allowed: CapSet,
    pub cap_limit: CapSet,

    pub virt_mode: VirtMode,
    pub isolate: bool,
    pub bind_dns: bool,

    pub to_respawn: bool,
    pub max_respawns: i64,
    pub respawn_count: u64,
    pub private: String,
    pub aging_time_s: u64,
    pub access_level: AccessLevel,
    pub is_weak: bool,

    pub task_pid: i32,
    pub task_vpid: i32,
    pub wait_task_pid: i32,
    pub start_time_ms: u64,
    pub death_time_ms: u64,
    pub exit_status: i32,
    pub oom_killed: bool,

    pub prop_set: PropMask,
    pub prop_dirty: PropMask,

    pub oom_event: Option<OwnedFd>,
    pub root_volume: Option<VolumeHandle>,
    /// Root path in the host namespace, resolved at start.
    pub root_path: PathBuf,
    pub net_attached: bool,

    waiters: Vec<Weak<Waiter>>,
}

impl ContainerInner {
    fn new(cwd: String) -> Self {
        Self {
            state: ContainerState::Unknown,
            owner_uid: 0,
            owner_gid: 0,
            owner_groups: Vec::new(),
            command: String::new(),
            cwd,
            root: "/".to_string(),
            root_ro: false,
            umask: 0o002,
            env: Vec::new(),
            hostname: String::new(),
            bind_mounts: Vec::new(),
            resolv_conf: Vec::new(),
            devices: Vec::new(),
            ulimits: BTreeMap::new(),
            ip_list: Vec::new(),
            default_gw: Vec::new(),
            net_prop: vec!["inherited".to_string()],
            stdin: StdStream::new(0, "/dev/null", 0),
            stdout: StdStream::new(1, "stdout", config::stdio_limit_bytes()),
            stderr: StdStream::new(2, "stderr", config::stdio_limit_bytes()),
            mem_limit: 0,
            mem_guarantee: 0,
            anon_limit: 0,
            dirty_limit: 0,
            recharge_on_pgfault: false,
            io_policy: "normal".to_string(),
            io_limit: 0,
            io_ops_limit: 0,
            cpu_policy: "normal".to_string(),
            cpu_limit: crate::arbor::cgroup::cpu::num_cores() as f64,
            cpu_guarantee: 0.0,
            net_priority: [("default".to_string(), net::NET_DEFAULT_PRIO)]
                .into_iter()
                .collect(),
            net_limit: UintMap::new(),
            net_guarantee: UintMap::new(),
            cap_ambient: NO_CAPS,
            cap_allowed: NO_CAPS,
            cap_limit: NO_CAPS,
            virt_mode: VirtMode::App,
            isolate: true,
            bind_dns: true,
            to_respawn: false,
            max_respawns: -1,
            respawn_count: 0,
            private: String::new(),
            aging_time_s: config::default_aging_time_s(),
            access_level: AccessLevel::Normal,
            is_weak: false,
            task_pid: 0,
            task_vpid: 0,
            wait_task_pid: 0,
            start_time_ms: 0,
            death_time_ms: 0,
            exit_status: 0,
            oom_killed: false,
            prop_set: PropMask::default(),
            prop_dirty: PropMask::default(),
            oom_event: None,
            root_volume: None,
            root_path: PathBuf::from("/"),
            net_attached: false,
            waiters: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn new_for_tests() -> Self {
        Self::new("/".to_string())
    }

    pub fn has_prop(&self, prop: Prop) -> bool {
        self.prop_set.has(prop)
    }

    pub fn set_prop(&mut self, prop: Prop) {
        self.prop_set.set(prop);
        self.prop_dirty.set(prop);
    }

    pub fn clear_prop(&mut self, prop: Prop) {
        self.prop_set.clear(prop);
        self.prop_dirty.set(prop);
    }

    fn is_meta_command(&self) -> bool {
        self.command.is_empty()
    }
}

#[derive(Debug)]
pub struct Container {
    /// Full path name, `a/b/c`.
    pub name: String,
    pub id: u32,
    /// 0 for root, 1 for the arbor root.
    pub level: usize,
    pub parent: Option<Arc<Container>>,
    children: Mutex<Vec<Weak<Container>>>,
    acquired: AtomicI32,
    running_children: AtomicUsize,
    inner: Mutex<ContainerInner>,
}

impl Container {
    pub fn new(
        name: &str,
        id: u32,
        parent: Option<Arc<Container>>,
        work_dir: &Path,
    ) -> Arc<Self> {
        let level = parent.as_ref().map(|p| p.level + 1).unwrap_or(0);
        let system = id == ROOT_CONTAINER_ID || id == ARBOR_ROOT_CONTAINER_ID;
        let cwd = if system {
            "/".to_string()
        } else {
            work_dir.join(name).to_string_lossy().into_owned()
        };

        let mut inner = ContainerInner::new(cwd);
        if let Some(parent) = &parent {
            let parent_level = parent.lock().access_level;
            if parent_level < AccessLevel::ChildOnly {
                inner.access_level = parent_level;
            }
        }

        Arc::new(Self {
            name: name.to_string(),
            id,
            level,
            parent,
            children: Mutex::new(Vec::new()),
            acquired: AtomicI32::new(0),
            running_children: AtomicUsize::new(0),
            inner: Mutex::new(inner),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, ContainerInner> {
        self.inner.lock().expect("container lock poisoned")
    }

    pub fn state(&self) -> ContainerState {
        self.lock().state
    }

    pub fn is_root(&self) -> bool {
        self.id == ROOT_CONTAINER_ID
    }

    pub fn is_arbor_root(&self) -> bool {
        self.id == ARBOR_ROOT_CONTAINER_ID
    }

    fn is_system(&self) -> bool {
        self.is_root() || self.is_arbor_root()
    }

    /// Short label, the last path segment.
    pub fn short_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    pub fn work_path(&self, holder: &Holder) -> PathBuf {
        holder.work_dir().join(&self.name)
    }

    pub fn cgroup_name(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else if self.is_arbor_root() {
            ARBOR_ROOT_CGROUP.to_string()
        } else {
            format!("{}/{}", ARBOR_ROOT_CGROUP, self.name)
        }
    }

    pub fn get_cgroup<'a>(&self, holder: &'a Holder, kind: SubsystemKind) -> Cgroup<'a> {
        holder.cgroups().cgroup(kind, &self.cgroup_name())
    }

    pub fn traffic_class(&self) -> u32 {
        net::tc_handle(net::ROOT_TC_MAJOR, self.id)
    }

    pub fn add_child(&self, child: &Arc<Container>) {
        self.children
            .lock()
            .expect("children lock poisoned")
            .push(Arc::downgrade(child));
    }

    pub fn children_alive(&self) -> Vec<Arc<Container>> {
        let mut children = self.children.lock().expect("children lock poisoned");
        children.retain(|weak| weak.strong_count() > 0);
        children.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn has_children(&self) -> bool {
        !self.children_alive().is_empty()
    }

    /// Applies `f` preorder over the descendants, parents before their
    /// children, skipping containers in the Unknown state.
    pub fn walk_preorder(
        self: &Arc<Self>,
        f: &mut dyn FnMut(&Arc<Container>) -> Result<()>,
    ) -> Result<()> {
        for child in self.children_alive() {
            if child.state() == ContainerState::Unknown {
                continue;
            }
            f(&child)?;
            child.walk_preorder(f)?;
        }
        Ok(())
    }

    /// Postorder: leaves first.
    pub fn walk_postorder(
        self: &Arc<Self>,
        f: &mut dyn FnMut(&Arc<Container>) -> Result<()>,
    ) -> Result<()> {
        for child in self.children_alive() {
            if child.state() == ContainerState::Unknown {
                continue;
            }
            child.walk_postorder(f)?;
            f(&child)?;
        }
        Ok(())
    }

    // Long operations (stop, destroy, respawn) hold an acquisition so
    // pause and destroy cannot race them.

    pub fn acquire(&self) -> bool {
        if self.is_acquired() {
            return false;
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        true
    }

    pub fn acquire_forced(&self) {
        self.acquired.fetch_add(1, Ordering::SeqCst);
    }

    pub fn release(&self) {
        let was = self.acquired.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(was > 0);
    }

    pub fn is_acquired(&self) -> bool {
        if self.acquired.load(Ordering::SeqCst) > 0 {
            return true;
        }
        match &self.parent {
            Some(parent) => parent.is_acquired(),
            None => false,
        }
    }

    pub fn running_children(&self) -> usize {
        self.running_children.load(Ordering::SeqCst)
    }

    fn update_running_children(&self, delta: isize) {
        let apply = |ct: &Container| {
            if delta > 0 {
                ct.running_children.fetch_add(1, Ordering::SeqCst);
            } else {
                ct.running_children.fetch_sub(1, Ordering::SeqCst);
            }
        };
        apply(self);
        let mut node = self.parent.clone();
        while let Some(parent) = node {
            apply(&parent);
            node = parent.parent.clone();
        }
    }

    fn set_state(&self, inner: &mut ContainerInner, new_state: ContainerState) {
        if inner.state == new_state {
            return;
        }
        info!(
            "{}: change state {} -> {}",
            self.name,
            inner.state.as_str(),
            new_state.as_str()
        );

        if new_state == ContainerState::Running {
            self.update_running_children(1);
        } else if inner.state == ContainerState::Running {
            self.update_running_children(-1);
        }

        inner.state = new_state;

        if new_state != ContainerState::Running && new_state != ContainerState::Meta {
            self.notify_waiters(inner);
        }
    }

    pub fn add_waiter(&self, waiter: &Arc<Waiter>) {
        let mut inner = self.lock();
        inner.waiters.retain(|w| w.strong_count() > 0);
        inner.waiters.push(Arc::downgrade(waiter));
    }

    fn notify_waiters(&self, inner: &mut ContainerInner) {
        inner.waiters.retain(|w| w.strong_count() > 0);
        for weak in &inner.waiters {
            if let Some(waiter) = weak.upgrade() {
                waiter.notify(&self.name);
            }
        }
    }

    fn find_running_parent(&self) -> Option<Arc<Container>> {
        let mut node = self.parent.clone();
        while let Some(parent) = node {
            if parent.lock().task_pid != 0 {
                return Some(parent);
            }
            node = parent.parent.clone();
        }
        None
    }

    /// Closest ancestor (or self) that starts a new isolation domain.
    fn isolation_domain_is_root(&self, self_isolate: bool) -> bool {
        if self_isolate {
            return false;
        }
        let mut node = self.parent.clone();
        while let Some(ct) = node {
            if ct.is_root() {
                return true;
            }
            if ct.lock().isolate {
                return false;
            }
            node = ct.parent.clone();
        }
        true
    }

    fn ancestor_cap_limit(&self) -> CapSet {
        let mut limit = ALL_CAPS;
        let mut node = self.parent.clone();
        while let Some(parent) = node {
            if !parent.is_system() {
                limit = limit.intersect(parent.lock().cap_limit);
            }
            node = parent.parent.clone();
        }
        limit
    }

    fn ancestors_have_mem_limit(&self) -> bool {
        let mut node = self.parent.clone();
        while let Some(parent) = node {
            if parent.lock().mem_limit != 0 {
                return true;
            }
            node = parent.parent.clone();
        }
        false
    }

    /// Recomputes the capability ceilings: owner-root containers may take
    /// anything, otherwise the virt mode picks the ceiling, narrowed by
    /// every ancestor's limit and by an explicit request.
    fn sanitize_capabilities(&self, inner: &mut ContainerInner, ancestor_limit: CapSet) {
        let (mut allowed, mut limit) = if inner.owner_uid == 0 {
            (ALL_CAPS, ALL_CAPS)
        } else {
            let pair = match inner.virt_mode {
                VirtMode::Os => (OS_MODE_CAPS, OS_MODE_CAPS),
                VirtMode::App => (APP_MODE_CAPS, SUID_CAPS),
            };
            (pair.0, pair.1.intersect(ancestor_limit))
        };

        if !inner.has_prop(Prop::Capabilities) {
            inner.cap_limit = limit;
        } else {
            inner.cap_limit = inner.cap_limit.intersect(limit);
            limit = inner.cap_limit;
        }

        if caps::has_ambient_support() {
            allowed = allowed.intersect(limit);
            inner.cap_allowed = allowed;
            inner.cap_ambient = inner.cap_ambient.intersect(allowed);
        }
    }

    fn check_capability_preconditions(
        &self,
        inner: &ContainerInner,
        requested: CapSet,
    ) -> Result<()> {
        if inner.owner_uid == 0 {
            return Ok(());
        }

        let wanted = inner.cap_ambient.union(requested);

        if wanted.intersects(PIDNS_CAPS)
            && !inner.isolate
            && self.isolation_domain_is_root(inner.isolate)
        {
            return Err(ArborError::permission(format!(
                "capabilities require pid isolation: {}",
                wanted.intersect(PIDNS_CAPS)
            )));
        }

        if wanted.intersects(MEMCG_CAPS)
            && inner.mem_limit == 0
            && !self.ancestors_have_mem_limit()
        {
            return Err(ArborError::permission(format!(
                "capabilities require memory limit: {}",
                wanted.intersect(MEMCG_CAPS)
            )));
        }

        let net_mode = NetMode::parse(&inner.net_prop).unwrap_or_default();
        if wanted.intersects(NETNS_CAPS)
            && matches!(net_mode, NetMode::Inherited | NetMode::Host)
        {
            return Err(ArborError::permission(format!(
                "capabilities require net isolation: {}",
                wanted.intersect(NETNS_CAPS)
            )));
        }

        Ok(())
    }

    /// Called once by the holder right after the entity is inserted.
    pub fn create(&self, holder: &Holder, uid: u32, gid: u32, groups: &[u32]) -> Result<()> {
        info!(
            "create {} with id {} uid {} gid {}",
            self.name, self.id, uid, gid
        );
        let mut inner = self.lock();
        inner.owner_uid = uid;
        inner.owner_gid = gid;
        inner.owner_groups = groups.to_vec();
        inner.set_prop(Prop::User);
        inner.set_prop(Prop::Group);

        let ancestor_limit = self.ancestor_cap_limit();
        self.sanitize_capabilities(&mut inner, ancestor_limit);

        self.set_state(&mut inner, ContainerState::Stopped);
        inner.set_prop(Prop::State);

        inner.respawn_count = 0;
        inner.set_prop(Prop::RespawnCount);

        self.save_locked(holder, &inner)
    }

    // resource allocation

    fn prepare_work_dir(&self, holder: &Holder, inner: &ContainerInner) -> Result<()> {
        if self.is_system() {
            return Ok(());
        }
        let work = self.work_path(holder);
        if work.exists() {
            return Ok(());
        }
        std::fs::create_dir(&work)
            .map_err(|err| ArborError::from(err).wrap("create working dir"))?;
        let _ = nix::unistd::chown(
            &work,
            Some(nix::unistd::Uid::from_raw(inner.owner_uid)),
            Some(nix::unistd::Gid::from_raw(inner.owner_gid)),
        );
        Ok(())
    }

    fn prepare_oom_monitor(&self, holder: &Holder, inner: &mut ContainerInner) -> Result<()> {
        let memcg = self.get_cgroup(holder, SubsystemKind::Memory);
        if !memcg.has_knob(memory::OOM_CONTROL) {
            info!("{}: no oom_control knob, oom monitor disabled", self.name);
            return Ok(());
        }

        let event = holder.cgroups().memory.setup_oom_event(&memcg)?;
        holder.epoll().add_source(
            event.as_raw_fd(),
            SourceTag::Oom {
                container: self.name.clone(),
            },
        )?;
        inner.oom_event = Some(event);
        Ok(())
    }

    fn shutdown_oom(&self, holder: &Holder, inner: &mut ContainerInner) {
        if let Some(event) = inner.oom_event.take() {
            holder.epoll().remove_source(event.as_raw_fd());
        }
    }

    pub fn owns_oom_fd(&self, fd: i32) -> bool {
        let inner = self.lock();
        inner
            .oom_event
            .as_ref()
            .map(|event| event.as_raw_fd() == fd)
            .unwrap_or(false)
    }

    pub fn may_receive_oom(&self, fd: i32) -> bool {
        let inner = self.lock();
        let owns = inner
            .oom_event
            .as_ref()
            .map(|event| event.as_raw_fd() == fd)
            .unwrap_or(false);
        owns && inner.task_pid != 0 && inner.state != ContainerState::Dead
    }

    /// Drains the OOM eventfd; reads true at most once.
    fn has_oom_received(inner: &ContainerInner) -> bool {
        let Some(event) = &inner.oom_event else {
            return false;
        };
        let mut buf = [0u8; 8];
        matches!(nix::unistd::read(event, &mut buf), Ok(8)) && u64::from_ne_bytes(buf) != 0
    }

    fn prepare_cgroups(&self, holder: &Holder, inner: &mut ContainerInner) -> Result<()> {
        let name = self.cgroup_name();
        for subsys in holder.cgroups().hierarchies() {
            let cg = holder.cgroups().cgroup(subsys.kind, &name);
            if cg.exists() {
                continue;
            }
            cg.create()?;
        }

        if self.is_arbor_root() {
            let memcg = self.get_cgroup(holder, SubsystemKind::Memory);
            if memcg.has_knob(memory::USE_HIERARCHY) {
                holder.cgroups().memory.set_use_hierarchy(&memcg)?;
            }
        }

        if !self.is_system() {
            self.prepare_oom_monitor(holder, inner).map_err(|err| {
                error!("cannot prepare oom monitoring: {}", err);
                err
            })?;
        }

        Ok(())
    }

    fn prepare_root_volume(&self, holder: &Holder, inner: &mut ContainerInner) -> Result<()> {
        if !inner.has_prop(Prop::Root) || !inner.root_path.is_file() {
            return Ok(());
        }
        let storage = inner.root_path.clone();
        let mount_dir = self.work_path(holder).join("root");
        let volume = holder
            .volumes()
            .acquire_root(&storage, &mount_dir, inner.root_ro)?;
        inner.root_path = volume.path.clone();
        inner.root_volume = Some(volume);
        Ok(())
    }

    fn prepare_resources(&self, holder: &Holder, inner: &mut ContainerInner) -> Result<()> {
        if let Err(err) = self.prepare_work_dir(holder, inner) {
            error!("cannot create working dir: {}", err);
            self.free_resources(holder, inner);
            return Err(err);
        }
        if let Err(err) = self.prepare_cgroups(holder, inner) {
            error!("cannot prepare task cgroups: {}", err);
            self.free_resources(holder, inner);
            return Err(err);
        }
        if let Err(err) = self.prepare_root_volume(holder, inner) {
            error!("cannot prepare root volume: {}", err);
            self.free_resources(holder, inner);
            return Err(err);
        }
        Ok(())
    }

    fn free_resources(&self, holder: &Holder, inner: &mut ContainerInner) {
        self.shutdown_oom(holder, inner);

        if !self.is_root() {
            let name = self.cgroup_name();
            for subsys in holder.cgroups().hierarchies() {
                let cg = holder.cgroups().cgroup(subsys.kind, &name);
                let _ = cg.remove();
            }
        }

        if inner.net_attached {
            let handle = self.traffic_class();
            if let Err(err) = holder.host_net().destroy_tc(handle) {
                error!("cannot remove traffic class: {}", err);
            }
            inner.net_attached = false;
        }

        if self.is_system() {
            return;
        }

        if let Some(volume) = inner.root_volume.take() {
            if let Err(err) = holder.volumes().release(&volume) {
                error!("cannot release root volume: {}", err);
            }
            inner.root_path = PathBuf::from("/");
        }

        let work = self.work_path(holder);
        if work.exists() {
            inner.stdout.remove(&work);
            inner.stderr.remove(&work);
            if let Err(err) = std::fs::remove_dir_all(&work) {
                error!("cannot remove working dir: {}", err);
            }
        }
    }

    /// Creates or updates this container's traffic class, linked under
    /// the closest running meta ancestor.
    fn update_traffic_classes(&self, holder: &Holder, inner: &ContainerInner) -> Result<()> {
        let mut parent_handle = net::tc_handle(net::ROOT_TC_MAJOR, net::ROOT_TC_MINOR);
        let mut node = self.parent.clone();
        while let Some(parent) = node {
            let state = parent.state();
            if state == ContainerState::Meta {
                parent_handle = parent.traffic_class();
                break;
            }
            if state == ContainerState::Stopped {
                return Ok(());
            }
            node = parent.parent.clone();
        }

        holder.host_net().create_tc(
            self.traffic_class(),
            parent_handle,
            !inner.is_meta_command(),
            &inner.net_priority,
            &inner.net_guarantee,
            &inner.net_limit,
        )
    }

    fn prepare_network(&self, holder: &Holder, inner: &mut ContainerInner) -> Result<()> {
        let mode = NetMode::parse(&inner.net_prop)?;
        if mode == NetMode::None {
            return Ok(());
        }

        if let Err(err) = self.update_traffic_classes(holder, inner) {
            info!("refresh network after {}", err);
            holder.host_net().refresh_classes();
            self.update_traffic_classes(holder, inner)?;
        }
        inner.net_attached = true;

        if !self.is_root() {
            let netcls = self.get_cgroup(holder, SubsystemKind::NetCls);
            if netcls.exists() {
                netcls.set("net_cls.classid", &self.traffic_class().to_string())?;
            }
        }
        Ok(())
    }

    /// Pushes every dirty resource property into its controller. The
    /// dirty bit is cleared on success; on failure the caller restores
    /// the old value and re-asserts the bit.
    pub fn apply_dynamic_properties(
        &self,
        holder: &Holder,
        inner: &mut ContainerInner,
    ) -> Result<()> {
        let memcg = self.get_cgroup(holder, SubsystemKind::Memory);
        let cgroups = holder.cgroups();

        if inner.prop_dirty.test_clear(Prop::MemGuarantee) {
            cgroups.memory.set_guarantee(&memcg, inner.mem_guarantee)?;
        }

        if inner.prop_dirty.test_clear(Prop::MemLimit) {
            cgroups.memory.set_limit(&memcg, inner.mem_limit).map_err(|err| {
                if err.errno() == Some(Errno::EBUSY) {
                    ArborError::with_errno(
                        ErrorKind::InvalidValue,
                        Errno::EBUSY,
                        format!("{} is too low", inner.mem_limit),
                    )
                } else {
                    err
                }
            })?;
        }

        if inner.prop_dirty.test_clear(Prop::AnonLimit) {
            cgroups.memory.set_anon_limit(&memcg, inner.anon_limit)?;
        }

        if inner.prop_dirty.test_clear(Prop::DirtyLimit) {
            cgroups.memory.set_dirty_limit(&memcg, inner.dirty_limit)?;
        }

        if inner.prop_dirty.test_clear(Prop::RechargeOnPgfault) {
            cgroups
                .memory
                .recharge_on_pgfault(&memcg, inner.recharge_on_pgfault)?;
        }

        if inner.prop_dirty.test_clear(Prop::IoLimit) {
            cgroups.memory.set_io_limit(&memcg, inner.io_limit)?;
        }

        if inner.prop_dirty.test_clear(Prop::IoOpsLimit) {
            cgroups.memory.set_iops_limit(&memcg, inner.io_ops_limit)?;
        }

        if inner.prop_dirty.test_clear(Prop::IoPolicy) {
            let blkcg = self.get_cgroup(holder, SubsystemKind::Blkio);
            cgroups.blkio.set_io_policy(&blkcg, &inner.io_policy)?;
        }

        let cpu_dirty = inner.prop_dirty.test_clear(Prop::CpuPolicy)
            | inner.prop_dirty.test_clear(Prop::CpuLimit)
            | inner.prop_dirty.test_clear(Prop::CpuGuarantee);
        if cpu_dirty {
            let cpucg = self.get_cgroup(holder, SubsystemKind::Cpu);
            cgroups.cpu.set_policy(
                &cpucg,
                &inner.cpu_policy,
                inner.cpu_guarantee,
                inner.cpu_limit,
            )?;
        }

        let net_dirty = inner.prop_dirty.test_clear(Prop::NetPrio)
            | inner.prop_dirty.test_clear(Prop::NetLimit)
            | inner.prop_dirty.test_clear(Prop::NetGuarantee);
        if net_dirty && inner.net_attached {
            self.update_traffic_classes(holder, inner)?;
        }

        Ok(())
    }

    /// The meta soft-limit rule: a meta container with no running
    /// children is squeezed to 1 MiB, otherwise it gets the root default.
    pub fn update_soft_limit(&self, holder: &Holder) -> Result<()> {
        if let Some(parent) = &self.parent {
            parent.update_soft_limit(holder)?;
        }
        if self.is_system() {
            return Ok(());
        }

        if self.state() != ContainerState::Meta {
            return Ok(());
        }

        let root_cg = holder.cgroups().root_cgroup(SubsystemKind::Memory);
        let default_limit = holder.cgroups().memory.get_soft_limit(&root_cg)?;
        let limit = if self.running_children() > 0 {
            default_limit
        } else {
            1 << 20
        };

        let memcg = self.get_cgroup(holder, SubsystemKind::Memory);
        let current = holder.cgroups().memory.get_soft_limit(&memcg)?;
        if current != limit {
            holder.cgroups().memory.set_soft_limit(&memcg, limit)?;
        }
        Ok(())
    }

    // lifecycle

    pub fn start(self: &Arc<Self>, holder: &Holder, meta: bool) -> Result<()> {
        // Parent-derived data is collected before our own lock.
        let parent_snapshot = match &self.parent {
            Some(parent) => {
                let state = parent.state();
                if !self.is_arbor_root()
                    && !parent.is_root()
                    && state != ContainerState::Running
                    && state != ContainerState::Meta
                {
                    return Err(ArborError::invalid_state(format!(
                        "parent {} is {}",
                        parent.name,
                        state.as_str()
                    )));
                }
                let frozen = holder
                    .cgroups()
                    .freezer
                    .is_frozen(&parent.get_cgroup(holder, SubsystemKind::Freezer));
                if frozen {
                    return Err(ArborError::invalid_state("parent container is paused"));
                }
                let p = parent.lock();
                Some(ParentSnapshot {
                    root_path: p.root_path.clone(),
                    owner_uid: p.owner_uid,
                    cpu_policy: p.cpu_policy.clone(),
                    io_policy: p.io_policy.clone(),
                    recharge_on_pgfault: p.recharge_on_pgfault,
                    net_priority: p.net_priority.clone(),
                    ulimits: p.ulimits.clone(),
                    umask: p.umask,
                    access_level: p.access_level,
                })
            }
            None => None,
        };
        let ancestor_caps = self.ancestor_cap_limit();

        let mut inner = self.lock();
        if inner.state != ContainerState::Stopped {
            return Err(ArborError::invalid_state(format!(
                "container is {}, not stopped",
                inner.state.as_str()
            )));
        }

        if let Some(parent) = &parent_snapshot {
            let path = normalize_path(&inner.root)?;
            inner.root_path = if path == Path::new("/") {
                parent.root_path.clone()
            } else {
                parent
                    .root_path
                    .join(path.strip_prefix("/").unwrap_or(&path))
            };
        }

        if inner.virt_mode == VirtMode::Os && inner.owner_uid != 0 {
            if self.isolation_domain_is_root(inner.isolate) {
                return Err(ArborError::permission(
                    "virt_mode=os must be isolated from host",
                ));
            }
            if !inner.isolate
                && parent_snapshot
                    .as_ref()
                    .map(|p| p.owner_uid != inner.owner_uid)
                    .unwrap_or(false)
            {
                return Err(ArborError::permission(
                    "virt_mode=os without isolation only for root or owner",
                ));
            }
            if inner.root_path == Path::new("/") {
                return Err(ArborError::permission(
                    "virt_mode=os without chroot only for root",
                ));
            }
        }

        if inner.virt_mode == VirtMode::Os {
            if !inner.has_prop(Prop::Cwd) {
                inner.cwd = "/".to_string();
            }
            if !inner.has_prop(Prop::Command) {
                inner.command = "/sbin/init".to_string();
            }
            if !inner.has_prop(Prop::StdoutPath) {
                inner.stdout.outside = "/dev/null".to_string();
            }
            if !inner.has_prop(Prop::StderrPath) {
                inner.stderr.outside = "/dev/null".to_string();
            }
            if !inner.has_prop(Prop::BindDns) {
                inner.bind_dns = false;
            }
            if !inner.has_prop(Prop::Net) {
                inner.net_prop = vec!["none".to_string()];
            }
        }

        if !inner.isolate {
            if let Some(parent) = &parent_snapshot {
                if !inner.has_prop(Prop::CpuPolicy) {
                    inner.cpu_policy = parent.cpu_policy.clone();
                }
                if !inner.has_prop(Prop::IoPolicy) {
                    inner.io_policy = parent.io_policy.clone();
                }
                if !inner.has_prop(Prop::RechargeOnPgfault) {
                    inner.recharge_on_pgfault = parent.recharge_on_pgfault;
                }
                if !inner.has_prop(Prop::NetPrio) {
                    inner.net_priority = parent.net_priority.clone();
                }
                if !inner.has_prop(Prop::Ulimit) {
                    inner.ulimits = parent.ulimits.clone();
                }
                if !inner.has_prop(Prop::Umask) {
                    inner.umask = parent.umask;
                }
            }
        }

        if !meta && inner.command.is_empty() {
            return Err(ArborError::invalid_value("container command is empty"));
        }

        let requested = if inner.has_prop(Prop::Capabilities) {
            inner.cap_limit
        } else {
            NO_CAPS
        };
        self.sanitize_capabilities(&mut inner, ancestor_caps);
        self.check_capability_preconditions(&inner, requested)?;

        if let Some(parent) = &parent_snapshot {
            if parent.access_level < AccessLevel::ChildOnly
                && parent.access_level < inner.access_level
            {
                inner.access_level = parent.access_level;
            }
        }

        info!("start {} {}", self.name, self.id);

        inner.start_time_ms = current_time_ms();
        inner.set_prop(Prop::StartTime);

        self.prepare_resources(holder, &mut inner)?;

        let start_result = (|| -> Result<()> {
            self.prepare_network(holder, &mut inner)?;

            if !self.is_root() {
                self.apply_dynamic_properties(holder, &mut inner)?;
            }

            if (!meta || inner.isolate) && !self.is_system() {
                let task_env = self.build_task_env(holder, &inner)?;
                match task_env.start() {
                    Ok(task) => {
                        inner.task_pid = task.pid;
                        inner.task_vpid = task.vpid;
                        inner.wait_task_pid = task.wait_pid;
                        inner.set_prop(Prop::RootPid);
                        info!("{} started {}", self.name, task.pid);
                    }
                    Err(err) => {
                        if Self::has_oom_received(&inner) {
                            info!("start error: {}", err);
                            return Err(ArborError::with_errno(
                                ErrorKind::InvalidValue,
                                Errno::ENOMEM,
                                "OOM, memory limit too low",
                            ));
                        }
                        return Err(err);
                    }
                }
            }
            Ok(())
        })();

        if let Err(err) = start_result {
            self.free_resources(holder, &mut inner);
            return Err(err);
        }

        if meta {
            self.set_state(&mut inner, ContainerState::Meta);
        } else {
            self.set_state(&mut inner, ContainerState::Running);
        }

        let save_result = self.save_locked(holder, &inner);
        drop(inner);

        if let Err(err) = self.update_soft_limit(holder) {
            warn!("cannot update meta soft limit: {}", err);
        }

        save_result
    }

    fn build_task_env(&self, holder: &Holder, inner: &ContainerInner) -> Result<TaskEnv> {
        let parent = self.find_running_parent();
        let work_dir = self.work_path(holder);

        let mut env = TaskEnv::new(&self.name, inner, &work_dir)?;

        for subsys in holder.cgroups().hierarchies() {
            env.cgroup_paths
                .push(holder.cgroups().cgroup(subsys.kind, &self.cgroup_name()).path());
        }

        // environment inherited from ancestors up to the isolation domain
        let mut ancestor_env: Vec<Vec<String>> = Vec::new();
        let mut node = self.parent.clone();
        let mut isolated = inner.isolate;
        while let (false, Some(ct)) = (isolated, node) {
            let p = ct.lock();
            ancestor_env.push(p.env.clone());
            isolated = p.isolate;
            node = ct.parent.clone();
        }
        env.inherit_env(&ancestor_env)?;

        if let Some(parent) = parent {
            let parent_pid = parent.lock().task_pid;
            env.open_parent_namespaces(parent_pid)?;
            if inner.isolate
                && !crate::arbor::util::in_same_pid_namespace(
                    Pid::from_raw(parent_pid),
                    Pid::this(),
                )
            {
                env.triple_fork = true;
            }
        }

        env.quadro_fork =
            inner.virt_mode == VirtMode::App && inner.isolate && !inner.command.is_empty();

        Ok(env)
    }

    /// Brings every task in the container to a stop. With a deadline and
    /// a live task the container first gets a chance to exit on SIGTERM;
    /// afterwards SIGKILL sweeps run, with a freeze to stop forks racing
    /// the final pass.
    pub fn terminate(&self, holder: &Holder, inner: &mut ContainerInner, deadline: u64) -> Result<()> {
        if self.is_root() {
            return Err(ArborError::permission("cannot terminate root container"));
        }

        info!("terminate tasks in {}", self.name);

        let freezer = self.get_cgroup(holder, SubsystemKind::Freezer);
        if freezer.is_empty() {
            return Ok(());
        }

        if holder.cgroups().freezer.is_frozen(&freezer) {
            return Err(ArborError::permission("cannot terminate paused container"));
        }

        if inner.task_pid != 0 && deadline != 0 && inner.state != ContainerState::Meta {
            let task = Task::new(inner.task_pid);
            if task.kill(Signal::SIGTERM).is_ok() {
                info!("wait task {} after SIGTERM in {}", task.pid, self.name);
                while task.exists() && !task.is_zombie() && !wait_deadline(deadline) {}
            }
        }

        for _pass in 0..3 {
            if freezer.is_empty() {
                return Ok(());
            }
            freezer.kill_all(Signal::SIGKILL)?;
        }

        holder.cgroups().freezer.freeze(&freezer)?;
        let kill_result = freezer.kill_all(Signal::SIGKILL);
        if holder.cgroups().freezer.thaw(&freezer, true).is_ok() && kill_result.is_ok() {
            while !freezer.is_empty() && !wait_deadline(deadline) {}
        }

        kill_result
    }

    fn stop_one(&self, holder: &Holder, deadline: u64) -> Result<()> {
        let mut inner = self.lock();
        if inner.state == ContainerState::Stopped {
            return Err(ArborError::invalid_state("container already stopped"));
        }

        info!("stop {}", self.name);

        if !self.is_root() {
            self.terminate(holder, &mut inner, deadline).map_err(|err| {
                error!("cannot terminate tasks in container: {}", err);
                err
            })?;
        }

        inner.task_pid = 0;
        inner.task_vpid = 0;
        inner.wait_task_pid = 0;
        inner.clear_prop(Prop::RootPid);

        inner.death_time_ms = 0;
        inner.clear_prop(Prop::DeathTime);

        inner.exit_status = 0;
        inner.clear_prop(Prop::ExitStatus);

        inner.oom_killed = false;
        inner.clear_prop(Prop::OomKilled);

        self.set_state(&mut inner, ContainerState::Stopped);
        self.free_resources(holder, &mut inner);

        self.save_locked(holder, &inner)
    }

    pub fn stop(self: &Arc<Self>, holder: &Holder, timeout_ms: u64) -> Result<()> {
        let deadline = if timeout_ms != 0 {
            current_time_ms() + timeout_ms
        } else {
            0
        };

        let freezer = self.get_cgroup(holder, SubsystemKind::Freezer);
        if holder.cgroups().freezer.is_frozen(&freezer) {
            if holder.cgroups().freezer.is_parent_freezing(&freezer) {
                return Err(ArborError::invalid_state("parent container is paused"));
            }

            info!("terminate paused container {}", self.name);
            freezer.kill_all(Signal::SIGKILL)?;

            self.walk_postorder(&mut |child| {
                let cg = child.get_cgroup(holder, SubsystemKind::Freezer);
                cg.kill_all(Signal::SIGKILL)?;
                holder.cgroups().freezer.thaw(&cg, false)
            })?;

            holder.cgroups().freezer.thaw(&freezer, true)?;
        }

        self.walk_postorder(&mut |child| {
            if child.state() != ContainerState::Stopped {
                child.stop_one(holder, deadline)
            } else {
                Ok(())
            }
        })?;

        self.stop_one(holder, deadline)?;

        if let Err(err) = self.update_soft_limit(holder) {
            warn!("cannot update meta soft limit: {}", err);
        }
        Ok(())
    }

    /// Records the death of the container's task tree: terminate
    /// stragglers, close the OOM monitor, rotate streams and move to Dead
    /// (Stopped for a pure meta container).
    pub fn reap(self: &Arc<Self>, holder: &Holder, oom_killed: bool) {
        let mut inner = self.lock();

        if let Err(err) = self.terminate(holder, &mut inner, 0) {
            warn!("cannot terminate container {}: {}", self.name, err);
        }

        self.shutdown_oom(holder, &mut inner);

        inner.death_time_ms = current_time_ms();
        inner.set_prop(Prop::DeathTime);

        if oom_killed {
            inner.oom_killed = true;
            inner.set_prop(Prop::OomKilled);
        }

        inner.task_pid = 0;
        inner.task_vpid = 0;
        inner.wait_task_pid = 0;
        inner.clear_prop(Prop::RootPid);

        let work = self.work_path(holder);
        let _ = inner.stdout.rotate(&work);
        let _ = inner.stderr.rotate(&work);

        if inner.state == ContainerState::Meta {
            self.set_state(&mut inner, ContainerState::Stopped);
        } else {
            self.set_state(&mut inner, ContainerState::Dead);
        }

        if let Err(err) = self.save_locked(holder, &inner) {
            warn!("cannot save container state after exit: {}", err);
        }

        let may_respawn = self.may_respawn_locked(&inner);
        drop(inner);

        if may_respawn {
            self.schedule_respawn(holder);
        }
    }

    /// Task-exit entry point: reaps the whole subtree preorder, then
    /// itself, after rewriting statuses the sub-init passes through.
    pub fn exit(self: &Arc<Self>, holder: &Holder, status: i32, oom_killed: bool) {
        let mut status = status;
        {
            let mut inner = self.lock();
            // the sub-init cannot kill itself with a fatal signal; it
            // encodes them as 128 + signo
            let code = crate::arbor::util::status_exit_code(status);
            if inner.isolate && inner.virt_mode == VirtMode::App {
                if let Some(code) = code {
                    if code > 128 && code < 128 + libc::SIGRTMIN() {
                        status = code - 128;
                    }
                }
            }

            info!(
                "exit {} {} {}",
                self.name,
                crate::arbor::util::format_exit_status(status),
                if oom_killed { "invoked by OOM" } else { "" }
            );

            inner.exit_status = status;
            inner.set_prop(Prop::ExitStatus);
        }

        let _ = self.walk_preorder(&mut |child| {
            let state = child.state();
            if state != ContainerState::Stopped && state != ContainerState::Dead {
                child.reap(holder, oom_killed);
            }
            Ok(())
        });

        self.reap(holder, oom_killed);
    }

    fn check_acquired_child(self: &Arc<Self>) -> Result<()> {
        self.walk_preorder(&mut |child| {
            if child.acquired.load(Ordering::SeqCst) > 0 {
                return Err(ArborError::busy(format!("child {} is busy", child.name)));
            }
            Ok(())
        })
    }

    pub fn pause(self: &Arc<Self>, holder: &Holder) -> Result<()> {
        {
            let inner = self.lock();
            if inner.state != ContainerState::Running && inner.state != ContainerState::Meta {
                return Err(ArborError::invalid_state("container is not running"));
            }
        }

        // a subtree mid-stop or mid-destroy must not be frozen under it
        self.check_acquired_child()?;

        let freezer = self.get_cgroup(holder, SubsystemKind::Freezer);
        holder.cgroups().freezer.freeze(&freezer)?;

        {
            let mut inner = self.lock();
            self.set_state(&mut inner, ContainerState::Paused);
            self.save_locked(holder, &inner)?;
        }

        let _ = self.walk_preorder(&mut |child| {
            let mut inner = child.lock();
            if inner.state == ContainerState::Running || inner.state == ContainerState::Meta {
                child.set_state(&mut inner, ContainerState::Paused);
            }
            child.save_locked(holder, &inner)
        });

        Ok(())
    }

    pub fn resume(self: &Arc<Self>, holder: &Holder) -> Result<()> {
        let freezer = self.get_cgroup(holder, SubsystemKind::Freezer);
        if holder.cgroups().freezer.is_parent_freezing(&freezer) {
            return Err(ArborError::invalid_state("parent container is paused"));
        }
        if !holder.cgroups().freezer.is_self_freezing(&freezer) {
            return Err(ArborError::invalid_state("container is not paused"));
        }

        holder.cgroups().freezer.thaw(&freezer, true)?;

        {
            let mut inner = self.lock();
            if inner.state == ContainerState::Paused {
                let next = if inner.is_meta_command() {
                    ContainerState::Meta
                } else {
                    ContainerState::Running
                };
                self.set_state(&mut inner, next);
            }
            self.save_locked(holder, &inner)?;
        }

        let _ = self.walk_preorder(&mut |child| {
            let cg = child.get_cgroup(holder, SubsystemKind::Freezer);
            if holder.cgroups().freezer.is_self_freezing(&cg) {
                let _ = holder.cgroups().freezer.thaw(&cg, true);
            }
            let mut inner = child.lock();
            if inner.state == ContainerState::Paused {
                let next = if inner.is_meta_command() {
                    ContainerState::Meta
                } else {
                    ContainerState::Running
                };
                child.set_state(&mut inner, next);
            }
            child.save_locked(holder, &inner)
        });

        Ok(())
    }

    pub fn kill(&self, sig: Signal) -> Result<()> {
        let inner = self.lock();
        if inner.state != ContainerState::Running {
            return Err(ArborError::invalid_state("container is not running"));
        }
        info!("kill {} pid {}", self.name, inner.task_pid);
        kill(Pid::from_raw(inner.task_pid), sig)
            .map_err(|errno| ArborError::from(errno).wrap("kill container task"))
    }

    // respawn

    fn may_respawn_locked(&self, inner: &ContainerInner) -> bool {
        if inner.state != ContainerState::Dead || !inner.to_respawn {
            return false;
        }
        let parent_live = match &self.parent {
            Some(parent) => matches!(
                parent.state(),
                ContainerState::Running | ContainerState::Meta
            ),
            None => false,
        };
        if !parent_live {
            return false;
        }
        inner.max_respawns < 0 || inner.respawn_count < inner.max_respawns as u64
    }

    pub fn may_respawn(&self) -> bool {
        let inner = self.lock();
        self.may_respawn_locked(&inner)
    }

    fn schedule_respawn(&self, holder: &Holder) {
        holder.queue().add(
            config::respawn_delay_ms(),
            Event::Respawn {
                name: self.name.clone(),
            },
        );
    }

    /// Stop plus start, counting the attempt. Fails without retry when
    /// the container is busy.
    pub fn respawn(self: &Arc<Self>, holder: &Holder) -> Result<()> {
        if !self.acquire() {
            return Err(ArborError::busy("cannot respawn busy container"));
        }
        let result = (|| {
            self.stop(holder, config::kill_timeout_ms())?;
            let start_result = self.start(holder, false);
            {
                let mut inner = self.lock();
                inner.respawn_count += 1;
                inner.set_prop(Prop::RespawnCount);
                let _ = self.save_locked(holder, &inner);
            }
            start_result
        })();
        self.release();
        result
    }

    pub fn can_remove_dead(&self) -> bool {
        let inner = self.lock();
        inner.state == ContainerState::Dead
            && inner.death_time_ms / 1000 + inner.aging_time_s <= current_time_ms() / 1000
    }

    // properties

    pub fn get_property(&self, holder: &Holder, name: &str) -> Result<String> {
        if let Some(dot) = name.find('.') {
            let prefix = &name[..dot];
            if let Some(kind) = SubsystemKind::ALL
                .iter()
                .copied()
                .find(|k| k.as_str() == prefix)
            {
                let inner = self.lock();
                if inner.state == ContainerState::Stopped {
                    return Err(ArborError::invalid_state(format!(
                        "not available in stopped state: {}",
                        name
                    )));
                }
                drop(inner);
                let cg = self.get_cgroup(holder, kind);
                if !cg.has_knob(name) {
                    return Err(ArborError::invalid_property(format!(
                        "unknown cgroup attribute: {}",
                        name
                    )));
                }
                return cg.get(name);
            }
        }

        match name {
            "cpu_usage" => {
                let cg = self.get_cgroup(holder, SubsystemKind::Cpuacct);
                return holder.cgroups().cpuacct.usage(&cg).map(|v| v.to_string());
            }
            "memory_usage" => {
                let cg = self.get_cgroup(holder, SubsystemKind::Memory);
                return holder.cgroups().memory.usage(&cg).map(|v| v.to_string());
            }
            "parent" => {
                return self
                    .parent
                    .as_ref()
                    .map(|p| p.name.clone())
                    .ok_or_else(|| ArborError::invalid_data("root container has no parent"));
            }
            "stdout" => {
                let inner = self.lock();
                return Ok(inner.stdout.read_tail(&self.work_path(holder)));
            }
            "stderr" => {
                let inner = self.lock();
                return Ok(inner.stderr.read_tail(&self.work_path(holder)));
            }
            _ => {}
        }

        let def = property::find(name).ok_or_else(|| {
            ArborError::invalid_property(format!("unknown container property: {}", name))
        })?;
        let inner = self.lock();
        (def.get)(&inner)
    }

    pub fn set_property(&self, holder: &Holder, name: &str, value: &str) -> Result<()> {
        if self.is_system() {
            return Err(ArborError::permission("system containers are read only"));
        }

        let def = property::find(name).ok_or_else(|| {
            ArborError::invalid_property(format!("unknown container property: {}", name))
        })?;
        if def.read_only {
            return Err(ArborError::invalid_property(format!(
                "property {} is read-only",
                name
            )));
        }

        let value = value.trim();
        let mut inner = self.lock();

        let live = matches!(
            inner.state,
            ContainerState::Running | ContainerState::Meta | ContainerState::Paused
        );
        if inner.state != ContainerState::Stopped && !def.dynamic {
            return Err(ArborError::invalid_state(format!(
                "cannot set static property {} while container is {}",
                name,
                inner.state.as_str()
            )));
        }

        let old_value = (def.get)(&inner)?;
        (def.set)(&mut inner, value)?;
        inner.set_prop(def.prop);

        if live {
            if let Err(err) = self.apply_dynamic_properties(holder, &mut inner) {
                let _ = (def.set)(&mut inner, &old_value);
                inner.prop_dirty.clear(def.prop);
                return Err(err);
            }
        }

        self.save_locked(holder, &inner)
    }

    // persistence

    fn save_locked(&self, holder: &Holder, inner: &ContainerInner) -> Result<()> {
        let mut data = BTreeMap::new();
        data.insert("id".to_string(), self.id.to_string());
        data.insert("name".to_string(), self.name.clone());

        for def in property::registry() {
            if !inner.prop_set.has(def.prop) {
                continue;
            }
            let getter = def.get_save.unwrap_or(def.get);
            let value = getter(inner)?;
            data.insert(def.name.to_string(), value);
        }

        holder.kv().node(self.id).save(&data)
    }

    pub fn save(&self, holder: &Holder) -> Result<()> {
        let inner = self.lock();
        self.save_locked(holder, &inner)
    }

    /// Applies a kv snapshot. Unknown keys and broken values are skipped
    /// so one bad property cannot block a restore; state is applied last
    /// because other setters depend on it.
    pub fn load(&self, data: &BTreeMap<String, String>) -> Result<()> {
        let mut inner = self.lock();
        let mut state_value = None;

        for (key, value) in data {
            if key == "id" || key == "name" {
                continue;
            }
            if key == "state" {
                state_value = Some(value.clone());
                continue;
            }

            let Some(def) = property::find(key) else {
                warn!("unknown property: {}, skipped", key);
                continue;
            };
            let setter = def.set_restore.unwrap_or(def.set);
            if let Err(err) = setter(&mut inner, value) {
                error!("cannot load {}: {}, skipped", key, err);
                continue;
            }
            inner.prop_set.set(def.prop);
        }

        match state_value {
            Some(value) => {
                inner.state = ContainerState::parse(&value)?;
                inner.prop_set.set(Prop::State);
                Ok(())
            }
            None => Err(ArborError::unknown("container has no state")),
        }
    }

    /// Reconciles recorded state with what the kernel actually has after
    /// a restart: missing freezer means stopped, a dead or missing task
    /// means reap, stray tasks get reattached to their cgroups.
    pub fn sync_state(self: &Arc<Self>, holder: &Holder) {
        let freezer = self.get_cgroup(holder, SubsystemKind::Freezer);
        info!("sync {} state {}", self.name, self.state().as_str());

        if !freezer.exists() {
            let mut inner = self.lock();
            if inner.state != ContainerState::Stopped {
                warn!("{}: freezer not found", self.name);
            }
            inner.state = ContainerState::Stopped;
            return;
        }

        let (state, wait_pid, isolate) = {
            let inner = self.lock();
            (inner.state, inner.wait_task_pid, inner.isolate)
        };
        let wait_task = Task::new(wait_pid);

        if state == ContainerState::Stopped {
            info!("{}: found unexpected freezer", self.name);
            self.reap(holder, false);
        } else if state == ContainerState::Meta && wait_pid == 0 && !isolate {
            // plain meta container, nothing to check
        } else if !wait_task.exists() {
            if state != ContainerState::Dead {
                info!("{}: task not found", self.name);
            }
            self.reap(holder, false);
        } else if wait_task.ppid() != Some(nix::unistd::getppid()) {
            info!("{}: wrong task ppid", self.name);
            self.reap(holder, false);
        } else if wait_task.is_zombie() {
            info!("{}: task is zombie", self.name);
            self.lock().task_pid = 0;
        } else {
            match holder
                .cgroups()
                .task_cgroup(SubsystemKind::Freezer, Pid::from_raw(wait_pid))
            {
                Err(_) => {
                    info!("{}: cannot check freezer", self.name);
                    self.reap(holder, false);
                }
                Ok(task_cg) if task_cg.name != freezer.name => {
                    info!("{}: task in wrong freezer", self.name);
                    let _ = wait_task.kill(Signal::SIGKILL);
                    let _ = Task::new(self.lock().task_pid).kill(Signal::SIGKILL);
                    self.reap(holder, false);
                }
                Ok(_) => {}
            }
        }

        // herd stray tasks back into their cgroups
        if let Ok(tasks) = freezer.get_tasks() {
            for pid in tasks {
                for subsys in holder.cgroups().hierarchies() {
                    let correct = holder.cgroups().cgroup(subsys.kind, &self.cgroup_name());
                    let Ok(current) = holder.cgroups().task_cgroup(subsys.kind, pid) else {
                        continue;
                    };
                    if current.name == correct.name {
                        continue;
                    }
                    let Ok(freezer_now) =
                        holder.cgroups().task_cgroup(SubsystemKind::Freezer, pid)
                    else {
                        continue;
                    };
                    if freezer_now.name != freezer.name {
                        continue;
                    }
                    warn!(
                        "task {} in {} while should be in {}",
                        pid, current, correct
                    );
                    let _ = correct.attach(pid);
                }
            }
        }
    }

    /// Restores one container from its snapshot during daemon startup.
    pub fn restore(self: &Arc<Self>, holder: &Holder, data: &BTreeMap<String, String>) -> Result<()> {
        info!("restore container {}", self.name);

        self.load(data)?;
        self.sync_state(holder);

        {
            let mut inner = self.lock();
            if inner.task_pid != 0 {
                inner.net_attached = true;
                if let Err(err) = self.update_traffic_classes(holder, &inner) {
                    warn!("cannot restore traffic classes: {}", err);
                }
            }
            if let Err(err) = self.apply_dynamic_properties(holder, &mut inner) {
                warn!("cannot reapply properties: {}", err);
            }
        }

        if self.may_respawn() {
            self.schedule_respawn(holder);
        }

        self.save(holder)
    }

    /// Final teardown: the kv node is removed last so a crash leaves a
    /// restorable record.
    pub fn destroy(&self, holder: &Holder) {
        info!("destroy {} {}", self.name, self.id);

        {
            let mut inner = self.lock();
            if let Some(volume) = inner.root_volume.take() {
                if let Err(err) = holder.volumes().release(&volume) {
                    error!("cannot release root volume: {}", err);
                }
            }
            inner.net_attached = false;
        }

        if let Err(err) = holder.kv().node(self.id).remove() {
            error!("cannot remove key-value node {}: {}", self.id, err);
        }
    }

    pub fn destroy_weak(&self, holder: &Holder) {
        if self.lock().is_weak {
            holder.queue().add(
                0,
                Event::DestroyWeak {
                    name: self.name.clone(),
                },
            );
        }
    }

    // event delivery

    pub fn deliver_event(self: &Arc<Self>, holder: &Holder, event: &Event) {
        match event {
            Event::Exit { status, .. } => {
                let oom = {
                    let inner = self.lock();
                    let failcnt = holder
                        .cgroups()
                        .memory
                        .fail_cnt(&self.get_cgroup(holder, SubsystemKind::Memory))
                        .unwrap_or(0);
                    Self::has_oom_received(&inner) || failcnt != 0
                };
                self.exit(holder, *status, oom);
            }
            Event::Oom { .. } => {
                self.exit(holder, Signal::SIGKILL as i32, true);
            }
            Event::RotateLogs => {
                let inner = self.lock();
                if inner.state == ContainerState::Running {
                    let work = self.work_path(holder);
                    let _ = inner.stdout.rotate(&work);
                    let _ = inner.stderr.rotate(&work);
                }
            }
            Event::Respawn { .. } => match self.respawn(holder) {
                Ok(()) => info!("respawned {}", self.name),
                Err(err) => warn!("cannot respawn container: {}", err),
            },
            Event::DestroyWeak { .. } => {}
        }
    }
}

struct ParentSnapshot {
    root_path: PathBuf,
    owner_uid: u32,
    cpu_policy: String,
    io_policy: String,
    recharge_on_pgfault: bool,
    net_priority: UintMap,
    ulimits: BTreeMap<String, (u64, u64)>,
    umask: u32,
    access_level: AccessLevel,
}

/// Lexically normalizes a path and refuses `..` escapes.
fn normalize_path(path: &str) -> Result<PathBuf> {
    let mut normal = PathBuf::from("/");
    for component in Path::new(path).components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                return Err(ArborError::permission("root path with .."));
            }
            Component::Normal(part) => normal.push(part),
            Component::Prefix(_) => {}
        }
    }
    Ok(normal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_strings_round_trip() {
        for state in [
            ContainerState::Stopped,
            ContainerState::Dead,
            ContainerState::Running,
            ContainerState::Paused,
            ContainerState::Meta,
            ContainerState::Unknown,
        ] {
            assert_eq!(ContainerState::parse(state.as_str()).unwrap(), state);
        }
        assert!(ContainerState::parse("zombie").is_err());
    }

    #[test]
    fn access_levels_are_ordered() {
        assert!(AccessLevel::None < AccessLevel::ReadOnly);
        assert!(AccessLevel::ReadOnly < AccessLevel::ChildOnly);
        assert!(AccessLevel::ChildOnly < AccessLevel::Normal);
        assert!(AccessLevel::Normal < AccessLevel::SuperUser);
        assert!(AccessLevel::SuperUser < AccessLevel::Internal);
        assert_eq!(AccessLevel::parse("read-only").unwrap(), AccessLevel::ReadOnly);
    }

    #[test]
    fn normalize_path_rejects_escapes() {
        assert_eq!(normalize_path("/a//b/./c").unwrap(), PathBuf::from("/a/b/c"));
        assert!(normalize_path("/a/../b").is_err());
    }

    #[test]
    fn sanitize_narrows_to_ancestor_limit() {
        let work = std::env::temp_dir();
        let root = Container::new("/", ROOT_CONTAINER_ID, None, &work);
        let ct = Container::new("web", 4, Some(root), &work);

        let mut inner = ct.lock();
        inner.owner_uid = 1000;
        inner.cap_ambient = ALL_CAPS;
        let ancestor = CapSet::parse("CAP_KILL;CAP_NET_RAW").unwrap();
        ct.sanitize_capabilities(&mut inner, ancestor);

        assert!(SUID_CAPS.intersect(ancestor).contains(inner.cap_limit));
        assert!(inner.cap_allowed.contains(inner.cap_ambient));
        assert!(inner.cap_limit.contains(inner.cap_allowed));
    }

    #[test]
    fn sanitize_keeps_everything_for_root_owner() {
        let work = std::env::temp_dir();
        let ct = Container::new("priv", 5, None, &work);
        let mut inner = ct.lock();
        inner.owner_uid = 0;
        inner.cap_ambient = ALL_CAPS;
        ct.sanitize_capabilities(&mut inner, ALL_CAPS);
        assert_eq!(inner.cap_limit, ALL_CAPS);
    }

    #[test]
    fn waiter_wakes_on_notify() {
        let waiter = Waiter::new();
        let clone = waiter.clone();
        let handle = std::thread::spawn(move || clone.wait_timeout(5000));
        std::thread::sleep(Duration::from_millis(20));
        waiter.notify("a/b");
        assert_eq!(handle.join().unwrap(), Some("a/b".to_string()));
    }

    #[test]
    fn waiter_times_out_to_none() {
        let waiter = Waiter::new();
        assert_eq!(waiter.wait_timeout(10), None);
    }

    #[test]
    fn acquisition_is_exclusive_and_hierarchical() {
        let work = std::env::temp_dir();
        let parent = Container::new("p", 4, None, &work);
        let child = Container::new("p/c", 5, Some(parent.clone()), &work);

        assert!(parent.acquire());
        assert!(!parent.acquire());
        assert!(child.is_acquired());
        parent.release();
        assert!(!child.is_acquired());
        assert!(child.acquire());
        child.release();
    }

    #[test]
    fn running_children_propagates_up() {
        let work = std::env::temp_dir();
        let root = Container::new("/", ROOT_CONTAINER_ID, None, &work);
        let mid = Container::new("m", 4, Some(root.clone()), &work);
        let leaf = Container::new("m/l", 5, Some(mid.clone()), &work);
        root.add_child(&mid);
        mid.add_child(&leaf);

        {
            let mut inner = leaf.lock();
            leaf.set_state(&mut inner, ContainerState::Running);
        }
        assert_eq!(mid.running_children(), 1);
        assert_eq!(root.running_children(), 1);

        {
            let mut inner = leaf.lock();
            leaf.set_state(&mut inner, ContainerState::Dead);
        }
        assert_eq!(mid.running_children(), 0);
        assert_eq!(root.running_children(), 0);
    }
}
