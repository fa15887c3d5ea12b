use std::path::PathBuf;
use std::sync::Arc;

use arbord::arbor::cgroup::CgroupSet;
use arbord::arbor::container::Container;
use arbord::arbor::holder::Holder;
use arbord::arbor::kv::KvStore;
use arbord::arbor::net::{Network, NullNetlink};
use arbord::arbor::volume;
use tempfile::TempDir;

/// A daemon slave in a box: scratch cgroup tree, scratch key-value
/// directory, scratch work directory, null networking.
pub struct Fixture {
    pub holder: Holder,
    temp: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = TempDir::new().expect("tempdir");
        let holder = Self::holder_at(&temp);
        holder.bootstrap().expect("bootstrap system containers");
        Self { holder, temp }
    }

    fn holder_at(temp: &TempDir) -> Holder {
        let kv = KvStore::open(&temp.path().join("kv"), &temp.path().join("kv.lock"))
            .expect("open kv store");
        let cgroups = CgroupSet::initialize(&temp.path().join("cgroup")).expect("cgroup set");
        Holder::new(
            kv,
            cgroups,
            Network::new(Arc::new(NullNetlink)),
            volume::default_backend(),
            &temp.path().join("containers"),
        )
        .expect("holder")
    }

    /// Restarts the slave against the same state directories, the way
    /// the master respawns it. The old holder must be dropped first so
    /// the key-value lock is free.
    pub fn restart(self) -> Self {
        let Fixture { holder, temp } = self;
        drop(holder);
        let holder = Self::holder_at(&temp);
        holder.bootstrap().expect("bootstrap after restart");
        holder.restore_from_storage();
        Self { holder, temp }
    }

    pub fn cgroup_root(&self) -> PathBuf {
        self.temp.path().join("cgroup")
    }

    /// Creates a container owned by the current user with isolation off,
    /// which is what the scratch environment can actually run.
    pub fn create(&self, name: &str) -> Arc<Container> {
        let ct = self
            .holder
            .create(
                name,
                nix::unistd::Uid::current().as_raw(),
                nix::unistd::Gid::current().as_raw(),
                &[],
            )
            .expect("create container");
        ct.set_property(&self.holder, "isolate", "false")
            .expect("disable isolation");
        ct
    }

    pub fn create_meta(&self, name: &str) -> Arc<Container> {
        let ct = self.create(name);
        ct.start(&self.holder, true).expect("start meta");
        ct
    }

    pub fn state_of(&self, name: &str) -> String {
        self.holder
            .get(name)
            .expect("container exists")
            .get_property(&self.holder, "state")
            .expect("state readable")
    }
}
