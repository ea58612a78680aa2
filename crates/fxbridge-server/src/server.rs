//! Process-level wiring: attach to the bootstrap region, run instances
//! until they are all gone, watch for host death.

use crate::abi::NativeHandle;
use crate::fault;
use crate::instance::BridgeInstance;
use fxbridge::error::Result;
use fxbridge::protocol::region_name;
use fxbridge::shm::SharedRegion;
use parking_lot::{Condvar, Mutex};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Produces a native handle for a plugin path. The production loader is
/// [`NativeHandle::load`]; tests inject in-process entry functions.
pub type LoaderFn = Arc<dyn Fn(&Path) -> Result<NativeHandle> + Send + Sync>;

/// Whether the host process still exists.
pub fn host_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{}", pid)).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        // Without a cheap probe, rely on the quit event and the host
        // killing us on its way out.
        let _ = pid;
        true
    }
}

/// Tracks the set of live instances; the main thread blocks on it until the
/// last one tears down.
pub struct InstanceRegistry {
    loader: LoaderFn,
    live: Mutex<usize>,
    idle: Condvar,
    instances: Mutex<Vec<BridgeInstance>>,
}

impl InstanceRegistry {
    pub fn new(loader: LoaderFn) -> Self {
        Self {
            loader,
            live: Mutex::new(0),
            idle: Condvar::new(),
            instances: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn instance_started(&self) {
        *self.live.lock() += 1;
    }

    pub(crate) fn instance_done(&self, instance_id: u32) {
        debug!("Instance {} finished", instance_id);
        let mut live = self.live.lock();
        *live = live.saturating_sub(1);
        if *live == 0 {
            self.idle.notify_all();
        }
    }

    /// Spawn the thread pair over an already-opened region.
    pub fn spawn_over(self: &Arc<Self>, region: Arc<SharedRegion>) -> Result<()> {
        let instance =
            BridgeInstance::spawn(region, Arc::clone(&self.loader), Arc::clone(self))?;
        self.instances.lock().push(instance);
        Ok(())
    }

    /// Open a host-created region by name and attach an instance to it.
    /// Serves `NewInstance` requests arriving on the bootstrap channel.
    pub fn spawn_attached(self: &Arc<Self>, instance_id: u32, region_name: String) -> Result<()> {
        let region = SharedRegion::open_within(region_name, Duration::from_secs(2))?;
        info!("Attaching instance {}", instance_id);
        self.spawn_over(region)
    }

    pub fn live(&self) -> usize {
        *self.live.lock()
    }

    /// Block until every instance has torn down, then join their threads.
    /// Host death is detected by the instances themselves.
    pub fn wait_all(&self) {
        {
            let mut live = self.live.lock();
            while *live > 0 {
                self.idle.wait_for(&mut live, Duration::from_millis(200));
            }
        }
        for instance in self.instances.lock().drain(..) {
            instance.join();
        }
    }
}

pub struct BridgeApp;

impl BridgeApp {
    /// Run the whole server: attach to the host's bootstrap region, host
    /// instances until the last one is gone, exit.
    pub fn run(prefix: &str, host_pid: u32) -> Result<()> {
        fault::install_crash_handler();

        let loader: LoaderFn = Arc::new(|path: &Path| NativeHandle::load(path));
        let registry = Arc::new(InstanceRegistry::new(loader));

        let bootstrap = region_name(prefix, host_pid, 0);
        let region = SharedRegion::open_within(bootstrap.clone(), Duration::from_secs(10))?;
        registry.spawn_over(Arc::clone(&region))?;
        region.header().attached.raise();
        info!("Attached to host {} over {}", host_pid, bootstrap);

        registry.wait_all();
        info!("Last instance gone; shutting down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_alive_probe() {
        assert!(host_alive(std::process::id()));
        #[cfg(target_os = "linux")]
        // Pid 0 is the idle task; /proc never lists it.
        assert!(!host_alive(0));
    }

    #[test]
    fn test_registry_counts_down_to_idle() {
        let loader: LoaderFn = Arc::new(|path| NativeHandle::load(path));
        let registry = InstanceRegistry::new(loader);

        registry.instance_started();
        registry.instance_started();
        assert_eq!(registry.live(), 2);

        registry.instance_done(0);
        registry.instance_done(1);
        assert_eq!(registry.live(), 0);
        registry.wait_all();
    }
}
