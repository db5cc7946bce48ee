use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::RwLock;

use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::DEVICE_START_NR;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("device not found: {0}")]
    NotFound(String),

    #[error("no video devices were found under {}", .0.display())]
    NoDevices(PathBuf),
}

/// One virtual capture device. The id/path pairing is fixed at discovery
/// time and never reassigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoDevice {
    /// stable symbolic name, e.g. "video10"
    pub id: String,
    /// device node path, e.g. "/dev/video10"
    pub path: PathBuf,
}

/// Authoritative map of the devices this plugin serves. All accessors
/// hand out copies; the set is only ever replaced wholesale by
/// `discover`.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, VideoDevice>>,
    dev_root: PathBuf,
    perm_mode: u32,
}

impl DeviceRegistry {
    pub fn new(perm_mode: u32) -> Self {
        Self::with_dev_root("/dev", perm_mode)
    }

    pub fn with_dev_root(dev_root: impl Into<PathBuf>, perm_mode: u32) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            dev_root: dev_root.into(),
            perm_mode,
        }
    }

    fn device_path(&self, ordinal: u32) -> PathBuf {
        self.dev_root.join(format!("video{ordinal}"))
    }

    /// Scans the fixed ordinal range `[start, start+count)` and replaces
    /// the device set with every node that exists and is readable.
    ///
    /// Zero devices is an error; fewer than requested is a warning.
    pub fn discover(&self, count: usize) -> Result<usize, RegistryError> {
        info!(count, "discovering video devices");

        let mut found = HashMap::new();
        for i in 0..count as u32 {
            let ordinal = DEVICE_START_NR + i;
            let id = format!("video{ordinal}");
            let path = self.device_path(ordinal);

            if !device_exists(&path) {
                warn!(device_path = %path.display(), "device node does not exist");
                continue;
            }
            if !device_readable(&path) {
                warn!(device_path = %path.display(), "device node is not readable");
                continue;
            }

            if let Err(e) = fs::set_permissions(&path, fs::Permissions::from_mode(self.perm_mode))
            {
                warn!(device_path = %path.display(), error = %e, "failed to set device permissions");
            }

            debug!(device_id = %id, device_path = %path.display(), "registered device");
            found.insert(id.clone(), VideoDevice { id, path });
        }

        let registered = found.len();
        if registered == 0 {
            return Err(RegistryError::NoDevices(self.dev_root.clone()));
        }
        if registered < count {
            warn!(requested = count, found = registered, "found fewer devices than requested");
        }

        *self.devices.write().expect("registry lock poisoned") = found;
        info!(requested = count, registered, "registered video devices");
        Ok(registered)
    }

    /// Returns a copy of the record for `id`.
    pub fn get(&self, id: &str) -> Result<VideoDevice, RegistryError> {
        self.devices
            .read()
            .expect("registry lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Copies of all records, ordered by id.
    pub fn list(&self) -> Vec<VideoDevice> {
        let mut devices: Vec<VideoDevice> = self
            .devices
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// Device count. When the registry is empty (devices provisioned by
    /// an out-of-process step) this probes the ordinal range directly.
    pub fn count(&self, max_devices: usize) -> usize {
        let registered = self.devices.read().expect("registry lock poisoned").len();
        if registered > 0 {
            return registered;
        }

        (0..max_devices as u32)
            .filter(|i| device_exists(&self.device_path(DEVICE_START_NR + i)))
            .count()
    }

    /// Whether every managed device node exists and is readable, with
    /// the same filesystem fallback as `count`.
    pub fn is_healthy(&self, max_devices: usize) -> bool {
        {
            let devices = self.devices.read().expect("registry lock poisoned");
            if !devices.is_empty() {
                return devices.values().all(|d| self.basic_health(d));
            }
        }

        (0..max_devices as u32).all(|i| {
            let path = self.device_path(DEVICE_START_NR + i);
            device_exists(&path) && device_readable(&path)
        })
    }

    /// Basic health: the node exists and can be opened for reading.
    pub fn basic_health(&self, device: &VideoDevice) -> bool {
        device_exists(&device.path) && device_readable(&device.path)
    }

    /// Reapplies the configured permission mode to every registered
    /// node. A module reload recreates the nodes with kernel defaults.
    pub fn apply_permissions(&self) {
        for device in self.list() {
            if let Err(e) =
                fs::set_permissions(&device.path, fs::Permissions::from_mode(self.perm_mode))
            {
                warn!(
                    device_path = %device.path.display(),
                    error = %e,
                    "failed to set device permissions"
                );
            }
        }
    }
}

fn device_exists(path: &Path) -> bool {
    path.exists()
}

fn device_readable(path: &Path) -> bool {
    fs::File::open(path).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dev_tree(ordinals: &[u32]) -> TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        for nr in ordinals {
            fs::write(dir.path().join(format!("video{nr}")), b"").expect("create device node");
        }
        dir
    }

    #[test]
    fn discover_registers_full_ordinal_range() {
        let dir = dev_tree(&[10, 11, 12, 13, 14, 15, 16, 17]);
        let registry = DeviceRegistry::with_dev_root(dir.path(), 0o666);

        let registered = registry.discover(8).expect("discover");
        assert_eq!(registered, 8);

        let ids: Vec<String> = registry.list().into_iter().map(|d| d.id).collect();
        assert_eq!(
            ids,
            vec![
                "video10", "video11", "video12", "video13", "video14", "video15", "video16",
                "video17"
            ]
        );
        let dev = registry.get("video12").expect("get");
        assert_eq!(dev.path, dir.path().join("video12"));
    }

    #[test]
    fn discover_is_idempotent_on_unchanged_filesystem() {
        let dir = dev_tree(&[10, 11, 12]);
        let registry = DeviceRegistry::with_dev_root(dir.path(), 0o666);

        registry.discover(3).expect("first discover");
        let first: Vec<String> = registry.list().into_iter().map(|d| d.id).collect();

        registry.discover(3).expect("second discover");
        let second: Vec<String> = registry.list().into_iter().map(|d| d.id).collect();

        assert_eq!(first, second);
    }

    #[test]
    fn discover_replaces_previous_device_set() {
        let dir = dev_tree(&[10, 11, 12, 13]);
        let registry = DeviceRegistry::with_dev_root(dir.path(), 0o666);
        registry.discover(4).expect("discover");
        assert_eq!(registry.list().len(), 4);

        fs::remove_file(dir.path().join("video12")).expect("remove");
        fs::remove_file(dir.path().join("video13")).expect("remove");
        registry.discover(2).expect("rediscover");

        let ids: Vec<String> = registry.list().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["video10", "video11"]);
    }

    #[test]
    fn discover_tolerates_missing_nodes_but_not_an_empty_range() {
        let dir = dev_tree(&[10, 12]);
        let registry = DeviceRegistry::with_dev_root(dir.path(), 0o666);

        let registered = registry.discover(4).expect("partial discover");
        assert_eq!(registered, 2);

        let empty = tempfile::tempdir().expect("tempdir");
        let registry = DeviceRegistry::with_dev_root(empty.path(), 0o666);
        assert!(matches!(
            registry.discover(4),
            Err(RegistryError::NoDevices(_))
        ));
    }

    #[test]
    fn get_unknown_device_fails() {
        let dir = dev_tree(&[10]);
        let registry = DeviceRegistry::with_dev_root(dir.path(), 0o666);
        registry.discover(1).expect("discover");

        assert!(matches!(
            registry.get("video99"),
            Err(RegistryError::NotFound(id)) if id == "video99"
        ));
    }

    #[test]
    fn returned_records_are_copies() {
        let dir = dev_tree(&[10]);
        let registry = DeviceRegistry::with_dev_root(dir.path(), 0o666);
        registry.discover(1).expect("discover");

        let mut dev = registry.get("video10").expect("get");
        dev.id = "tampered".to_string();
        dev.path = PathBuf::from("/dev/null");

        let fresh = registry.get("video10").expect("get again");
        assert_eq!(fresh.id, "video10");
        assert_eq!(fresh.path, dir.path().join("video10"));

        let mut listed = registry.list();
        listed[0].id = "tampered".to_string();
        assert_eq!(registry.list()[0].id, "video10");
    }

    #[test]
    fn count_and_health_fall_back_to_filesystem_probing() {
        let dir = dev_tree(&[10, 11, 12]);
        // never discovered: devices were provisioned out of process
        let registry = DeviceRegistry::with_dev_root(dir.path(), 0o666);

        assert_eq!(registry.count(3), 3);
        assert!(registry.is_healthy(3));

        fs::remove_file(dir.path().join("video11")).expect("remove");
        assert_eq!(registry.count(3), 2);
        assert!(!registry.is_healthy(3));
    }

    #[test]
    fn health_tracks_registered_devices_after_discovery() {
        let dir = dev_tree(&[10, 11]);
        let registry = DeviceRegistry::with_dev_root(dir.path(), 0o666);
        registry.discover(2).expect("discover");
        assert!(registry.is_healthy(2));

        fs::remove_file(dir.path().join("video11")).expect("remove");
        assert!(!registry.is_healthy(2));
    }
}
