//! Vulkan runtime capability probing.
//!
//! The prober answers one question: is it safe to hand GPU layers to the
//! Vulkan backend on this device? It never links against the Vulkan loader;
//! the loader is opened at runtime (see [`SystemLoader`]) and every failure
//! degrades to "unsuitable" so the caller falls back to CPU.
//!
//! The algorithm is written against the [`DriverLoader`] / [`VulkanDriver`] /
//! [`ProbeInstance`] traits so it can be exercised without a GPU.

mod loader;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

pub use loader::{LoadedDriver, SystemLoader, VULKAN_LIBRARY_NAMES};

//  API version

/// A Vulkan API version packed the way `VK_MAKE_API_VERSION` packs it
/// (variant bits ignored).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ApiVersion(u32);

impl ApiVersion {
    pub const V1_0: Self = Self::new(1, 0, 0);
    pub const V1_1: Self = Self::new(1, 1, 0);
    pub const V1_2: Self = Self::new(1, 2, 0);
    pub const V1_3: Self = Self::new(1, 3, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self(((major & 0x7F) << 22) | ((minor & 0x3FF) << 12) | (patch & 0xFFF))
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn major(self) -> u32 {
        (self.0 >> 22) & 0x7F
    }

    pub const fn minor(self) -> u32 {
        (self.0 >> 12) & 0x3FF
    }

    pub const fn patch(self) -> u32 {
        self.0 & 0xFFF
    }

    /// Lexicographic `(major, minor, patch)` comparison.
    pub fn at_least(self, floor: ApiVersion) -> bool {
        (self.major(), self.minor(), self.patch()) >= (floor.major(), floor.minor(), floor.patch())
    }

    /// Floor used when no explicit policy is configured: ARM drivers are
    /// accepted from 1.1, everything else needs 1.2.
    pub fn default_floor() -> Self {
        if cfg!(any(target_arch = "aarch64", target_arch = "arm")) {
            Self::V1_1
        } else {
            Self::V1_2
        }
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.patch())
    }
}

impl FromStr for ApiVersion {
    type Err = String;

    /// Accepts `"1.2"` or `"1.2.198"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if !(2..=3).contains(&parts.len()) {
            return Err(format!("invalid Vulkan version '{s}', expected MAJOR.MINOR[.PATCH]"));
        }
        let mut nums = [0u32; 3];
        for (slot, part) in nums.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|_| format!("invalid Vulkan version component '{part}' in '{s}'"))?;
        }
        Ok(Self::new(nums[0], nums[1], nums[2]))
    }
}

impl TryFrom<String> for ApiVersion {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ApiVersion> for String {
    fn from(v: ApiVersion) -> Self {
        v.to_string()
    }
}

//  Configuration

/// Policy inputs for the probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Minimum Vulkan instance version accepted as "suitable".
    #[serde(default = "ApiVersion::default_floor")]
    pub min_api_version: ApiVersion,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            min_api_version: ApiVersion::default_floor(),
        }
    }
}

//  Result

/// Outcome of a probe. All flags start `false`; `suitable` is the
/// conjunction of every capability flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeProbeResult {
    pub library_available: bool,
    pub instance_creation_works: bool,
    pub physical_devices_available: bool,
    /// `vkGetPhysicalDeviceFeatures2` (core or KHR) is resolvable.
    pub extended_features_available: bool,
    pub meets_minimum_version: bool,
    pub suitable: bool,
    /// Version reported by `vkEnumerateInstanceVersion` (1.0.0 if absent).
    pub api_version: ApiVersion,
    /// Version the probe instance was created with.
    pub instance_version: ApiVersion,
    /// First physical device's own `apiVersion` (diagnostic only).
    pub device_api_version: ApiVersion,
    pub device_count: u32,
    pub device_name: Option<String>,
}

impl RuntimeProbeResult {
    /// Fully negative result.
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// Compute `meets_minimum_version` and `suitable` from the capability
    /// flags gathered so far.
    pub fn with_verdict(mut self, floor: ApiVersion) -> Self {
        self.meets_minimum_version = self.library_available && self.api_version.at_least(floor);
        self.suitable = self.library_available
            && self.instance_creation_works
            && self.physical_devices_available
            && self.extended_features_available
            && self.meets_minimum_version;
        self
    }

    /// `"major.minor"` when the runtime is basically usable (library,
    /// instance and at least one device), regardless of the version gate.
    pub fn vulkan_version(&self) -> Option<String> {
        if self.library_available && self.instance_creation_works && self.physical_devices_available
        {
            Some(format!("{}.{}", self.api_version.major(), self.api_version.minor()))
        } else {
            None
        }
    }

    fn log_summary(&self, floor: ApiVersion) {
        let yn = |b: bool| if b { "yes" } else { "no" };
        info!("Vulkan runtime detection completed:");
        info!("  Library available: {}", yn(self.library_available));
        info!("  Detected API version: {}", self.api_version);
        info!("  Instance creation: {}", yn(self.instance_creation_works));
        info!("  Instance version: {}", self.instance_version);
        info!(
            "  Physical devices: {} ({} found)",
            yn(self.physical_devices_available),
            self.device_count
        );
        info!("  Extended features API: {}", yn(self.extended_features_available));
        info!("  First device apiVersion: {}", self.device_api_version);
        info!(
            "  Meets min version requirement ({floor}): {}",
            yn(self.meets_minimum_version)
        );
        info!("  Suitable for GPU offload: {}", yn(self.suitable));
        if self.library_available && !self.api_version.at_least(ApiVersion::V1_2) {
            warn!("Vulkan instance version < 1.2; GPU requests may fall back to CPU");
        }
    }
}

//  Driver seams

/// Something that can produce a [`RuntimeProbeResult`]. Implementations
/// must not panic or propagate driver failures.
pub trait CapabilityProbe: Send + Sync {
    fn probe(&self) -> RuntimeProbeResult;
}

/// Ordered list of strategies for opening the Vulkan loader.
pub trait DriverLoader: Send + Sync {
    /// Returns `None` when no candidate loads, or when `vkCreateInstance`
    /// cannot be resolved from the one that did (the library is unloaded
    /// again in that case).
    fn load(&self) -> Option<Box<dyn VulkanDriver>>;
}

/// Global (instance-less) entry points of a loaded Vulkan loader.
pub trait VulkanDriver {
    /// `vkEnumerateInstanceVersion`, or `None` when the entry point is
    /// missing or the call fails.
    fn instance_version(&self) -> Option<ApiVersion>;

    /// `vkCreateInstance` with a minimal create-info tagged `api_version`.
    /// The error is the raw `VkResult`.
    fn create_instance(
        &self,
        api_version: ApiVersion,
    ) -> std::result::Result<Box<dyn ProbeInstance + '_>, i32>;
}

/// A live `VkInstance`. Dropping it destroys the instance.
pub trait ProbeInstance {
    /// `vkDestroyInstance`, `vkEnumeratePhysicalDevices` and
    /// `vkGetPhysicalDeviceProperties` all resolved.
    fn has_core_entry_points(&self) -> bool;

    /// `vkGetPhysicalDeviceFeatures2` or `vkGetPhysicalDeviceFeatures2KHR`
    /// resolved.
    fn has_extended_features(&self) -> bool;

    fn physical_device_count(&self) -> std::result::Result<u32, i32>;

    fn first_device(&self) -> Option<DeviceProperties>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    pub api_version: ApiVersion,
    pub name: String,
}

//  Prober

/// The Vulkan capability prober.
pub struct VulkanProber {
    loader: Box<dyn DriverLoader>,
    config: ProbeConfig,
}

impl VulkanProber {
    pub fn new(loader: Box<dyn DriverLoader>, config: ProbeConfig) -> Self {
        Self { loader, config }
    }

    /// Prober over the platform's Vulkan loader library names.
    pub fn system(config: ProbeConfig) -> Self {
        Self::new(Box::new(SystemLoader::default()), config)
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    fn run(&self) -> RuntimeProbeResult {
        let floor = self.config.min_api_version;
        let mut info = RuntimeProbeResult::unavailable();

        debug!("Starting Vulkan runtime detection...");

        let Some(driver) = self.loader.load() else {
            error!("Vulkan library not available");
            return info.with_verdict(floor);
        };
        info.library_available = true;

        info.api_version = driver.instance_version().unwrap_or(ApiVersion::V1_0);
        debug!(version = %info.api_version, "Detected Vulkan API version");

        let instance = match driver.create_instance(info.api_version) {
            Ok(instance) => instance,
            Err(code) => {
                error!(code, "Failed to create Vulkan instance");
                let info = info.with_verdict(floor);
                info.log_summary(floor);
                return info;
            }
        };
        info.instance_creation_works = true;
        info.instance_version = info.api_version;

        if !instance.has_core_entry_points() {
            error!("Failed to load Vulkan instance functions");
            drop(instance);
            let info = info.with_verdict(floor);
            info.log_summary(floor);
            return info;
        }

        info.extended_features_available = if info.api_version.at_least(ApiVersion::V1_2) {
            true
        } else {
            instance.has_extended_features()
        };

        match instance.physical_device_count() {
            Ok(count) if count > 0 => {
                info.physical_devices_available = true;
                info.device_count = count;
                debug!(count, "Found Vulkan physical device(s)");
                if let Some(dev) = instance.first_device() {
                    debug!(
                        version = %dev.api_version,
                        name = %dev.name,
                        "First device properties"
                    );
                    info.device_api_version = dev.api_version;
                    info.device_name = Some(dev.name);
                }
            }
            Ok(_) => debug!("No Vulkan physical devices found"),
            Err(code) => debug!(code, "Physical device enumeration failed"),
        }

        drop(instance);

        let info = info.with_verdict(floor);
        info.log_summary(floor);
        info
    }
}

impl CapabilityProbe for VulkanProber {
    fn probe(&self) -> RuntimeProbeResult {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.run())) {
            Ok(info) => info,
            Err(_) => {
                error!("Vulkan probe panicked; treating GPU as unsuitable");
                RuntimeProbeResult::unavailable()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use proptest::prelude::*;

    use super::*;

    /// Scripted driver; counts live instances so leaks are visible.
    #[derive(Clone)]
    struct FakeDriver {
        version: Option<ApiVersion>,
        create_result: i32,
        core_fns: bool,
        features2: bool,
        devices: std::result::Result<u32, i32>,
        live: Arc<AtomicUsize>,
        created: Arc<AtomicUsize>,
    }

    impl Default for FakeDriver {
        fn default() -> Self {
            Self {
                version: Some(ApiVersion::new(1, 3, 250)),
                create_result: 0,
                core_fns: true,
                features2: true,
                devices: Ok(1),
                live: Arc::default(),
                created: Arc::default(),
            }
        }
    }

    struct FakeInstance<'a> {
        driver: &'a FakeDriver,
    }

    impl ProbeInstance for FakeInstance<'_> {
        fn has_core_entry_points(&self) -> bool {
            self.driver.core_fns
        }
        fn has_extended_features(&self) -> bool {
            self.driver.features2
        }
        fn physical_device_count(&self) -> std::result::Result<u32, i32> {
            self.driver.devices
        }
        fn first_device(&self) -> Option<DeviceProperties> {
            Some(DeviceProperties {
                api_version: ApiVersion::new(1, 1, 128),
                name: "Fake GPU".into(),
            })
        }
    }

    impl Drop for FakeInstance<'_> {
        fn drop(&mut self) {
            self.driver.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl VulkanDriver for FakeDriver {
        fn instance_version(&self) -> Option<ApiVersion> {
            self.version
        }
        fn create_instance(
            &self,
            _api_version: ApiVersion,
        ) -> std::result::Result<Box<dyn ProbeInstance + '_>, i32> {
            if self.create_result != 0 {
                return Err(self.create_result);
            }
            self.live.fetch_add(1, Ordering::SeqCst);
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeInstance { driver: self }))
        }
    }

    struct FakeLoader(Option<FakeDriver>);

    impl DriverLoader for FakeLoader {
        fn load(&self) -> Option<Box<dyn VulkanDriver>> {
            self.0.clone().map(|d| Box::new(d) as Box<dyn VulkanDriver>)
        }
    }

    fn probe_with(driver: Option<FakeDriver>, floor: ApiVersion) -> RuntimeProbeResult {
        VulkanProber::new(
            Box::new(FakeLoader(driver)),
            ProbeConfig {
                min_api_version: floor,
            },
        )
        .probe()
    }

    #[test]
    fn version_packing_and_display() {
        let v = ApiVersion::new(1, 3, 275);
        assert_eq!((v.major(), v.minor(), v.patch()), (1, 3, 275));
        assert_eq!(v.to_string(), "1.3.275");
        assert_eq!(ApiVersion::V1_2.raw(), 4_202_496);
        assert_eq!("1.2".parse::<ApiVersion>().unwrap(), ApiVersion::V1_2);
        assert!("1".parse::<ApiVersion>().is_err());
        assert!("1.x".parse::<ApiVersion>().is_err());
    }

    #[test]
    fn version_comparison_is_lexicographic() {
        assert!(ApiVersion::new(1, 2, 0).at_least(ApiVersion::V1_2));
        assert!(ApiVersion::new(1, 3, 0).at_least(ApiVersion::new(1, 2, 999)));
        assert!(!ApiVersion::new(1, 1, 4000).at_least(ApiVersion::V1_2));
        assert!(ApiVersion::new(2, 0, 0).at_least(ApiVersion::new(1, 9, 9)));
    }

    #[test]
    fn missing_library_is_fully_negative() {
        let info = probe_with(None, ApiVersion::V1_1);
        assert_eq!(info, RuntimeProbeResult::unavailable());
        assert!(info.vulkan_version().is_none());
    }

    #[test]
    fn healthy_driver_is_suitable() {
        let driver = FakeDriver::default();
        let live = driver.live.clone();
        let info = probe_with(Some(driver), ApiVersion::V1_2);
        assert!(info.suitable);
        assert_eq!(info.device_count, 1);
        assert_eq!(info.device_name.as_deref(), Some("Fake GPU"));
        assert_eq!(info.device_api_version, ApiVersion::new(1, 1, 128));
        assert_eq!(info.vulkan_version().as_deref(), Some("1.3"));
        assert_eq!(live.load(Ordering::SeqCst), 0, "instance leaked");
    }

    #[test]
    fn missing_version_query_means_1_0() {
        let driver = FakeDriver {
            version: None,
            ..Default::default()
        };
        let info = probe_with(Some(driver), ApiVersion::V1_1);
        assert_eq!(info.api_version, ApiVersion::V1_0);
        assert!(info.instance_creation_works);
        assert!(!info.meets_minimum_version);
        assert!(!info.suitable);
    }

    #[test]
    fn instance_failure_keeps_library_flag() {
        let driver = FakeDriver {
            create_result: -9, // VK_ERROR_INCOMPATIBLE_DRIVER
            ..Default::default()
        };
        let info = probe_with(Some(driver), ApiVersion::V1_1);
        assert!(info.library_available);
        assert!(!info.instance_creation_works);
        assert!(!info.suitable);
    }

    #[test]
    fn instance_destroyed_on_every_exit_path() {
        for driver in [
            FakeDriver {
                core_fns: false,
                ..Default::default()
            },
            FakeDriver {
                devices: Err(-3),
                ..Default::default()
            },
            FakeDriver {
                devices: Ok(0),
                ..Default::default()
            },
        ] {
            let live = driver.live.clone();
            let created = driver.created.clone();
            let info = probe_with(Some(driver), ApiVersion::V1_1);
            assert!(!info.suitable);
            assert_eq!(created.load(Ordering::SeqCst), 1);
            assert_eq!(live.load(Ordering::SeqCst), 0);
        }
    }

    #[test]
    fn extended_features_checked_only_below_1_2() {
        let old = FakeDriver {
            version: Some(ApiVersion::new(1, 1, 0)),
            features2: false,
            ..Default::default()
        };
        let info = probe_with(Some(old), ApiVersion::V1_1);
        assert!(!info.extended_features_available);
        assert!(!info.suitable);

        let new = FakeDriver {
            version: Some(ApiVersion::new(1, 2, 0)),
            features2: false,
            ..Default::default()
        };
        let info = probe_with(Some(new), ApiVersion::V1_1);
        assert!(info.extended_features_available);
        assert!(info.suitable);
    }

    #[test]
    fn floor_is_a_policy_input() {
        let driver = FakeDriver {
            version: Some(ApiVersion::new(1, 1, 0)),
            ..Default::default()
        };
        assert!(probe_with(Some(driver.clone()), ApiVersion::V1_1).suitable);
        assert!(!probe_with(Some(driver), ApiVersion::V1_2).suitable);
    }

    #[test]
    fn probe_config_round_trips_as_string() {
        let cfg: ProbeConfig = serde_json::from_str(r#"{"min_api_version":"1.1"}"#).unwrap();
        assert_eq!(cfg.min_api_version, ApiVersion::V1_1);
        let json = serde_json::to_string(&cfg).unwrap();
        assert_eq!(json, r#"{"min_api_version":"1.1.0"}"#);
        let cfg: ProbeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.min_api_version, ApiVersion::default_floor());
    }

    proptest! {
        #[test]
        fn suitable_is_monotonic_and(
            lib in any::<bool>(),
            inst in any::<bool>(),
            devs in any::<bool>(),
            ext in any::<bool>(),
            minor in 0u32..5,
            floor_minor in 0u32..5,
        ) {
            let info = RuntimeProbeResult {
                library_available: lib,
                instance_creation_works: inst,
                physical_devices_available: devs,
                extended_features_available: ext,
                api_version: ApiVersion::new(1, minor, 0),
                ..Default::default()
            }
            .with_verdict(ApiVersion::new(1, floor_minor, 0));

            let meets = lib && minor >= floor_minor;
            prop_assert_eq!(info.meets_minimum_version, meets);
            prop_assert_eq!(info.suitable, lib && inst && devs && ext && meets);
        }
    }
}
