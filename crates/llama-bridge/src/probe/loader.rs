//! Runtime loading of the Vulkan loader library via `libloading`.
//!
//! Only the handful of entry points the probe needs are declared here;
//! nothing links against `libvulkan` at build time.

use std::ffi::{CStr, c_char, c_void};

use libloading::Library;
use tracing::debug;

use super::{ApiVersion, DeviceProperties, DriverLoader, ProbeInstance, VulkanDriver};

/// Candidate library names, tried in order.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub const VULKAN_LIBRARY_NAMES: &[&str] = &["libvulkan.so.1", "libvulkan.so"];
#[cfg(target_os = "windows")]
pub const VULKAN_LIBRARY_NAMES: &[&str] = &["vulkan-1.dll"];
#[cfg(target_os = "macos")]
pub const VULKAN_LIBRARY_NAMES: &[&str] = &["libvulkan.1.dylib", "libvulkan.dylib", "libMoltenVK.dylib"];
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "windows",
    target_os = "macos"
)))]
pub const VULKAN_LIBRARY_NAMES: &[&str] = &["libvulkan.so.1", "libvulkan.so"];

//  Minimal Vulkan ABI

type VkInstance = *mut c_void;
type VkPhysicalDevice = *mut c_void;
type VkResult = i32;

const VK_SUCCESS: VkResult = 0;
const VK_STRUCTURE_TYPE_APPLICATION_INFO: i32 = 0;
const VK_STRUCTURE_TYPE_INSTANCE_CREATE_INFO: i32 = 1;

type VoidFunction = unsafe extern "system" fn();
type GetInstanceProcAddr =
    unsafe extern "system" fn(VkInstance, *const c_char) -> Option<VoidFunction>;
type CreateInstance =
    unsafe extern "system" fn(*const VkInstanceCreateInfo, *const c_void, *mut VkInstance) -> VkResult;
type EnumerateInstanceVersion = unsafe extern "system" fn(*mut u32) -> VkResult;
type DestroyInstance = unsafe extern "system" fn(VkInstance, *const c_void);
type EnumeratePhysicalDevices =
    unsafe extern "system" fn(VkInstance, *mut u32, *mut VkPhysicalDevice) -> VkResult;
type GetPhysicalDeviceProperties =
    unsafe extern "system" fn(VkPhysicalDevice, *mut VkPhysicalDeviceProperties);

#[repr(C)]
struct VkApplicationInfo {
    s_type: i32,
    p_next: *const c_void,
    p_application_name: *const c_char,
    application_version: u32,
    p_engine_name: *const c_char,
    engine_version: u32,
    api_version: u32,
}

#[repr(C)]
struct VkInstanceCreateInfo {
    s_type: i32,
    p_next: *const c_void,
    flags: u32,
    p_application_info: *const VkApplicationInfo,
    enabled_layer_count: u32,
    pp_enabled_layer_names: *const *const c_char,
    enabled_extension_count: u32,
    pp_enabled_extension_names: *const *const c_char,
}

/// Leading fields of `VkPhysicalDeviceProperties`. The limits and sparse
/// property blocks are covered by an oversized tail we never read.
#[repr(C)]
struct VkPhysicalDeviceProperties {
    api_version: u32,
    driver_version: u32,
    vendor_id: u32,
    device_id: u32,
    device_type: i32,
    device_name: [c_char; 256],
    pipeline_cache_uuid: [u8; 16],
    _tail: [u64; 128],
}

/// Resolve `name` (NUL-terminated) through `vkGetInstanceProcAddr`.
///
/// # Safety
/// `T` must be the function-pointer type matching `name`.
unsafe fn resolve<T: Copy>(gipa: GetInstanceProcAddr, instance: VkInstance, name: &[u8]) -> Option<T> {
    debug_assert_eq!(name.last(), Some(&0));
    debug_assert_eq!(size_of::<T>(), size_of::<VoidFunction>());
    let f = unsafe { gipa(instance, name.as_ptr().cast()) }?;
    Some(unsafe { std::mem::transmute_copy::<VoidFunction, T>(&f) })
}

//  Loader

/// Opens the platform's Vulkan loader, trying each candidate name in turn.
#[derive(Debug, Clone)]
pub struct SystemLoader {
    candidates: Vec<String>,
}

impl SystemLoader {
    pub fn with_candidates<I, S>(candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            candidates: candidates.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for SystemLoader {
    fn default() -> Self {
        Self::with_candidates(VULKAN_LIBRARY_NAMES.iter().copied())
    }
}

impl DriverLoader for SystemLoader {
    fn load(&self) -> Option<Box<dyn VulkanDriver>> {
        for name in &self.candidates {
            // SAFETY: loading the Vulkan loader runs its initializers, which
            // have no preconditions on our side.
            match unsafe { Library::new(name) } {
                Ok(lib) => {
                    debug!(library = %name, "Loaded Vulkan library");
                    return LoadedDriver::from_library(lib, name)
                        .map(|d| Box::new(d) as Box<dyn VulkanDriver>);
                }
                Err(e) => debug!(library = %name, error = %e, "Failed to load Vulkan library"),
            }
        }
        None
    }
}

/// Global entry points resolved from an open loader library. Dropping it
/// unloads the library.
pub struct LoadedDriver {
    get_instance_proc_addr: GetInstanceProcAddr,
    create_instance: CreateInstance,
    enumerate_instance_version: Option<EnumerateInstanceVersion>,
    name: String,
    _library: Library,
}

impl LoadedDriver {
    fn from_library(lib: Library, name: &str) -> Option<Self> {
        // SAFETY: symbol types match the Vulkan 1.x prototypes.
        let gipa: GetInstanceProcAddr = match unsafe { lib.get::<GetInstanceProcAddr>(b"vkGetInstanceProcAddr\0") } {
            Ok(sym) => *sym,
            Err(e) => {
                debug!(error = %e, "vkGetInstanceProcAddr missing");
                return None;
            }
        };

        let create_instance = unsafe { lib.get::<CreateInstance>(b"vkCreateInstance\0") }
            .map(|sym| *sym)
            .ok()
            .or_else(|| unsafe { resolve(gipa, std::ptr::null_mut(), b"vkCreateInstance\0") });

        let enumerate_instance_version =
            unsafe { lib.get::<EnumerateInstanceVersion>(b"vkEnumerateInstanceVersion\0") }
                .map(|sym| *sym)
                .ok()
                .or_else(|| unsafe {
                    resolve(gipa, std::ptr::null_mut(), b"vkEnumerateInstanceVersion\0")
                });

        let Some(create_instance) = create_instance else {
            debug!(library = %name, "vkCreateInstance missing; unloading");
            return None;
        };

        Some(Self {
            get_instance_proc_addr: gipa,
            create_instance,
            enumerate_instance_version,
            name: name.to_owned(),
            _library: lib,
        })
    }

    pub fn library_name(&self) -> &str {
        &self.name
    }
}

impl VulkanDriver for LoadedDriver {
    fn instance_version(&self) -> Option<ApiVersion> {
        let f = self.enumerate_instance_version?;
        let mut raw = 0u32;
        let rc = unsafe { f(&mut raw) };
        if rc == VK_SUCCESS {
            Some(ApiVersion::from_raw(raw))
        } else {
            debug!(rc, "vkEnumerateInstanceVersion failed");
            None
        }
    }

    fn create_instance(
        &self,
        api_version: ApiVersion,
    ) -> std::result::Result<Box<dyn ProbeInstance + '_>, i32> {
        let app_info = VkApplicationInfo {
            s_type: VK_STRUCTURE_TYPE_APPLICATION_INFO,
            p_next: std::ptr::null(),
            p_application_name: c"llama-bridge-probe".as_ptr(),
            application_version: ApiVersion::new(1, 0, 0).raw(),
            p_engine_name: c"llama-bridge".as_ptr(),
            engine_version: ApiVersion::new(1, 0, 0).raw(),
            api_version: api_version.raw(),
        };
        let create_info = VkInstanceCreateInfo {
            s_type: VK_STRUCTURE_TYPE_INSTANCE_CREATE_INFO,
            p_next: std::ptr::null(),
            flags: 0,
            p_application_info: &app_info,
            enabled_layer_count: 0,
            pp_enabled_layer_names: std::ptr::null(),
            enabled_extension_count: 0,
            pp_enabled_extension_names: std::ptr::null(),
        };

        let mut handle: VkInstance = std::ptr::null_mut();
        let rc = unsafe { (self.create_instance)(&create_info, std::ptr::null(), &mut handle) };
        if rc != VK_SUCCESS || handle.is_null() {
            return Err(rc);
        }

        let gipa = self.get_instance_proc_addr;
        Ok(Box::new(LoadedInstance {
            handle,
            gipa,
            destroy: unsafe { resolve(gipa, handle, b"vkDestroyInstance\0") },
            enumerate_devices: unsafe { resolve(gipa, handle, b"vkEnumeratePhysicalDevices\0") },
            device_properties: unsafe {
                resolve(gipa, handle, b"vkGetPhysicalDeviceProperties\0")
            },
            _driver: self,
        }))
    }
}

struct LoadedInstance<'a> {
    handle: VkInstance,
    gipa: GetInstanceProcAddr,
    destroy: Option<DestroyInstance>,
    enumerate_devices: Option<EnumeratePhysicalDevices>,
    device_properties: Option<GetPhysicalDeviceProperties>,
    _driver: &'a LoadedDriver,
}

impl ProbeInstance for LoadedInstance<'_> {
    fn has_core_entry_points(&self) -> bool {
        self.destroy.is_some() && self.enumerate_devices.is_some() && self.device_properties.is_some()
    }

    fn has_extended_features(&self) -> bool {
        let core: Option<VoidFunction> =
            unsafe { resolve(self.gipa, self.handle, b"vkGetPhysicalDeviceFeatures2\0") };
        let khr: Option<VoidFunction> =
            unsafe { resolve(self.gipa, self.handle, b"vkGetPhysicalDeviceFeatures2KHR\0") };
        debug!(
            core = core.is_some(),
            khr = khr.is_some(),
            "Extended physical device features availability"
        );
        core.is_some() || khr.is_some()
    }

    fn physical_device_count(&self) -> std::result::Result<u32, i32> {
        let enumerate = self.enumerate_devices.ok_or(-1)?;
        let mut count = 0u32;
        let rc = unsafe { enumerate(self.handle, &mut count, std::ptr::null_mut()) };
        if rc == VK_SUCCESS { Ok(count) } else { Err(rc) }
    }

    fn first_device(&self) -> Option<DeviceProperties> {
        let enumerate = self.enumerate_devices?;
        let properties = self.device_properties?;

        let mut count = self.physical_device_count().ok()?;
        if count == 0 {
            return None;
        }
        let mut devices: Vec<VkPhysicalDevice> = vec![std::ptr::null_mut(); count as usize];
        let rc = unsafe { enumerate(self.handle, &mut count, devices.as_mut_ptr()) };
        if rc != VK_SUCCESS || count == 0 {
            return None;
        }

        // SAFETY: all-zero is a valid bit pattern for this plain C struct.
        let mut props: VkPhysicalDeviceProperties = unsafe { std::mem::zeroed() };
        unsafe { properties(devices[0], &mut props) };

        let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        Some(DeviceProperties {
            api_version: ApiVersion::from_raw(props.api_version),
            name,
        })
    }
}

impl Drop for LoadedInstance<'_> {
    fn drop(&mut self) {
        if let Some(destroy) = self.destroy {
            unsafe { destroy(self.handle, std::ptr::null()) };
        }
    }
}
