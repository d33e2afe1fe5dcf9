//! Vulkan instance creation, physical device selection, and logical device setup.

use std::ffi::CStr;

use ash::vk;

use crate::config::SolverConfig;
use crate::debug::{self, DebugMessenger};
use crate::error::{GramSchmidtError, Result};
use crate::ledger::{Ledger, QueueSlot};

/// Minimum instance API version.
pub const REQUIRED_API_VERSION: u32 = vk::API_VERSION_1_2;

/// One queue family as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamily {
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
}

impl QueueFamily {
    fn is_compute(&self) -> bool {
        self.flags.contains(vk::QueueFlags::COMPUTE)
    }

    fn is_graphics(&self) -> bool {
        self.flags.contains(vk::QueueFlags::GRAPHICS)
    }
}

/// What the selector needs to know about a physical device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCandidate {
    /// Position in `vkEnumeratePhysicalDevices` order.
    pub index: u32,
    pub name: String,
    /// `shaderFloat64` feature.
    pub supports_f64: bool,
    pub families: Vec<QueueFamily>,
}

/// The queue family a solver ended up with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSelection {
    pub slot: QueueSlot,
    /// Physical queue count of the family.
    pub queue_count: u32,
    pub flags: vk::QueueFlags,
    pub device_name: String,
}

/// First-fit selection of a compute queue family with a free queue.
///
/// Devices are visited in enumeration order and the first device offering
/// any usable family wins. Within a device a compute family without graphics
/// is preferred; otherwise the first compute family with a free queue is used.
pub fn select_queue_family(
    candidates: &[DeviceCandidate],
    ledger: &Ledger,
) -> Result<QueueSelection> {
    for device in candidates {
        if !device.supports_f64 {
            tracing::debug!(device = %device.name, "skipping device without shaderFloat64");
            continue;
        }

        let mut fallback: Option<(u32, &QueueFamily)> = None;
        let mut chosen: Option<(u32, &QueueFamily)> = None;
        for (family_index, family) in (0u32..).zip(&device.families) {
            if !family.is_compute() {
                continue;
            }
            let slot = QueueSlot { device_index: device.index, family_index };
            if ledger.reserved(slot) >= family.queue_count {
                continue;
            }
            if !family.is_graphics() {
                chosen = Some((family_index, family));
                break;
            }
            fallback.get_or_insert((family_index, family));
        }

        if let Some((family_index, family)) = chosen.or(fallback) {
            return Ok(QueueSelection {
                slot: QueueSlot { device_index: device.index, family_index },
                queue_count: family.queue_count,
                flags: family.flags,
                device_name: device.name.clone(),
            });
        }
    }
    Err(GramSchmidtError::ResourceExhausted)
}

/// Owned Vulkan instance (plus its debug messenger, if any).
pub(crate) struct Instance {
    entry: ash::Entry,
    instance: ash::Instance,
    debug: Option<DebugMessenger>,
}

impl Instance {
    /// Load the Vulkan loader, check the API version and, if requested, the
    /// debug layer, then create the instance.
    pub(crate) fn new(config: &SolverConfig) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            GramSchmidtError::PlatformUnsupported(format!("cannot load Vulkan loader: {e}"))
        })?;

        // No vkEnumerateInstanceVersion means a 1.0 loader.
        let version = unsafe { entry.try_enumerate_instance_version() }
            .map_err(GramSchmidtError::vulkan("vkEnumerateInstanceVersion"))?
            .unwrap_or(vk::API_VERSION_1_0);
        if version < REQUIRED_API_VERSION {
            return Err(GramSchmidtError::PlatformUnsupported(format!(
                "Vulkan 1.2 is required, the loader provides {}.{}",
                vk::api_version_major(version),
                vk::api_version_minor(version)
            )));
        }

        if config.enable_debug {
            debug::check_debug_support(&entry)?;
        }

        let app_name = config.application_name_cstr()?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&app_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(REQUIRED_API_VERSION);

        let layers = [debug::VALIDATION_LAYER.as_ptr()];
        let extensions = [ash::ext::debug_utils::NAME.as_ptr()];
        let mut messenger_info = debug::messenger_info();

        let mut instance_info = vk::InstanceCreateInfo::default().application_info(&app_info);
        if config.enable_debug {
            instance_info = instance_info
                .enabled_layer_names(&layers)
                .enabled_extension_names(&extensions)
                .push_next(&mut messenger_info);
        }

        let instance = unsafe { entry.create_instance(&instance_info, None) }
            .map_err(GramSchmidtError::vulkan("vkCreateInstance"))?;

        let mut owned = Self { entry, instance, debug: None };
        if config.enable_debug {
            owned.debug = Some(DebugMessenger::new(&owned.entry, &owned.instance)?);
        }
        Ok(owned)
    }

    pub(crate) fn raw(&self) -> &ash::Instance {
        &self.instance
    }

    /// Physical devices in enumeration order, with what the selector needs.
    pub(crate) fn enumerate(&self) -> Result<(Vec<vk::PhysicalDevice>, Vec<DeviceCandidate>)> {
        let physical = unsafe { self.instance.enumerate_physical_devices() }
            .map_err(GramSchmidtError::vulkan("vkEnumeratePhysicalDevices"))?;

        let candidates = (0u32..)
            .zip(&physical)
            .map(|(index, &pd)| {
                let props = unsafe { self.instance.get_physical_device_properties(pd) };
                let features = unsafe { self.instance.get_physical_device_features(pd) };
                let families = unsafe {
                    self.instance.get_physical_device_queue_family_properties(pd)
                };
                DeviceCandidate {
                    index,
                    name: device_name(&props),
                    supports_f64: features.shader_float64 == vk::TRUE,
                    families: families
                        .iter()
                        .map(|f| QueueFamily { flags: f.queue_flags, queue_count: f.queue_count })
                        .collect(),
                }
            })
            .collect();
        Ok((physical, candidates))
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some(debug) = self.debug.as_mut() {
                debug.destroy();
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Logical device with exactly one queue of the reserved family.
pub(crate) struct LogicalDevice {
    device: ash::Device,
    queue: vk::Queue,
    family_index: u32,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    properties: vk::PhysicalDeviceProperties,
}

impl LogicalDevice {
    pub(crate) fn new(
        instance: &Instance,
        physical: vk::PhysicalDevice,
        family_index: u32,
    ) -> Result<Self> {
        let priorities = [1.0f32];
        let queue_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(family_index)
            .queue_priorities(&priorities)];
        let features = vk::PhysicalDeviceFeatures::default().shader_float64(true);
        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_features(&features);

        let raw = instance.raw();
        let device = unsafe { raw.create_device(physical, &device_info, None) }
            .map_err(GramSchmidtError::vulkan("vkCreateDevice"))?;
        let queue = unsafe { device.get_device_queue(family_index, 0) };
        let memory_properties = unsafe { raw.get_physical_device_memory_properties(physical) };
        let properties = unsafe { raw.get_physical_device_properties(physical) };

        Ok(Self {
            device,
            queue,
            family_index,
            memory_properties,
            properties,
        })
    }

    pub(crate) fn raw(&self) -> &ash::Device {
        &self.device
    }

    pub(crate) fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub(crate) fn family_index(&self) -> u32 {
        self.family_index
    }

    pub(crate) fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub(crate) fn max_storage_buffer_range(&self) -> u32 {
        self.properties.limits.max_storage_buffer_range
    }

    pub(crate) fn info(&self, queue_count: u32) -> DeviceInfo {
        let props = &self.properties;
        let device_type = match props.device_type {
            vk::PhysicalDeviceType::INTEGRATED_GPU => "integrated",
            vk::PhysicalDeviceType::DISCRETE_GPU => "discrete",
            vk::PhysicalDeviceType::VIRTUAL_GPU => "virtual",
            vk::PhysicalDeviceType::CPU => "cpu",
            _ => "other",
        };
        DeviceInfo {
            name: device_name(props),
            device_type: device_type.to_string(),
            api_version_major: vk::api_version_major(props.api_version),
            api_version_minor: vk::api_version_minor(props.api_version),
            vendor_id: props.vendor_id,
            device_id: props.device_id,
            queue_family_index: self.family_index,
            family_queue_count: queue_count,
            max_compute_workgroup_size_x: props.limits.max_compute_work_group_size[0],
            max_storage_buffer_range: props.limits.max_storage_buffer_range,
        }
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

/// Description of the device a solver is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub device_type: String,
    pub api_version_major: u32,
    pub api_version_minor: u32,
    pub vendor_id: u32,
    pub device_id: u32,
    pub queue_family_index: u32,
    pub family_queue_count: u32,
    pub max_compute_workgroup_size_x: u32,
    pub max_storage_buffer_range: u32,
}

fn device_name(props: &vk::PhysicalDeviceProperties) -> String {
    props
        .device_name_as_c_str()
        .map(CStr::to_string_lossy)
        .map(|name| name.into_owned())
        .unwrap_or_else(|_| "unknown device".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::QueuePool;

    fn family(flags: vk::QueueFlags, queue_count: u32) -> QueueFamily {
        QueueFamily { flags, queue_count }
    }

    fn gpu(index: u32, supports_f64: bool, families: Vec<QueueFamily>) -> DeviceCandidate {
        DeviceCandidate { index, name: format!("gpu{index}"), supports_f64, families }
    }

    const GFX: vk::QueueFlags = vk::QueueFlags::from_raw(
        vk::QueueFlags::GRAPHICS.as_raw() | vk::QueueFlags::COMPUTE.as_raw(),
    );
    const COMPUTE: vk::QueueFlags = vk::QueueFlags::COMPUTE;

    #[test]
    fn test_prefers_compute_only_family() {
        let devices = vec![gpu(0, true, vec![family(GFX, 16), family(COMPUTE, 2)])];
        let sel = select_queue_family(&devices, &Ledger::default()).unwrap();
        assert_eq!(sel.slot, QueueSlot { device_index: 0, family_index: 1 });
        assert_eq!(sel.queue_count, 2);
        assert_eq!(sel.device_name, "gpu0");
    }

    #[test]
    fn test_falls_back_to_graphics_family() {
        let devices = vec![gpu(0, true, vec![family(vk::QueueFlags::TRANSFER, 1), family(GFX, 1)])];
        let sel = select_queue_family(&devices, &Ledger::default()).unwrap();
        assert_eq!(sel.slot.family_index, 1);
        assert!(sel.flags.contains(vk::QueueFlags::GRAPHICS));
    }

    #[test]
    fn test_skips_devices_without_f64() {
        let devices = vec![
            gpu(0, false, vec![family(COMPUTE, 8)]),
            gpu(1, true, vec![family(GFX, 1)]),
        ];
        let sel = select_queue_family(&devices, &Ledger::default()).unwrap();
        assert_eq!(sel.slot.device_index, 1);
    }

    #[test]
    fn test_first_fit_across_devices() {
        // Device 0 only has a graphics+compute family; device 1 has a compute-only
        // one. First fit still takes device 0.
        let devices = vec![
            gpu(0, true, vec![family(GFX, 1)]),
            gpu(1, true, vec![family(COMPUTE, 4)]),
        ];
        let sel = select_queue_family(&devices, &Ledger::default()).unwrap();
        assert_eq!(sel.slot, QueueSlot { device_index: 0, family_index: 0 });
    }

    #[test]
    fn test_moves_on_when_families_are_full() {
        let pool = QueuePool::new();
        let devices = vec![
            gpu(0, true, vec![family(COMPUTE, 1), family(GFX, 1)]),
            gpu(1, true, vec![family(COMPUTE, 1)]),
        ];
        let mut held = Vec::new();
        let mut slots = Vec::new();
        for _ in 0..3 {
            let mut ledger = pool.lock();
            let pending = ledger.reserve(&devices).unwrap();
            slots.push(pending.selection().slot);
            held.push(pending.commit(&pool));
        }
        assert_eq!(
            slots,
            vec![
                QueueSlot { device_index: 0, family_index: 0 },
                QueueSlot { device_index: 0, family_index: 1 },
                QueueSlot { device_index: 1, family_index: 0 },
            ]
        );
        let err = pool.lock().reserve(&devices).unwrap_err();
        assert!(matches!(err, GramSchmidtError::ResourceExhausted));
    }

    #[test]
    fn test_no_devices_is_exhausted() {
        assert!(matches!(
            select_queue_family(&[], &Ledger::default()),
            Err(GramSchmidtError::ResourceExhausted)
        ));
    }
}
