// SPDX-License-Identifier: CEPL-1.0
use std::ffi::{c_char, CStr};

use ash::khr::{surface, swapchain};
use ash::{vk, Entry, Instance};
use lumen_render::RenderSettings;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use tracing::{debug, info, warn};

use crate::debug::{validation_layer_available, DebugMessenger, VALIDATION_LAYER};
use crate::error::{VkCall, VkError};

/// Declared capability only; no ray-tracing pipeline is ever built.
pub const RAY_TRACING_EXTENSIONS: [&CStr; 6] = [
    ash::khr::acceleration_structure::NAME,
    ash::khr::deferred_host_operations::NAME,
    ash::khr::ray_tracing_pipeline::NAME,
    ash::khr::maintenance3::NAME,
    ash::khr::pipeline_library::NAME,
    ash::khr::buffer_device_address::NAME,
];

pub fn required_device_extensions(require_ray_tracing: bool) -> Vec<&'static CStr> {
    let mut exts = vec![swapchain::NAME];
    if require_ray_tracing {
        exts.extend_from_slice(&RAY_TRACING_EXTENSIONS);
    }
    exts
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
    pub transfer: Option<u32>,
}

/// Fully resolved families. Roles may share an index but stay logically distinct.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
    pub transfer: u32,
}

impl QueueFamilyIndices {
    pub fn is_complete(&self) -> bool {
        self.resolve().is_some()
    }

    pub fn resolve(&self) -> Option<QueueFamilies> {
        Some(QueueFamilies {
            graphics: self.graphics?,
            present: self.present?,
            transfer: self.transfer?,
        })
    }
}

impl QueueFamilies {
    /// One entry per distinct family; a family serving two roles is created once.
    pub fn unique(&self) -> Vec<u32> {
        let mut v = vec![self.graphics, self.present, self.transfer];
        v.sort_unstable();
        v.dedup();
        v
    }
}

/// Graphics: first family with GRAPHICS. Present: the graphics family if it can
/// present, else the first that can. Transfer: a dedicated TRANSFER-only family if
/// one exists, else any family that can copy.
pub fn find_queue_families(
    props: &[vk::QueueFamilyProperties],
    mut supports_present: impl FnMut(u32) -> bool,
) -> QueueFamilyIndices {
    let usable = |q: &vk::QueueFamilyProperties| q.queue_count > 0;
    let graphics = props
        .iter()
        .position(|q| usable(q) && q.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|i| i as u32);

    let present = match graphics {
        Some(g) if supports_present(g) => Some(g),
        _ => (0..props.len() as u32).find(|&i| usable(&props[i as usize]) && supports_present(i)),
    };

    let dedicated = props.iter().position(|q| {
        usable(q)
            && q.queue_flags.contains(vk::QueueFlags::TRANSFER)
            && !q.queue_flags.contains(vk::QueueFlags::GRAPHICS)
    });
    let transfer = dedicated
        .or_else(|| {
            props.iter().position(|q| {
                usable(q)
                    && q.queue_flags.intersects(
                        vk::QueueFlags::TRANSFER | vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
                    )
            })
        })
        .map(|i| i as u32);

    QueueFamilyIndices {
        graphics,
        present,
        transfer,
    }
}

pub fn missing_extensions<'a>(available: &[&CStr], required: &[&'a CStr]) -> Vec<&'a CStr> {
    required
        .iter()
        .copied()
        .filter(|r| !available.contains(r))
        .collect()
}

pub fn is_suitable(
    families: &QueueFamilyIndices,
    available: &[&CStr],
    required: &[&CStr],
    features: &vk::PhysicalDeviceFeatures,
    surface_usable: bool,
) -> bool {
    families.is_complete()
        && missing_extensions(available, required).is_empty()
        && features.sampler_anisotropy == vk::TRUE
        && surface_usable
}

/// Lower is better.
fn device_type_rank(ty: vk::PhysicalDeviceType) -> u8 {
    match ty {
        vk::PhysicalDeviceType::DISCRETE_GPU => 0,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        _ => 3,
    }
}

/// Capability snapshot taken while picking the device.
#[derive(Clone)]
pub struct PhysicalDeviceInfo {
    pub name: String,
    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
    pub memory: vk::PhysicalDeviceMemoryProperties,
}

impl PhysicalDeviceInfo {
    pub fn min_uniform_alignment(&self) -> u64 {
        self.properties.limits.min_uniform_buffer_offset_alignment.max(1)
    }

    pub fn max_anisotropy(&self) -> f32 {
        self.properties.limits.max_sampler_anisotropy
    }
}

/// Instance-level objects that exist before a device is chosen.
struct InstanceBase {
    entry: Entry,
    instance: Instance,
    debug: Option<DebugMessenger>,
    surface_loader: surface::Instance,
    surface: vk::SurfaceKHR,
}

impl InstanceBase {
    unsafe fn destroy(self) {
        self.surface_loader.destroy_surface(self.surface, None);
        if let Some(d) = self.debug {
            d.destroy();
        }
        self.instance.destroy_instance(None);
    }
}

/// Instance, surface, physical + logical device and the three queues.
pub struct DeviceContext {
    _entry: Entry,
    pub(crate) instance: Instance,
    debug: Option<DebugMessenger>,
    pub(crate) surface_loader: surface::Instance,
    pub(crate) surface: vk::SurfaceKHR,
    pub(crate) phys: vk::PhysicalDevice,
    pub(crate) info: PhysicalDeviceInfo,
    pub(crate) families: QueueFamilies,
    pub(crate) device: ash::Device,
    pub(crate) graphics_queue: vk::Queue,
    pub(crate) present_queue: vk::Queue,
    pub(crate) transfer_queue: vk::Queue,
    pub(crate) swapchain_loader: swapchain::Device,
}

unsafe fn create_instance(
    entry: &Entry,
    display_raw: RawDisplayHandle,
    validation: bool,
) -> Result<Instance, VkError> {
    let app_name = c"lumen";
    let app_info = vk::ApplicationInfo {
        p_application_name: app_name.as_ptr(),
        application_version: 0,
        p_engine_name: app_name.as_ptr(),
        engine_version: 0,
        api_version: vk::API_VERSION_1_2,
        ..Default::default()
    };

    let mut exts: Vec<*const c_char> = ash_window::enumerate_required_extensions(display_raw)
        .map_err(VkError::InstanceCreation)?
        .to_vec();
    if validation {
        exts.push(ash::ext::debug_utils::NAME.as_ptr());
    }
    let layers = [VALIDATION_LAYER.as_ptr()];

    let ci = vk::InstanceCreateInfo {
        p_application_info: &app_info,
        enabled_extension_count: exts.len() as u32,
        pp_enabled_extension_names: exts.as_ptr(),
        enabled_layer_count: if validation { layers.len() as u32 } else { 0 },
        pp_enabled_layer_names: layers.as_ptr(),
        ..Default::default()
    };
    entry
        .create_instance(&ci, None)
        .map_err(VkError::InstanceCreation)
}

unsafe fn select_device(
    base: &InstanceBase,
    required: &[&CStr],
) -> Result<(vk::PhysicalDevice, QueueFamilies, PhysicalDeviceInfo), VkError> {
    let devices = base
        .instance
        .enumerate_physical_devices()
        .call("vkEnumeratePhysicalDevices")?;

    let mut best: Option<(u8, vk::PhysicalDevice, QueueFamilies, PhysicalDeviceInfo)> = None;
    for phys in devices {
        let properties = base.instance.get_physical_device_properties(phys);
        let name = properties
            .device_name_as_c_str()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let queue_families = base
            .instance
            .get_physical_device_queue_family_properties(phys);
        let indices = find_queue_families(&queue_families, |i| {
            base.surface_loader
                .get_physical_device_surface_support(phys, i, base.surface)
                .unwrap_or(false)
        });

        let ext_props = base
            .instance
            .enumerate_device_extension_properties(phys)
            .unwrap_or_default();
        let available: Vec<&CStr> = ext_props
            .iter()
            .filter_map(|e| e.extension_name_as_c_str().ok())
            .collect();

        let features = base.instance.get_physical_device_features(phys);
        let surface_formats = base
            .surface_loader
            .get_physical_device_surface_formats(phys, base.surface)
            .unwrap_or_default();
        let present_modes = base
            .surface_loader
            .get_physical_device_surface_present_modes(phys, base.surface)
            .unwrap_or_default();

        let surface_usable = !surface_formats.is_empty() && !present_modes.is_empty();
        let Some(families) = indices
            .resolve()
            .filter(|_| is_suitable(&indices, &available, required, &features, surface_usable))
        else {
            debug!(
                "skipping {name}: families={indices:?} missing={:?} anisotropy={} surface={surface_usable}",
                missing_extensions(&available, required),
                features.sampler_anisotropy == vk::TRUE
            );
            continue;
        };

        let rank = device_type_rank(properties.device_type);
        if best.as_ref().is_some_and(|(r, ..)| *r <= rank) {
            continue;
        }
        let info = PhysicalDeviceInfo {
            name,
            properties,
            features,
            memory: base.instance.get_physical_device_memory_properties(phys),
        };
        best = Some((rank, phys, families, info));
    }

    best.map(|(_, phys, families, info)| (phys, families, info))
        .ok_or(VkError::NoSuitableDevice)
}

unsafe fn create_logical_device(
    instance: &Instance,
    phys: vk::PhysicalDevice,
    families: &QueueFamilies,
    info: &PhysicalDeviceInfo,
    required: &[&CStr],
) -> Result<ash::Device, VkError> {
    let priorities = [1.0_f32];
    let queue_infos: Vec<vk::DeviceQueueCreateInfo> = families
        .unique()
        .into_iter()
        .map(|family| vk::DeviceQueueCreateInfo {
            queue_family_index: family,
            queue_count: 1,
            p_queue_priorities: priorities.as_ptr(),
            ..Default::default()
        })
        .collect();

    let features = vk::PhysicalDeviceFeatures {
        sampler_anisotropy: vk::TRUE,
        shader_sampled_image_array_dynamic_indexing: info
            .features
            .shader_sampled_image_array_dynamic_indexing,
        ..Default::default()
    };

    let ext_ptrs: Vec<*const c_char> = required.iter().map(|e| e.as_ptr()).collect();
    let ci = vk::DeviceCreateInfo {
        queue_create_info_count: queue_infos.len() as u32,
        p_queue_create_infos: queue_infos.as_ptr(),
        enabled_extension_count: ext_ptrs.len() as u32,
        pp_enabled_extension_names: ext_ptrs.as_ptr(),
        p_enabled_features: &features,
        ..Default::default()
    };
    instance
        .create_device(phys, &ci, None)
        .map_err(VkError::DeviceCreation)
}

impl DeviceContext {
    /// STRICT ORDER: instance, surface from that instance, device picked against
    /// that surface, logical device. Anything already built is torn down on failure.
    pub unsafe fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        settings: &RenderSettings,
    ) -> Result<Self, VkError> {
        let dh = display.display_handle()?.as_raw();
        let wh = window.window_handle()?.as_raw();

        let entry = Entry::linked();
        let validation = if !settings.validation {
            false
        } else if !cfg!(debug_assertions) {
            info!("validation requested but disabled in release builds");
            false
        } else if !validation_layer_available(&entry) {
            warn!("{VALIDATION_LAYER:?} not installed; continuing without validation");
            false
        } else {
            true
        };

        let instance = create_instance(&entry, dh, validation)?;
        let debug = if validation {
            match DebugMessenger::new(&entry, &instance) {
                Ok(d) => Some(d),
                Err(e) => {
                    warn!("debug messenger unavailable: {e}");
                    None
                }
            }
        } else {
            None
        };

        let surface_loader = surface::Instance::new(&entry, &instance);
        let surface = match ash_window::create_surface(&entry, &instance, dh, wh, None) {
            Ok(s) => s,
            Err(e) => {
                if let Some(d) = debug {
                    d.destroy();
                }
                instance.destroy_instance(None);
                return Err(VkError::SurfaceCreation(e));
            }
        };

        let base = InstanceBase {
            entry,
            instance,
            debug,
            surface_loader,
            surface,
        };

        let required = required_device_extensions(settings.require_ray_tracing);
        let (phys, families, info) = match select_device(&base, &required) {
            Ok(v) => v,
            Err(e) => {
                base.destroy();
                return Err(e);
            }
        };
        let device = match create_logical_device(&base.instance, phys, &families, &info, &required)
        {
            Ok(d) => d,
            Err(e) => {
                base.destroy();
                return Err(e);
            }
        };

        info!(
            "GPU: {} ({:?}), families g={} p={} t={}",
            info.name,
            info.properties.device_type,
            families.graphics,
            families.present,
            families.transfer
        );

        let InstanceBase {
            entry,
            instance,
            debug,
            surface_loader,
            surface,
        } = base;
        let swapchain_loader = swapchain::Device::new(&instance, &device);
        Ok(Self {
            graphics_queue: device.get_device_queue(families.graphics, 0),
            present_queue: device.get_device_queue(families.present, 0),
            transfer_queue: device.get_device_queue(families.transfer, 0),
            _entry: entry,
            instance,
            debug,
            surface_loader,
            surface,
            phys,
            info,
            families,
            device,
            swapchain_loader,
        })
    }

    pub fn wait_idle(&self) -> Result<(), VkError> {
        unsafe { self.device.device_wait_idle() }.call("vkDeviceWaitIdle")
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some(d) = self.debug.take() {
                d.destroy();
            }
            self.instance.destroy_instance(None);
        }
    }
}
