use std::borrow::Cow;
use std::cell::RefCell;
use std::ffi::{c_char, c_void, CStr};

use ash::{ext, khr, vk};

use crate::config::RenderSettings;
use crate::error::{RenderError, Result};
use crate::gpu::{DeviceCapabilities, ValidationCallback, ValidationMessage, ValidationSeverity};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

const REQUIRED_EXTENSIONS: [&CStr; 3] = [
    khr::acceleration_structure::NAME,
    khr::ray_query::NAME,
    khr::deferred_host_operations::NAME,
];

/// Receives debug-utils messages. Boxed so the messenger can hold its address.
#[derive(Default)]
pub(super) struct ValidationSink {
    pub callback: RefCell<Option<ValidationCallback>>,
}

impl ValidationSink {
    fn deliver(&self, message: ValidationMessage) {
        match self.callback.try_borrow() {
            Ok(callback) => match callback.as_ref() {
                Some(callback) => callback(&message),
                None => log::warn!("Vulkan: {}", message.message),
            },
            Err(_) => log::warn!("Vulkan: {}", message.message),
        }
    }
}

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    user_data: *mut c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || user_data.is_null() {
        return vk::FALSE;
    }
    let callback_data = &*p_callback_data;
    let message_id_name = if callback_data.p_message_id_name.is_null() {
        Cow::from("")
    } else {
        CStr::from_ptr(callback_data.p_message_id_name).to_string_lossy()
    };
    let message = if callback_data.p_message.is_null() {
        Cow::from("")
    } else {
        CStr::from_ptr(callback_data.p_message).to_string_lossy()
    };
    let severity = if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        ValidationSeverity::Error
    } else {
        ValidationSeverity::Warning
    };

    let sink = &*(user_data as *const ValidationSink);
    sink.deliver(ValidationMessage {
        severity,
        message: format!("[{}] {}", message_id_name, message),
    });
    vk::FALSE
}

fn vk_failure(what: &str, result: vk::Result) -> RenderError {
    RenderError::Gpu(crate::error::GpuError::Vulkan(format!("{what}: {result}")))
}

/// Instance, logical device and the loaders every other part of the Vulkan
/// device needs.
pub(super) struct Context {
    _entry: ash::Entry,
    pub instance: ash::Instance,
    debug: Option<(ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    pub labels: Option<ext::debug_utils::Device>,
    pub physical_device: vk::PhysicalDevice,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub device: ash::Device,
    pub queue: vk::Queue,
    pub queue_family: u32,
    pub accel: khr::acceleration_structure::Device,
    pub command_pool: vk::CommandPool,
    pub sampler: vk::Sampler,
    pub name: String,
    pub capabilities: DeviceCapabilities,
}

impl Context {
    /// `sink` must outlive the context.
    pub fn new(settings: &RenderSettings, sink: &ValidationSink) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|error| RenderError::MissingCapability(format!("Vulkan loader: {error}")))?;

        let validation = settings.validation && has_layer(&entry, VALIDATION_LAYER);
        if settings.validation && !validation {
            log::warn!("Validation requested but {:?} is not installed", VALIDATION_LAYER);
        }

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"tracer")
            .engine_name(c"tracer")
            .api_version(vk::API_VERSION_1_3);
        let layers: Vec<*const c_char> = if validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };
        let extensions: Vec<*const c_char> = if validation {
            vec![ext::debug_utils::NAME.as_ptr()]
        } else {
            Vec::new()
        };
        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&extensions);
        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(|result| vk_failure("instance creation", result))?;

        let debug = if validation {
            let debug_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(vulkan_debug_callback))
                .user_data(sink as *const ValidationSink as *mut c_void);
            let loader = ext::debug_utils::Instance::new(&entry, &instance);
            match unsafe { loader.create_debug_utils_messenger(&debug_info, None) } {
                Ok(messenger) => Some((loader, messenger)),
                Err(result) => {
                    log::warn!("Debug messenger unavailable: {}", result);
                    None
                }
            }
        } else {
            None
        };

        let selected = select_physical_device(&instance, settings.gpu_index);
        let (physical_device, queue_family) = match selected {
            Ok(selected) => selected,
            Err(error) => {
                unsafe {
                    if let Some((loader, messenger)) = &debug {
                        loader.destroy_debug_utils_messenger(*messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(error);
            }
        };

        let mut accel_properties = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut properties2 =
            vk::PhysicalDeviceProperties2::default().push_next(&mut accel_properties);
        unsafe { instance.get_physical_device_properties2(physical_device, &mut properties2) };
        let properties = properties2.properties;
        let name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let priorities = [1.0f32];
        let queue_info = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities)];
        let extension_names: Vec<*const c_char> =
            REQUIRED_EXTENSIONS.iter().map(|name| name.as_ptr()).collect();

        let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true)
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .shader_sampled_image_array_non_uniform_indexing(true);
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default()
            .synchronization2(true)
            .dynamic_rendering(true);
        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true);
        let mut ray_query_features =
            vk::PhysicalDeviceRayQueryFeaturesKHR::default().ray_query(true);
        let mut features = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut features12)
            .push_next(&mut features13)
            .push_next(&mut accel_features)
            .push_next(&mut ray_query_features);
        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_info)
            .enabled_extension_names(&extension_names)
            .push_next(&mut features);

        let device = match unsafe { instance.create_device(physical_device, &device_info, None) } {
            Ok(device) => device,
            Err(result) => {
                unsafe {
                    if let Some((loader, messenger)) = &debug {
                        loader.destroy_debug_utils_messenger(*messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(vk_failure("device creation", result));
            }
        };
        let queue = unsafe { device.get_device_queue(queue_family, 0) };
        let accel = khr::acceleration_structure::Device::new(&instance, &device);
        let labels = debug
            .as_ref()
            .map(|_| ext::debug_utils::Device::new(&instance, &device));

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(|result| vk_failure("command pool", result))?;
        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .max_lod(vk::LOD_CLAMP_NONE);
        let sampler = unsafe { device.create_sampler(&sampler_info, None) }
            .map_err(|result| vk_failure("sampler", result))?;

        let capabilities = DeviceCapabilities {
            ray_tracing: true,
            external_memory: false,
            timestamp_queries: properties.limits.timestamp_compute_and_graphics == vk::TRUE,
            min_accel_scratch_alignment: u64::from(
                accel_properties.min_acceleration_structure_scratch_offset_alignment,
            ),
            max_instance_count: accel_properties.max_instance_count.min(u64::from(u32::MAX)) as u32,
        };

        Ok(Self {
            _entry: entry,
            instance,
            debug,
            labels,
            physical_device,
            memory_properties,
            device,
            queue,
            queue_family,
            accel,
            command_pool,
            sampler,
            name,
            capabilities,
        })
    }

    pub fn allocate_command_buffer(&self) -> Result<vk::CommandBuffer, vk::Result> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info) }?;
        buffers.first().copied().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    pub fn free_command_buffer(&self, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.device
                .free_command_buffers(self.command_pool, &[command_buffer])
        };
    }

    /// Everything created from the device must be gone.
    pub fn destroy(&mut self) {
        unsafe {
            self.device.destroy_sampler(self.sampler, None);
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn has_layer(entry: &ash::Entry, layer: &CStr) -> bool {
    unsafe { entry.enumerate_instance_layer_properties() }
        .map(|layers| {
            layers
                .iter()
                .any(|properties| properties.layer_name_as_c_str() == Ok(layer))
        })
        .unwrap_or(false)
}

/// The `index`-th device with a graphics and compute queue, Vulkan 1.3 and
/// every required extension.
fn select_physical_device(
    instance: &ash::Instance,
    index: u32,
) -> Result<(vk::PhysicalDevice, u32)> {
    let devices = unsafe { instance.enumerate_physical_devices() }
        .map_err(|result| vk_failure("enumerating devices", result))?;
    let physical_device = *devices.get(index as usize).ok_or_else(|| {
        let found = devices.len();
        RenderError::MissingCapability(format!("no GPU with index {index} ({found} found)"))
    })?;

    let properties = unsafe { instance.get_physical_device_properties(physical_device) };
    if properties.api_version < vk::API_VERSION_1_3 {
        return Err(RenderError::MissingCapability(
            "Vulkan 1.3 (synchronization2, buffer device address)".to_string(),
        ));
    }

    let available = unsafe { instance.enumerate_device_extension_properties(physical_device) }
        .map_err(|result| vk_failure("enumerating extensions", result))?;
    let missing: Vec<String> = REQUIRED_EXTENSIONS
        .iter()
        .filter(|required| {
            !available
                .iter()
                .any(|properties| properties.extension_name_as_c_str() == Ok(**required))
        })
        .map(|required| required.to_string_lossy().into_owned())
        .collect();
    if !missing.is_empty() {
        return Err(RenderError::MissingCapability(missing.join(", ")));
    }

    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    let queue_family = families
        .iter()
        .position(|family| {
            family
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .ok_or_else(|| RenderError::MissingCapability("graphics and compute queue".to_string()))?;
    Ok((physical_device, queue_family as u32))
}
