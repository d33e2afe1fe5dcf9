//! Validation-layer plumbing: layer/extension availability checks and a
//! messenger that forwards driver messages to `tracing`.

use std::ffi::{c_void, CStr};

use ash::vk;

use crate::error::{GramSchmidtError, Result};

pub(crate) const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Fail with `PlatformUnsupported` unless the validation layer and
/// `VK_EXT_debug_utils` are both present.
pub(crate) fn check_debug_support(entry: &ash::Entry) -> Result<()> {
    let layers = unsafe { entry.enumerate_instance_layer_properties() }
        .map_err(GramSchmidtError::vulkan("vkEnumerateInstanceLayerProperties"))?;
    let has_layer = layers
        .iter()
        .any(|layer| layer.layer_name_as_c_str() == Ok(VALIDATION_LAYER));
    if !has_layer {
        return Err(GramSchmidtError::PlatformUnsupported(format!(
            "debug layer {} was not found",
            VALIDATION_LAYER.to_string_lossy()
        )));
    }

    let extensions = unsafe { entry.enumerate_instance_extension_properties(None) }
        .map_err(GramSchmidtError::vulkan("vkEnumerateInstanceExtensionProperties"))?;
    let has_extension = extensions
        .iter()
        .any(|ext| ext.extension_name_as_c_str() == Ok(ash::ext::debug_utils::NAME));
    if !has_extension {
        return Err(GramSchmidtError::PlatformUnsupported(format!(
            "debug extension {} was not found",
            ash::ext::debug_utils::NAME.to_string_lossy()
        )));
    }
    Ok(())
}

/// Create-info for the messenger; also chained into instance creation so
/// `vkCreateInstance` itself is covered.
pub(crate) fn messenger_info() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(forward_to_tracing))
}

/// Owned debug messenger.
pub(crate) struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    pub(crate) fn new(entry: &ash::Entry, instance: &ash::Instance) -> Result<Self> {
        let loader = ash::ext::debug_utils::Instance::new(entry, instance);
        let messenger = unsafe { loader.create_debug_utils_messenger(&messenger_info(), None) }
            .map_err(GramSchmidtError::vulkan("vkCreateDebugUtilsMessengerEXT"))?;
        Ok(Self { loader, messenger })
    }

    /// Must run before the owning instance is destroyed.
    pub(crate) unsafe fn destroy(&mut self) {
        if self.messenger != vk::DebugUtilsMessengerEXT::null() {
            self.loader.destroy_debug_utils_messenger(self.messenger, None);
            self.messenger = vk::DebugUtilsMessengerEXT::null();
        }
    }
}

unsafe extern "system" fn forward_to_tracing(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    kind: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(target: "vgs_vulkan::validation", ?kind, "{message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        tracing::warn!(target: "vgs_vulkan::validation", ?kind, "{message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        tracing::debug!(target: "vgs_vulkan::validation", ?kind, "{message}");
    } else {
        tracing::trace!(target: "vgs_vulkan::validation", ?kind, "{message}");
    }
    vk::FALSE
}
