// Vulkan rendering instance
//
// This holds all of the common instance code for the Vulkan context

use ash::extensions::ext;
use ash::{vk, Entry};

use crate::CreateInfo;

use std::ffi::{CStr, CString};
use std::os::raw::c_void;

// this happy little debug callback is from the ash examples
// all it does is print any errors/warnings thrown.
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> u32 {
    log::error!(
        "[VK][{:?}][{:?}] {:?}",
        message_severity,
        message_types,
        CStr::from_ptr(p_callback_data.as_ref().unwrap().p_message)
    );
    vk::FALSE
}

/// A Vulkan Instance
///
/// This holds our basic vulkan session data. We use this to create
/// the device and anything else that outlives a single frame.
pub struct Instance {
    /// debug callback sugar mentioned earlier. Only present when the
    /// caller asked for validation.
    debug: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    /// the entry just loads function pointers from the dynamic library
    pub(crate) loader: Entry,
    /// the big vulkan instance.
    pub(crate) inst: ash::Instance,
}

impl Instance {
    /// Creates a new debug reporter and registers our function
    /// for debug callbacks so we get nice error messages
    fn setup_debug(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> (ext::DebugUtils, vk::DebugUtilsMessengerEXT) {
        let debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
            )
            .pfn_user_callback(Some(vulkan_debug_callback));

        let dr_loader = ext::DebugUtils::new(entry, instance);
        let callback = unsafe {
            dr_loader
                .create_debug_utils_messenger(&debug_info, None)
                .unwrap()
        };
        return (dr_loader, callback);
    }

    /// Create a vkInstance
    ///
    /// Most of the create info entries are straightforward, with
    /// some basic extensions being enabled. Validation layers are only
    /// requested when the caller opts in through `CreateInfo`.
    pub fn new(info: &CreateInfo) -> crate::Result<Self> {
        let entry = Entry::linked();
        let app_name = CString::new(info.app_name.as_str()).unwrap();

        let layer_names: Vec<CString> = if info.enable_validation {
            vec![CString::new("VK_LAYER_KHRONOS_validation").unwrap()]
        } else {
            Vec::new()
        };
        let layer_names_raw: Vec<*const i8> = layer_names
            .iter()
            .map(|raw_name: &CString| raw_name.as_ptr())
            .collect();

        let mut extension_names_raw: Vec<*const i8> = info
            .required_extensions
            .iter()
            .map(|e| e.as_ptr())
            .collect();
        if info.enable_validation {
            extension_names_raw.push(ext::DebugUtils::name().as_ptr());
        }

        let appinfo = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(info.app_version)
            .engine_name(&app_name)
            .engine_version(0)
            .api_version(vk::API_VERSION_1_2)
            .build();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&appinfo)
            .enabled_layer_names(&layer_names_raw)
            .enabled_extension_names(&extension_names_raw)
            .build();

        let instance: ash::Instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .or(Err(crate::SquallError::VK_NOT_ALL_EXTENSIONS_AVAILABLE))?
        };

        let debug = if info.enable_validation {
            Some(Self::setup_debug(&entry, &instance))
        } else {
            None
        };

        Ok(Self {
            loader: entry,
            inst: instance,
            debug: debug,
        })
    }

    /// Attach a human readable name to a vulkan object.
    ///
    /// Only does anything when validation was enabled, since the name
    /// infrastructure comes from VK_EXT_debug_utils.
    pub(crate) fn set_object_name(
        &self,
        dev: vk::Device,
        object_type: vk::ObjectType,
        handle: u64,
        name: &str,
    ) {
        if let Some((loader, _)) = self.debug.as_ref() {
            let cname = match CString::new(name) {
                Ok(c) => c,
                Err(_) => return,
            };
            let info = vk::DebugUtilsObjectNameInfoEXT::builder()
                .object_type(object_type)
                .object_handle(handle)
                .object_name(&cname)
                .build();

            unsafe {
                loader.set_debug_utils_object_name(dev, &info).ok();
            }
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, callback)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(callback, None);
            }
            self.inst.destroy_instance(None);
        }
    }
}
