use std::ffi::CStr;

use ash::ext;

/// Which optional dynamic-state entry points the device resolved.
///
/// Kept separate from the loaded function tables so that pipeline-key
/// equality can be exercised without a live device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapFlags {
    /// `VK_EXT_extended_dynamic_state`: topology, stencil enable and stencil
    /// ops are set per draw step instead of being baked into pipelines.
    pub dynamic_state: bool,
    /// `vkCmdSetColorWriteMaskEXT` from `VK_EXT_extended_dynamic_state3`.
    pub color_write_mask: bool,
    /// `vkCmdSetColorBlendEquationEXT` from `VK_EXT_extended_dynamic_state3`.
    pub blend_equation: bool,
}

/// Optional device capabilities, resolved once at backend construction.
///
/// A capability whose entry point the loader does not return stays off and
/// the backend falls back to baking the corresponding state into pipeline
/// objects; absence is never an error.
pub struct DeviceCaps {
    pub flags: CapFlags,
    pub dynamic_state: Option<ext::extended_dynamic_state::Device>,
    pub dynamic_state3: Option<ext::extended_dynamic_state3::Device>,
}

impl DeviceCaps {
    pub fn probe(instance: &ash::Instance, device: &ash::Device) -> Self {
        let dynamic_state = resolve(instance, device, c"vkCmdSetPrimitiveTopologyEXT")
            && resolve(instance, device, c"vkCmdSetStencilTestEnableEXT")
            && resolve(instance, device, c"vkCmdSetStencilOpEXT");
        let color_write_mask = resolve(instance, device, c"vkCmdSetColorWriteMaskEXT");
        let blend_equation = resolve(instance, device, c"vkCmdSetColorBlendEquationEXT");

        let flags = CapFlags {
            dynamic_state,
            color_write_mask,
            blend_equation,
        };
        tracing::debug!(?flags, "resolved dynamic-state capabilities");

        Self {
            flags,
            dynamic_state: dynamic_state
                .then(|| ext::extended_dynamic_state::Device::new(instance, device)),
            dynamic_state3: (color_write_mask || blend_equation)
                .then(|| ext::extended_dynamic_state3::Device::new(instance, device)),
        }
    }

}

fn resolve(instance: &ash::Instance, device: &ash::Device, name: &CStr) -> bool {
    let addr = unsafe { instance.get_device_proc_addr(device.handle(), name.as_ptr()) };
    if addr.is_none() {
        tracing::debug!(entry_point = ?name, "entry point not resolved, capability disabled");
    }
    addr.is_some()
}
