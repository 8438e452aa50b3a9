use ash::vk;

use crate::error::RendererError;
use crate::memory::find_memory_type;

/// A growable, persistently mapped host-visible buffer owned by one
/// frame-in-flight slot.
///
/// Uploads that fit the current capacity are a plain memcpy into the mapped
/// region; larger uploads destroy and recreate the buffer sized exactly to
/// the data. After a resize any previously fetched handle is stale, so the
/// recording path re-reads [`StreamBuffer::handle`] every frame before
/// binding.
pub(crate) struct StreamBuffer {
    usage: vk::BufferUsageFlags,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    mapped: *mut u8,
    capacity: vk::DeviceSize,
}

impl StreamBuffer {
    pub(crate) fn new(usage: vk::BufferUsageFlags) -> Self {
        Self {
            usage,
            buffer: vk::Buffer::null(),
            memory: vk::DeviceMemory::null(),
            mapped: std::ptr::null_mut(),
            capacity: 0,
        }
    }

    pub(crate) fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Copies `data` into the buffer, reallocating only when it does not fit.
    pub(crate) fn upload(
        &mut self,
        device: &ash::Device,
        memory_props: &vk::PhysicalDeviceMemoryProperties,
        data: &[u8],
    ) -> Result<(), RendererError> {
        if data.is_empty() {
            return Ok(());
        }
        if needs_grow(self.capacity, data.len() as vk::DeviceSize) {
            self.grow(device, memory_props, data.len() as vk::DeviceSize)?;
        }
        // The memory is HOST_COHERENT; ownership of this slot's buffers while
        // the frame is being recorded is guaranteed by the caller.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.mapped, data.len());
        }
        Ok(())
    }

    fn grow(
        &mut self,
        device: &ash::Device,
        memory_props: &vk::PhysicalDeviceMemoryProperties,
        size: vk::DeviceSize,
    ) -> Result<(), RendererError> {
        tracing::debug!(
            old_capacity = self.capacity,
            new_capacity = size,
            usage = ?self.usage,
            "growing stream buffer"
        );
        self.destroy(device);

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(self.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe {
            device
                .create_buffer(&buffer_info, None)
                .map_err(RendererError::CreateBuffer)?
        };

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let memory_type = find_memory_type(
            memory_props,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        let memory = unsafe {
            device
                .allocate_memory(&alloc_info, None)
                .map_err(RendererError::AllocateMemory)?
        };

        unsafe {
            device
                .bind_buffer_memory(buffer, memory, 0)
                .map_err(RendererError::BindBufferMemory)?;
            self.mapped = device
                .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                .map_err(RendererError::MapMemory)? as *mut u8;
        }

        self.buffer = buffer;
        self.memory = memory;
        self.capacity = size;
        Ok(())
    }

    pub(crate) fn destroy(&mut self, device: &ash::Device) {
        if self.buffer != vk::Buffer::null() {
            unsafe {
                device.destroy_buffer(self.buffer, None);
                device.free_memory(self.memory, None);
            }
        }
        self.buffer = vk::Buffer::null();
        self.memory = vk::DeviceMemory::null();
        self.mapped = std::ptr::null_mut();
        self.capacity = 0;
    }
}

/// Per-frame-in-flight GPU buffers: the frame's vertex upload and its
/// accumulated paint-uniform storage block.
pub(crate) struct FrameResources {
    pub(crate) vertices: StreamBuffer,
    pub(crate) uniforms: StreamBuffer,
}

impl FrameResources {
    pub(crate) fn new() -> Self {
        Self {
            vertices: StreamBuffer::new(vk::BufferUsageFlags::VERTEX_BUFFER),
            uniforms: StreamBuffer::new(vk::BufferUsageFlags::STORAGE_BUFFER),
        }
    }

    pub(crate) fn destroy(&mut self, device: &ash::Device) {
        self.vertices.destroy(device);
        self.uniforms.destroy(device);
    }
}

fn needs_grow(capacity: vk::DeviceSize, required: vk::DeviceSize) -> bool {
    required > capacity
}

#[cfg(test)]
mod tests {
    use super::needs_grow;

    #[test]
    fn capacity_never_shrinks() {
        // A non-decreasing sequence of required sizes grows exactly when the
        // requirement first exceeds what is already allocated.
        let mut capacity = 0;
        let mut reallocations = 0;
        for required in [16u64, 16, 64, 64, 64, 256] {
            if needs_grow(capacity, required) {
                capacity = required;
                reallocations += 1;
            }
            assert!(capacity >= required);
        }
        assert_eq!(capacity, 256);
        assert_eq!(reallocations, 3);
    }

    #[test]
    fn fitting_upload_does_not_reallocate() {
        assert!(!needs_grow(128, 128));
        assert!(!needs_grow(128, 1));
        assert!(needs_grow(128, 129));
        assert!(needs_grow(0, 1));
    }
}
