use ash::vk;

use crate::draw_list::TextureId;
use crate::error::RendererError;
use crate::memory::find_memory_type;

const BYTES_PER_PIXEL: usize = 4;

/// Dense slot arena with an explicit free list. Ids are stable slot indices;
/// freed slots are reused in LIFO order.
pub(crate) struct Arena<T> {
    entries: Vec<Option<T>>,
    free: Vec<usize>,
}

impl<T> Arena<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, value: T) -> TextureId {
        match self.free.pop() {
            Some(index) => {
                self.entries[index] = Some(value);
                TextureId::from_index(index)
            }
            None => {
                self.entries.push(Some(value));
                TextureId::from_index(self.entries.len() - 1)
            }
        }
    }

    pub(crate) fn get(&self, id: TextureId) -> Option<&T> {
        self.entries.get(id.index()).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, id: TextureId) -> Option<&mut T> {
        self.entries.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Removes and returns the value, or `None` if the slot is already
    /// vacant; removal is idempotent.
    pub(crate) fn remove(&mut self, id: TextureId) -> Option<T> {
        let slot = self.entries.get_mut(id.index())?;
        let value = slot.take()?;
        self.free.push(id.index());
        Some(value)
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.free.clear();
        self.entries.drain(..).flatten()
    }
}

/// A sampled image backing a paint: linear tiling, host-visible memory,
/// persistently mapped so updates are plain row copies.
pub(crate) struct Texture {
    image: vk::Image,
    memory: vk::DeviceMemory,
    pub(crate) view: vk::ImageView,
    pub(crate) sampler: vk::Sampler,
    width: u32,
    height: u32,
    row_pitch: usize,
    mapped: *mut u8,
}

impl Texture {
    pub(crate) fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Copies a sub-region row by row, honoring the device-reported row
    /// pitch, which may exceed `width * 4`.
    pub(crate) fn update(&mut self, x: u32, y: u32, width: u32, height: u32, data: &[u8]) {
        let x = x.min(self.width) as usize;
        let y = y.min(self.height) as usize;
        let width = (width as usize).min(self.width as usize - x);
        let height = (height as usize).min(self.height as usize - y);

        for row in 0..height {
            let src = &data[row * width * BYTES_PER_PIXEL..(row + 1) * width * BYTES_PER_PIXEL];
            unsafe {
                let dst = self
                    .mapped
                    .add((y + row) * self.row_pitch + x * BYTES_PER_PIXEL);
                std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
            }
        }
    }

    fn destroy(self, device: &ash::Device) {
        unsafe {
            device.destroy_sampler(self.sampler, None);
            device.destroy_image_view(self.view, None);
            device.destroy_image(self.image, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// Creates and destroys the 2D images, views and samplers backing paint
/// images. Texture creation is rare, so its one-shot layout transition may
/// block on the queue; nothing here runs on the per-frame draw path.
pub(crate) struct TextureManager {
    textures: Arena<Texture>,
}

impl TextureManager {
    pub(crate) fn new() -> Self {
        Self {
            textures: Arena::new(),
        }
    }

    pub(crate) fn create(
        &mut self,
        device: &ash::Device,
        memory_props: &vk::PhysicalDeviceMemoryProperties,
        queue: vk::Queue,
        command_pool: vk::CommandPool,
        width: u32,
        height: u32,
    ) -> Result<TextureId, RendererError> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk::Format::R8G8B8A8_UNORM)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::LINEAR)
            .usage(vk::ImageUsageFlags::SAMPLED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::PREINITIALIZED);
        let image = unsafe {
            device
                .create_image(&image_info, None)
                .map_err(RendererError::CreateImage)?
        };

        let requirements = unsafe { device.get_image_memory_requirements(image) };
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
                .bind_image_memory(image, memory, 0)
                .map_err(RendererError::BindImageMemory)?;
        }

        let subresource = vk::ImageSubresource {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            array_layer: 0,
        };
        let layout = unsafe { device.get_image_subresource_layout(image, subresource) };

        let mapped = unsafe {
            device
                .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                .map_err(RendererError::MapMemory)? as *mut u8
        };
        // Fresh textures sample as transparent black until data arrives.
        unsafe {
            std::ptr::write_bytes(
                mapped.add(layout.offset as usize),
                0,
                layout.row_pitch as usize * height as usize,
            );
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(vk::Format::R8G8B8A8_UNORM)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = unsafe {
            device
                .create_image_view(&view_info, None)
                .map_err(RendererError::CreateImageView)?
        };

        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE);
        let sampler = unsafe {
            device
                .create_sampler(&sampler_info, None)
                .map_err(RendererError::CreateSampler)?
        };

        transition_to_general(device, queue, command_pool, image)?;

        let id = self.textures.insert(Texture {
            image,
            memory,
            view,
            sampler,
            width,
            height,
            row_pitch: layout.row_pitch as usize,
            mapped: unsafe { mapped.add(layout.offset as usize) },
        });
        tracing::debug!(?id, width, height, "created texture");
        Ok(id)
    }

    pub(crate) fn get(&self, id: TextureId) -> Option<&Texture> {
        self.textures.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: TextureId) -> Option<&mut Texture> {
        self.textures.get_mut(id)
    }

    /// Idempotent: deleting a never-created or already-deleted handle is a
    /// no-op.
    pub(crate) fn delete(&mut self, device: &ash::Device, id: TextureId) {
        match self.textures.remove(id) {
            Some(texture) => {
                tracing::debug!(?id, "deleting texture");
                texture.destroy(device);
            }
            None => tracing::warn!(?id, "delete of unknown texture ignored"),
        }
    }

    pub(crate) fn destroy(&mut self, device: &ash::Device) {
        for texture in self.textures.drain() {
            texture.destroy(device);
        }
    }
}

/// Records and synchronously submits the layout transition that makes a
/// freshly written linear image shader-visible. `GENERAL` is kept for the
/// image's lifetime because the host continues to write through the mapping.
fn transition_to_general(
    device: &ash::Device,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    image: vk::Image,
) -> Result<(), RendererError> {
    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(command_pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let cmd = unsafe {
        device
            .allocate_command_buffers(&alloc_info)
            .map_err(RendererError::AllocateCommandBuffer)?[0]
    };

    let begin_info =
        vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    let barrier = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::HOST_WRITE)
        .dst_access_mask(vk::AccessFlags::SHADER_READ)
        .old_layout(vk::ImageLayout::PREINITIALIZED)
        .new_layout(vk::ImageLayout::GENERAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    unsafe {
        device
            .begin_command_buffer(cmd, &begin_info)
            .map_err(RendererError::BeginCommandBuffer)?;
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::HOST,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            std::slice::from_ref(&barrier),
        );
        device
            .end_command_buffer(cmd)
            .map_err(RendererError::EndCommandBuffer)?;

        let submit = vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&cmd));
        device
            .queue_submit(queue, std::slice::from_ref(&submit), vk::Fence::null())
            .map_err(RendererError::Submit)?;
        device.queue_wait_idle(queue).map_err(RendererError::WaitIdle)?;
        device.free_command_buffers(command_pool, std::slice::from_ref(&cmd));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::Arena;
    use crate::draw_list::TextureId;

    #[test]
    fn arena_reuses_freed_slots() {
        let mut arena: Arena<&str> = Arena::new();
        let first = arena.insert("a");
        let second = arena.insert("b");
        assert_ne!(first, second);

        arena.remove(first);
        let third = arena.insert("c");
        assert_eq!(third, first, "freed slot is reused");
        assert_eq!(arena.get(third), Some(&"c"));
        assert_eq!(arena.get(second), Some(&"b"));
    }

    #[test]
    fn arena_remove_is_idempotent() {
        let mut arena: Arena<u32> = Arena::new();
        let id = arena.insert(1);

        assert_eq!(arena.remove(id), Some(1));
        assert_eq!(arena.remove(id), None);
        assert_eq!(arena.get(id), None);
    }

    #[test]
    fn arena_tolerates_never_created_ids() {
        let mut arena: Arena<u32> = Arena::new();
        let bogus = TextureId::from_index(17);

        assert_eq!(arena.get(bogus), None);
        assert_eq!(arena.remove(bogus), None);
    }

    #[test]
    fn arena_drain_resets_the_free_list() {
        let mut arena: Arena<u32> = Arena::new();
        let id = arena.insert(1);
        arena.insert(2);
        arena.remove(id);

        let mut drained: Vec<u32> = arena.drain().collect();
        drained.sort_unstable();
        assert_eq!(drained, vec![2]);

        let fresh = arena.insert(3);
        assert_eq!(fresh.index(), 0);
    }
}
