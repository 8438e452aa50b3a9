use ash::vk;

use crate::error::RendererError;

/// Per-frame-slot deferred destruction. Retiring an object parks it under
/// the slot that was being recorded when it was superseded; by the time that
/// slot is reused, one full frame cycle has elapsed and the GPU has retired
/// every reference, so draining at the start of the frame is safe.
pub(crate) struct RetireQueue<T> {
    slots: Vec<Vec<T>>,
}

impl<T> RetireQueue<T> {
    pub(crate) fn new(frames_in_flight: usize) -> Self {
        Self {
            slots: (0..frames_in_flight).map(|_| Vec::new()).collect(),
        }
    }

    pub(crate) fn retire(&mut self, slot: usize, item: T) {
        self.slots[slot].push(item);
    }

    pub(crate) fn drain(&mut self, slot: usize) -> Vec<T> {
        std::mem::take(&mut self.slots[slot])
    }

    pub(crate) fn drain_all(&mut self) -> Vec<T> {
        self.slots.iter_mut().flat_map(std::mem::take).collect()
    }
}

/// The two texture/sampler sets a call binds: one for its primary paint, one
/// for its secondary paint.
#[derive(Copy, Clone)]
pub(crate) struct CallSets {
    pub(crate) primary: vk::DescriptorSet,
    pub(crate) secondary: vk::DescriptorSet,
}

struct PoolGeneration {
    pool: vk::DescriptorPool,
    /// Maximum call count this generation's sets cover.
    capacity: usize,
    /// One storage-buffer set per frame in flight.
    storage_sets: Vec<vk::DescriptorSet>,
    /// Two image sets per call per frame in flight.
    call_sets: Vec<Vec<CallSets>>,
}

/// Owns the descriptor pool sized for the current maximum call count.
///
/// When a frame brings more calls than the pool covers, a whole new
/// generation (pool plus sets) replaces it and the superseded pool is parked
/// in the retire queue until its frame slot cycles back around. Sets are
/// rewritten every frame before use, so a fresh generation never serves
/// stale bindings.
pub(crate) struct DescriptorAllocator {
    frames_in_flight: usize,
    storage_layout: vk::DescriptorSetLayout,
    image_layout: vk::DescriptorSetLayout,
    current: Option<PoolGeneration>,
    retired: RetireQueue<vk::DescriptorPool>,
}

impl DescriptorAllocator {
    pub(crate) fn new(
        frames_in_flight: usize,
        storage_layout: vk::DescriptorSetLayout,
        image_layout: vk::DescriptorSetLayout,
    ) -> Self {
        Self {
            frames_in_flight,
            storage_layout,
            image_layout,
            current: None,
            retired: RetireQueue::new(frames_in_flight),
        }
    }

    /// Destroys pools whose frame slot is about to be reused. Must run at
    /// the start of every frame, before any descriptor write for the slot.
    pub(crate) fn before_render(&mut self, device: &ash::Device, slot: usize) {
        for pool in self.retired.drain(slot) {
            tracing::debug!(slot, "destroying retired descriptor pool");
            unsafe {
                device.destroy_descriptor_pool(pool, None);
            }
        }
    }

    /// Makes sure the current generation covers `call_count` calls, growing
    /// (replacing) the pool if it does not. `current_slot` is the frame slot
    /// being recorded; a superseded pool is parked under it.
    pub(crate) fn ensure_capacity(
        &mut self,
        device: &ash::Device,
        call_count: usize,
        current_slot: usize,
    ) -> Result<(), RendererError> {
        if let Some(current) = &self.current {
            if current.capacity >= call_count {
                return Ok(());
            }
        }

        let generation = self.create_generation(device, call_count)?;
        if let Some(old) = self.current.replace(generation) {
            tracing::debug!(
                old_capacity = old.capacity,
                new_capacity = call_count,
                slot = current_slot,
                "descriptor pool regrown, retiring superseded pool"
            );
            self.retired.retire(current_slot, old.pool);
        }
        Ok(())
    }

    fn create_generation(
        &self,
        device: &ash::Device,
        call_count: usize,
    ) -> Result<PoolGeneration, RendererError> {
        let frames = self.frames_in_flight;
        let image_sets = (frames * call_count * 2) as u32;

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: image_sets,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: image_sets,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: frames as u32,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(image_sets + frames as u32)
            .pool_sizes(&pool_sizes);
        let pool = unsafe {
            device
                .create_descriptor_pool(&pool_info, None)
                .map_err(RendererError::CreateDescriptorPool)?
        };

        let storage_layouts = vec![self.storage_layout; frames];
        let storage_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&storage_layouts);
        let storage_sets = unsafe {
            device
                .allocate_descriptor_sets(&storage_info)
                .map_err(RendererError::AllocateDescriptorSets)?
        };

        let mut call_sets = Vec::with_capacity(frames);
        if call_count > 0 {
            let image_layouts = vec![self.image_layout; frames * call_count * 2];
            let image_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(pool)
                .set_layouts(&image_layouts);
            let flat = unsafe {
                device
                    .allocate_descriptor_sets(&image_info)
                    .map_err(RendererError::AllocateDescriptorSets)?
            };
            for frame in 0..frames {
                let base = frame * call_count * 2;
                call_sets.push(
                    (0..call_count)
                        .map(|call| CallSets {
                            primary: flat[base + call * 2],
                            secondary: flat[base + call * 2 + 1],
                        })
                        .collect(),
                );
            }
        } else {
            call_sets.resize_with(frames, Vec::new);
        }

        Ok(PoolGeneration {
            pool,
            capacity: call_count,
            storage_sets,
            call_sets,
        })
    }

    pub(crate) fn storage_set(&self, frame: usize) -> vk::DescriptorSet {
        let current = self.current.as_ref().expect("no pool generation");
        current.storage_sets[frame]
    }

    pub(crate) fn call_sets(&self, frame: usize, call: usize) -> CallSets {
        let current = self.current.as_ref().expect("no pool generation");
        current.call_sets[frame][call]
    }

    /// Points the frame's storage-buffer set at the (possibly regrown)
    /// uniform buffer. Rewritten every frame, since a buffer resize leaves
    /// the previous binding stale.
    pub(crate) fn write_storage_buffer(
        &self,
        device: &ash::Device,
        frame: usize,
        buffer: vk::Buffer,
    ) {
        let buffer_info = vk::DescriptorBufferInfo {
            buffer,
            offset: 0,
            range: vk::WHOLE_SIZE,
        };
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.storage_set(frame))
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(std::slice::from_ref(&buffer_info));
        unsafe {
            device.update_descriptor_sets(std::slice::from_ref(&write), &[]);
        }
    }

    /// Binds a texture and its sampler into one image set. The caller has
    /// already normalized a missing paint image to the fallback texture, so
    /// a set is never left pointing at nothing.
    pub(crate) fn write_image(
        &self,
        device: &ash::Device,
        set: vk::DescriptorSet,
        view: vk::ImageView,
        sampler: vk::Sampler,
    ) {
        let image_info = vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: view,
            image_layout: vk::ImageLayout::GENERAL,
        };
        let sampler_info = vk::DescriptorImageInfo {
            sampler,
            image_view: vk::ImageView::null(),
            image_layout: vk::ImageLayout::UNDEFINED,
        };
        let writes = [
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .image_info(std::slice::from_ref(&image_info)),
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .image_info(std::slice::from_ref(&sampler_info)),
        ];
        unsafe {
            device.update_descriptor_sets(&writes, &[]);
        }
    }

    pub(crate) fn destroy(&mut self, device: &ash::Device) {
        for pool in self.retired.drain_all() {
            unsafe {
                device.destroy_descriptor_pool(pool, None);
            }
        }
        if let Some(generation) = self.current.take() {
            unsafe {
                device.destroy_descriptor_pool(generation.pool, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RetireQueue;

    #[test]
    fn retired_items_surface_only_when_their_slot_is_reused() {
        let mut queue: RetireQueue<u32> = RetireQueue::new(2);
        queue.retire(0, 7);

        assert!(queue.drain(1).is_empty());
        assert_eq!(queue.drain(0), vec![7]);
        assert!(queue.drain(0).is_empty());
    }

    /// The capacity-growth scenario: call counts [4, 4, 10, 10] across four
    /// frames with two frames in flight. The first pool must be destroyed
    /// exactly at the fifth before_render, one full cycle after the regrow.
    #[test]
    fn pool_is_destroyed_one_full_cycle_after_regrowth() {
        let frames_in_flight = 2;
        let mut queue: RetireQueue<&str> = RetireQueue::new(frames_in_flight);
        let mut capacity = 0usize;
        let mut generations = 0usize;
        let mut destroyed: Vec<(usize, &str)> = Vec::new();

        for (frame, call_count) in [4usize, 4, 10, 10].iter().enumerate() {
            let slot = frame % frames_in_flight;
            // before_render for this frame
            for item in queue.drain(slot) {
                destroyed.push((frame + 1, item));
            }
            // draw: grow if needed
            if *call_count > capacity {
                generations += 1;
                if capacity > 0 {
                    queue.retire(slot, "first pool");
                }
                capacity = *call_count;
            }
        }
        // Fifth frame revisits the slot the regrow happened in.
        let fifth_slot = 4 % frames_in_flight;
        for item in queue.drain(fifth_slot) {
            destroyed.push((5, item));
        }

        assert_eq!(generations, 2, "created once, regrown once");
        assert!(capacity >= 10);
        assert_eq!(destroyed, vec![(5, "first pool")]);
    }

    #[test]
    fn drain_all_empties_every_slot() {
        let mut queue: RetireQueue<u32> = RetireQueue::new(3);
        queue.retire(0, 1);
        queue.retire(1, 2);
        queue.retire(2, 3);

        let mut all = queue.drain_all();
        all.sort_unstable();
        assert_eq!(all, vec![1, 2, 3]);
        assert!(queue.drain(0).is_empty());
    }
}
