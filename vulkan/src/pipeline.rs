//! Long-lived per-solver device objects: kernel module, layouts, pipeline,
//! command buffer, descriptor set, fence.
//!
//! [`ComputeResources`] starts with every handle null and is filled in
//! creation order. Drop destroys whatever is non-null in reverse order, so a
//! failure halfway through [`ComputeResources::new`] unwinds exactly the
//! steps that succeeded.

use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::config::SolverConfig;
use crate::error::{GramSchmidtError, Result};
use crate::kernel::KernelBinary;

/// Push-constant block read by the kernel each pass.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct PushConstants {
    /// Length of every vector.
    pub dimension: u32,
    /// Number of vectors in the buffer.
    pub vector_count: u32,
    /// Vector the later ones are orthogonalized against this pass.
    pub pivot_index: u32,
}

pub const PUSH_CONSTANT_SIZE: u32 = std::mem::size_of::<PushConstants>() as u32;

pub(crate) struct ComputeResources {
    device: ash::Device,
    pub(crate) shader_module: vk::ShaderModule,
    pub(crate) descriptor_set_layout: vk::DescriptorSetLayout,
    pub(crate) pipeline_layout: vk::PipelineLayout,
    pub(crate) pipeline: vk::Pipeline,
    pub(crate) command_pool: vk::CommandPool,
    pub(crate) command_buffer: vk::CommandBuffer,
    pub(crate) descriptor_pool: vk::DescriptorPool,
    pub(crate) descriptor_set: vk::DescriptorSet,
    pub(crate) fence: vk::Fence,
}

impl ComputeResources {
    fn empty(device: &ash::Device) -> Self {
        Self {
            device: device.clone(),
            shader_module: vk::ShaderModule::null(),
            descriptor_set_layout: vk::DescriptorSetLayout::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            command_pool: vk::CommandPool::null(),
            command_buffer: vk::CommandBuffer::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_set: vk::DescriptorSet::null(),
            fence: vk::Fence::null(),
        }
    }

    /// Build everything a dispatch needs, in dependency order.
    pub(crate) fn new(
        device: &ash::Device,
        queue_family_index: u32,
        kernel: &KernelBinary,
        config: &SolverConfig,
    ) -> Result<Self> {
        let mut res = Self::empty(device);
        let entry_point = config.entry_point_cstr()?;

        // --- Kernel module ---
        let module_info = vk::ShaderModuleCreateInfo::default().code(kernel.words());
        res.shader_module = unsafe { device.create_shader_module(&module_info, None) }
            .map_err(GramSchmidtError::vulkan("vkCreateShaderModule"))?;

        // --- Descriptor set layout (one storage buffer at binding 0) ---
        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::COMPUTE)];
        let ds_layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        res.descriptor_set_layout =
            unsafe { device.create_descriptor_set_layout(&ds_layout_info, None) }
                .map_err(GramSchmidtError::vulkan("vkCreateDescriptorSetLayout"))?;

        // --- Pipeline layout (12-byte push-constant range) ---
        let set_layouts = [res.descriptor_set_layout];
        let pc_ranges = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(PUSH_CONSTANT_SIZE)];
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&pc_ranges);
        res.pipeline_layout = unsafe { device.create_pipeline_layout(&pipeline_layout_info, None) }
            .map_err(GramSchmidtError::vulkan("vkCreatePipelineLayout"))?;

        // --- Compute pipeline ---
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(res.shader_module)
            .name(&entry_point);
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(res.pipeline_layout);
        let pipelines = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, result)| GramSchmidtError::Vulkan {
            operation: "vkCreateComputePipelines",
            result,
        })?;
        res.pipeline = pipelines[0];

        // --- Command pool and buffer ---
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        res.command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(GramSchmidtError::vulkan("vkCreateCommandPool"))?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(res.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        res.command_buffer = unsafe { device.allocate_command_buffers(&alloc_info) }
            .map_err(GramSchmidtError::vulkan("vkAllocateCommandBuffers"))?[0];

        // --- Descriptor pool and set ---
        let pool_sizes = [vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(1)];
        let dp_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        res.descriptor_pool = unsafe { device.create_descriptor_pool(&dp_info, None) }
            .map_err(GramSchmidtError::vulkan("vkCreateDescriptorPool"))?;

        let set_alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(res.descriptor_pool)
            .set_layouts(&set_layouts);
        res.descriptor_set = unsafe { device.allocate_descriptor_sets(&set_alloc_info) }
            .map_err(GramSchmidtError::vulkan("vkAllocateDescriptorSets"))?[0];

        // --- Fence (unsignaled) ---
        res.fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) }
            .map_err(GramSchmidtError::vulkan("vkCreateFence"))?;

        tracing::debug!(
            kernel_bytes = kernel.byte_len(),
            entry_point = %config.entry_point,
            "compute pipeline ready"
        );
        Ok(res)
    }

    /// Point binding 0 at `buffer` for the next dispatches.
    pub(crate) fn bind_storage_buffer(&self, buffer: vk::Buffer) {
        let buffer_infos = [vk::DescriptorBufferInfo::default()
            .buffer(buffer)
            .offset(0)
            .range(vk::WHOLE_SIZE)];
        let writes = [vk::WriteDescriptorSet::default()
            .dst_set(self.descriptor_set)
            .dst_binding(0)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(&buffer_infos)];
        unsafe { self.device.update_descriptor_sets(&writes, &[]) };
    }
}

impl Drop for ComputeResources {
    fn drop(&mut self) {
        let device = &self.device;
        unsafe {
            let _ = device.device_wait_idle();

            if self.fence != vk::Fence::null() {
                device.destroy_fence(self.fence, None);
            }
            if self.descriptor_set != vk::DescriptorSet::null() {
                let _ = device.free_descriptor_sets(self.descriptor_pool, &[self.descriptor_set]);
            }
            if self.descriptor_pool != vk::DescriptorPool::null() {
                device.destroy_descriptor_pool(self.descriptor_pool, None);
            }
            if self.command_buffer != vk::CommandBuffer::null() {
                device.free_command_buffers(self.command_pool, &[self.command_buffer]);
            }
            if self.command_pool != vk::CommandPool::null() {
                device.destroy_command_pool(self.command_pool, None);
            }
            if self.pipeline != vk::Pipeline::null() {
                device.destroy_pipeline(self.pipeline, None);
            }
            if self.pipeline_layout != vk::PipelineLayout::null() {
                device.destroy_pipeline_layout(self.pipeline_layout, None);
            }
            if self.descriptor_set_layout != vk::DescriptorSetLayout::null() {
                device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
            }
            if self.shader_module != vk::ShaderModule::null() {
                device.destroy_shader_module(self.shader_module, None);
            }
        }
    }
}
