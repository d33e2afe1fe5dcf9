//! Pass-by-pass dispatch of the orthogonalization kernel.
//!
//! Pass `k` makes every vector after `k` orthogonal to vector `k`. Each pass
//! reads what the previous one wrote, so passes are submitted one at a time
//! and the host waits on the fence in between.

use ash::vk;

use crate::error::{GramSchmidtError, Result};
use crate::pipeline::{ComputeResources, PushConstants};

/// Work-groups needed to cover vectors `pivot..order` with `width` lanes each.
pub fn workgroup_count(order: u32, pivot: u32, width: u32) -> u32 {
    (order - pivot).div_ceil(width)
}

/// What one pass needs besides the long-lived resources.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PassPlan {
    pub(crate) order: u32,
    pub(crate) workgroup_width: u32,
    pub(crate) fence_timeout_ns: u64,
}

impl PassPlan {
    pub(crate) fn push_constants(&self, pivot: u32) -> PushConstants {
        PushConstants {
            dimension: self.order,
            vector_count: self.order,
            pivot_index: pivot,
        }
    }
}

/// Run all `order` passes on `queue`. The storage buffer must already be
/// bound to the descriptor set and hold the uploaded matrix.
pub(crate) fn run_passes(
    device: &ash::Device,
    queue: vk::Queue,
    res: &ComputeResources,
    plan: PassPlan,
) -> Result<()> {
    for pivot in 0..plan.order {
        let pass = record_pass(device, res, &plan, pivot)
            .and_then(|()| submit_and_wait(device, queue, res, plan.fence_timeout_ns));
        if let Err(err) = pass {
            tracing::error!(pivot, order = plan.order, %err, "pass failed, aborting run");
            settle(device, res);
            return Err(err);
        }
        tracing::trace!(pivot, groups = workgroup_count(plan.order, pivot, plan.workgroup_width), "pass done");
    }
    Ok(())
}

/// Drain the device after a failed pass so the buffer can be freed and the
/// fence reused by the next run.
fn settle(device: &ash::Device, res: &ComputeResources) {
    unsafe {
        let _ = device.device_wait_idle();
        let _ = device.reset_fences(&[res.fence]);
    }
}

fn record_pass(
    device: &ash::Device,
    res: &ComputeResources,
    plan: &PassPlan,
    pivot: u32,
) -> Result<()> {
    let cmd = res.command_buffer;
    let begin_info =
        vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

    unsafe {
        device
            .begin_command_buffer(cmd, &begin_info)
            .map_err(GramSchmidtError::submission("vkBeginCommandBuffer"))?;

        // Previous pass's writes must be visible to this one.
        if pivot > 0 {
            let barrier = vk::MemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::SHADER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE);
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }

        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, res.pipeline);
        device.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::COMPUTE,
            res.pipeline_layout,
            0,
            &[res.descriptor_set],
            &[],
        );
        let push = plan.push_constants(pivot);
        device.cmd_push_constants(
            cmd,
            res.pipeline_layout,
            vk::ShaderStageFlags::COMPUTE,
            0,
            bytemuck::bytes_of(&push),
        );
        device.cmd_dispatch(cmd, workgroup_count(plan.order, pivot, plan.workgroup_width), 1, 1);

        // Last pass: make results visible to the host read-back.
        if pivot + 1 == plan.order {
            let barrier = vk::MemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::SHADER_WRITE)
                .dst_access_mask(vk::AccessFlags::HOST_READ);
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }

        device
            .end_command_buffer(cmd)
            .map_err(GramSchmidtError::submission("vkEndCommandBuffer"))?;
    }
    Ok(())
}

fn submit_and_wait(
    device: &ash::Device,
    queue: vk::Queue,
    res: &ComputeResources,
    timeout_ns: u64,
) -> Result<()> {
    let command_buffers = [res.command_buffer];
    let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
    let fences = [res.fence];

    unsafe {
        device
            .queue_submit(queue, &[submit_info], res.fence)
            .map_err(GramSchmidtError::submission("vkQueueSubmit"))?;
        device
            .wait_for_fences(&fences, true, timeout_ns)
            .map_err(GramSchmidtError::submission("vkWaitForFences"))?;
        device
            .reset_fences(&fences)
            .map_err(GramSchmidtError::submission("vkResetFences"))?;
    }
    Ok(())
}
