//! Buffer allocation, memory type selection, and host ↔ device transfers.

use std::ffi::c_void;

use ash::vk;

use crate::error::{GramSchmidtError, Result};

/// A square matrix of `f64`, one inner `Vec` per row.
pub type Matrix = Vec<Vec<f64>>;

/// Whether a [`Matrix`] stores its vectors as rows or as columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Packing {
    #[default]
    Rows,
    Columns,
}

impl Packing {
    pub fn from_columns(vectors_as_columns: bool) -> Self {
        if vectors_as_columns {
            Packing::Columns
        } else {
            Packing::Rows
        }
    }
}

/// Order of `matrix`, or `NotSquare` naming the first bad row.
pub fn matrix_order(matrix: &Matrix) -> Result<usize> {
    let n = matrix.len();
    match matrix.iter().position(|row| row.len() != n) {
        Some(row) => Err(GramSchmidtError::NotSquare {
            row,
            len: matrix[row].len(),
            expected: n,
        }),
        None => Ok(n),
    }
}

/// Write `matrix` into `flat` in row-major vector order.
///
/// With [`Packing::Columns`] column `i` becomes flat vector `i`.
pub fn pack(matrix: &Matrix, packing: Packing, flat: &mut [f64]) {
    let n = matrix.len();
    debug_assert_eq!(flat.len(), n * n, "flat buffer does not match matrix order");
    for i in 0..n {
        for j in 0..n {
            flat[i * n + j] = match packing {
                Packing::Rows => matrix[i][j],
                Packing::Columns => matrix[j][i],
            };
        }
    }
}

/// Inverse of [`pack`].
pub fn unpack(flat: &[f64], packing: Packing, matrix: &mut Matrix) {
    let n = matrix.len();
    debug_assert_eq!(flat.len(), n * n, "flat buffer does not match matrix order");
    for i in 0..n {
        for j in 0..n {
            let value = flat[i * n + j];
            match packing {
                Packing::Rows => matrix[i][j] = value,
                Packing::Columns => matrix[j][i] = value,
            }
        }
    }
}

/// Indices of memory types allowed by `type_filter` that carry every bit of
/// `required`, in driver order.
pub(crate) fn memory_type_candidates(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    required: vk::MemoryPropertyFlags,
) -> impl Iterator<Item = u32> + '_ {
    (0..properties.memory_type_count).filter(move |&i| {
        (type_filter & (1 << i)) != 0
            && properties.memory_types[i as usize].property_flags.contains(required)
    })
}

/// Host-visible, host-coherent storage buffer holding one n×n matrix.
///
/// Lives for a single `run`; destroyed and freed on drop.
pub(crate) struct MatrixBuffer<'d> {
    device: &'d ash::Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    order: usize,
}

impl<'d> MatrixBuffer<'d> {
    /// Size in bytes of an n×n `f64` matrix.
    pub(crate) fn byte_size(order: usize) -> Option<vk::DeviceSize> {
        order
            .checked_mul(order)?
            .checked_mul(std::mem::size_of::<f64>())
            .and_then(|bytes| vk::DeviceSize::try_from(bytes).ok())
    }

    pub(crate) fn new(
        device: &'d ash::Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        order: usize,
    ) -> Result<Self> {
        let size = Self::byte_size(order).ok_or(GramSchmidtError::TooLarge { n: order })?;

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk::BufferUsageFlags::STORAGE_BUFFER)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&buffer_info, None) }
            .map_err(GramSchmidtError::vulkan("vkCreateBuffer"))?;

        // From here on the guard owns the buffer, so early returns clean up.
        let mut owned = Self {
            device,
            buffer,
            memory: vk::DeviceMemory::null(),
            order,
        };

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let required = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        for type_index in
            memory_type_candidates(memory_properties, requirements.memory_type_bits, required)
        {
            let alloc_info = vk::MemoryAllocateInfo::default()
                .allocation_size(requirements.size)
                .memory_type_index(type_index);
            match unsafe { device.allocate_memory(&alloc_info, None) } {
                Ok(memory) => {
                    owned.memory = memory;
                    break;
                }
                Err(result) => {
                    tracing::warn!(type_index, %result, size = requirements.size, "memory type refused allocation, trying next");
                }
            }
        }
        if owned.memory == vk::DeviceMemory::null() {
            return Err(GramSchmidtError::AllocationFailure { size: requirements.size });
        }

        unsafe { device.bind_buffer_memory(buffer, owned.memory, 0) }
            .map_err(GramSchmidtError::vulkan("vkBindBufferMemory"))?;

        Ok(owned)
    }

    pub(crate) fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    /// Map the whole matrix for host access until the guard drops.
    pub(crate) fn map(&mut self) -> Result<MappedMemory<'_>> {
        let len = self.order * self.order;
        let ptr = unsafe {
            self.device.map_memory(
                self.memory,
                0,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
            )
        }
        .map_err(GramSchmidtError::vulkan("vkMapMemory"))?;
        Ok(MappedMemory {
            device: self.device,
            memory: self.memory,
            ptr,
            len,
        })
    }

    /// Copy `matrix` into the buffer: one map, one write, one unmap.
    pub(crate) fn upload(&mut self, matrix: &Matrix, packing: Packing) -> Result<()> {
        debug_assert_eq!(matrix.len(), self.order);
        let mut mapped = self.map()?;
        pack(matrix, packing, mapped.as_mut_slice());
        Ok(())
    }

    /// Copy the buffer back into `matrix`: one map, one read, one unmap.
    pub(crate) fn download(&mut self, matrix: &mut Matrix, packing: Packing) -> Result<()> {
        debug_assert_eq!(matrix.len(), self.order);
        let mapped = self.map()?;
        unpack(mapped.as_slice(), packing, matrix);
        Ok(())
    }
}

impl Drop for MatrixBuffer<'_> {
    fn drop(&mut self) {
        unsafe {
            if self.buffer != vk::Buffer::null() {
                self.device.destroy_buffer(self.buffer, None);
            }
            if self.memory != vk::DeviceMemory::null() {
                self.device.free_memory(self.memory, None);
            }
        }
    }
}

/// A mapped view of a [`MatrixBuffer`]. Unmapped on drop.
pub(crate) struct MappedMemory<'a> {
    device: &'a ash::Device,
    memory: vk::DeviceMemory,
    ptr: *mut c_void,
    len: usize,
}

impl MappedMemory<'_> {
    pub(crate) fn as_slice(&self) -> &[f64] {
        // Mapping offsets are aligned to minMemoryMapAlignment (>= 64 bytes).
        unsafe { std::slice::from_raw_parts(self.ptr as *const f64, self.len) }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [f64] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr as *mut f64, self.len) }
    }
}

impl Drop for MappedMemory<'_> {
    fn drop(&mut self) {
        unsafe { self.device.unmap_memory(self.memory) };
    }
}
