//! Error type shared by every stage of a solver's life.

use std::path::PathBuf;

use ash::vk;
use thiserror::Error;

/// Everything that can go wrong while building or running a [`GramSchmidt`](crate::GramSchmidt).
#[derive(Debug, Error)]
pub enum GramSchmidtError {
    /// Vulkan loader, API version, or a requested debug layer/extension is missing.
    #[error("platform unsupported: {0}")]
    PlatformUnsupported(String),

    /// No f64-capable device has a free compute queue.
    #[error("no free compute queue: every f64-capable device is missing or fully reserved")]
    ResourceExhausted,

    /// Every host-visible, host-coherent memory type refused the allocation.
    #[error("device memory allocation of {size} bytes failed on every candidate memory type")]
    AllocationFailure { size: u64 },

    /// Command recording, queue submission, or fence wait failed during `run`.
    #[error("{operation} failed: {} ({}){}", .result, .result.as_raw(), hint(.result))]
    SubmissionFailure {
        operation: &'static str,
        result: vk::Result,
    },

    /// Any other Vulkan call that returned an error.
    #[error("{operation} failed: {} ({}){}", .result, .result.as_raw(), hint(.result))]
    Vulkan {
        operation: &'static str,
        result: vk::Result,
    },

    /// Kernel binary could not be read.
    #[error("cannot read kernel binary '{}'", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Kernel binary was read but cannot be used.
    #[error("invalid kernel binary: {0}")]
    InvalidKernel(String),

    /// A [`SolverConfig`](crate::SolverConfig) field is out of range.
    #[error("invalid solver configuration: {0}")]
    InvalidConfig(String),

    /// Row `row` has `len` entries instead of `expected`.
    #[error("matrix is not square: row {row} has {len} entries, expected {expected}")]
    NotSquare {
        row: usize,
        len: usize,
        expected: usize,
    },

    /// Matrix order exceeds what the device (or push constants) can address.
    #[error("matrix of order {n} does not fit in one storage buffer on this device")]
    TooLarge { n: usize },
}

impl GramSchmidtError {
    /// Wrap a failed Vulkan call made outside the dispatch loop.
    pub(crate) fn vulkan(operation: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |result| GramSchmidtError::Vulkan { operation, result }
    }

    /// Wrap a failed Vulkan call made by the dispatch loop.
    pub(crate) fn submission(operation: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |result| GramSchmidtError::SubmissionFailure { operation, result }
    }

    /// The underlying Vulkan status code, if any.
    pub fn vk_result(&self) -> Option<vk::Result> {
        match self {
            GramSchmidtError::SubmissionFailure { result, .. }
            | GramSchmidtError::Vulkan { result, .. } => Some(*result),
            _ => None,
        }
    }
}

fn hint(result: &vk::Result) -> &'static str {
    match *result {
        vk::Result::ERROR_DEVICE_LOST => " — GPU device lost, restart may be required",
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => " — GPU out of memory, reduce matrix order",
        vk::Result::ERROR_OUT_OF_HOST_MEMORY => " — host out of memory",
        vk::Result::TIMEOUT => " — fence wait timed out, raise the fence timeout",
        _ => "",
    }
}

pub type Result<T> = std::result::Result<T, GramSchmidtError>;
