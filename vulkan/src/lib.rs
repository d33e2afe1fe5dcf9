//! Gram-Schmidt orthogonalization on a Vulkan compute queue.
//!
//! Provides [`GramSchmidt`], which reserves one compute queue in a shared
//! [`QueuePool`], builds the kernel pipeline once, and orthogonalizes square
//! `f64` matrices pass by pass on the GPU.
//!
//! ```no_run
//! use vgs_vulkan::{GramSchmidt, Packing, SolverConfig};
//!
//! let mut solver = GramSchmidt::new(SolverConfig::from_env())?;
//! let mut m = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
//! solver.run(&mut m, Packing::Rows)?;
//! // m == [[1.0, 2.0], [-0.2, -0.4]] up to rounding
//! # Ok::<(), vgs_vulkan::GramSchmidtError>(())
//! ```

pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod kernel;
pub mod ledger;
pub mod memory;
pub mod pipeline;
pub mod solver;
mod debug;

pub use config::SolverConfig;
pub use device::{select_queue_family, DeviceCandidate, DeviceInfo, QueueFamily, QueueSelection};
pub use error::{GramSchmidtError, Result};
pub use kernel::KernelBinary;
pub use ledger::{Ledger, PendingReservation, QueuePool, QueueSlot, Reservation};
pub use memory::{pack, unpack, Matrix, Packing};
pub use pipeline::PushConstants;
pub use solver::GramSchmidt;
