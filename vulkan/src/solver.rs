//! The public solver: one reserved compute queue plus everything built on it.

use std::sync::Arc;

use crate::config::SolverConfig;
use crate::device::{DeviceInfo, Instance, LogicalDevice};
use crate::dispatch::{self, PassPlan};
use crate::error::{GramSchmidtError, Result};
use crate::kernel::KernelBinary;
use crate::ledger::{QueuePool, QueueSlot, Reservation};
use crate::memory::{matrix_order, Matrix, MatrixBuffer, Packing};
use crate::pipeline::ComputeResources;

/// Gram-Schmidt orthogonalization on a dedicated Vulkan compute queue.
///
/// Construction reserves one queue in a [`QueuePool`] and builds the pipeline
/// once; [`run`](Self::run) can then be called any number of times. Dropping
/// the solver destroys every device object and returns the queue.
pub struct GramSchmidt {
    // Field order is drop order: pipeline objects, device, instance, then
    // the ledger entry.
    resources: ComputeResources,
    device: LogicalDevice,
    _instance: Instance,
    reservation: Reservation,
    config: SolverConfig,
    info: DeviceInfo,
}

impl GramSchmidt {
    /// Build a solver reserving its queue in the process-wide pool.
    pub fn new(config: SolverConfig) -> Result<Self> {
        Self::with_pool(&QueuePool::shared(), config)
    }

    /// Build a solver reserving its queue in `pool`.
    ///
    /// The pool lock is held for the whole construction. Any failure unwinds
    /// the objects created so far, gives the queue back and releases the lock
    /// before the error is returned.
    pub fn with_pool(pool: &Arc<QueuePool>, config: SolverConfig) -> Result<Self> {
        config.validate()?;
        let kernel = KernelBinary::load(&config.kernel_path())?;

        let mut ledger = pool.lock();
        let instance = Instance::new(&config)?;
        let (physical, candidates) = instance.enumerate()?;
        let pending = ledger.reserve(&candidates)?;
        let selection = pending.selection().clone();

        let physical_device = physical[selection.slot.device_index as usize];
        let device = LogicalDevice::new(&instance, physical_device, selection.slot.family_index)?;
        let resources =
            ComputeResources::new(device.raw(), device.family_index(), &kernel, &config)?;

        let reservation = pending.commit(pool);
        drop(ledger);

        let info = device.info(selection.queue_count);
        tracing::info!(
            device = %info.name,
            device_type = %info.device_type,
            family = selection.slot.family_index,
            queues = selection.queue_count,
            debug = config.enable_debug,
            "gram-schmidt solver ready"
        );

        Ok(Self {
            resources,
            device,
            _instance: instance,
            reservation,
            config,
            info,
        })
    }

    /// Orthogonalize the vectors of `matrix` in place.
    ///
    /// Vectors are the rows of `matrix` for [`Packing::Rows`] and its columns
    /// for [`Packing::Columns`]; the result is packed the same way. Vector
    /// `k` of the result is vector `k` of the input minus its projections on
    /// result vectors `0..k` (not normalized). The input must be non-singular;
    /// this is not checked.
    pub fn run(&mut self, matrix: &mut Matrix, packing: Packing) -> Result<()> {
        let n = matrix_order(matrix)?;
        if n == 0 {
            return Ok(());
        }
        let order = u32::try_from(n).map_err(|_| GramSchmidtError::TooLarge { n })?;
        let bytes = MatrixBuffer::byte_size(n).ok_or(GramSchmidtError::TooLarge { n })?;
        if bytes > u64::from(self.device.max_storage_buffer_range()) {
            return Err(GramSchmidtError::TooLarge { n });
        }

        let start = std::time::Instant::now();
        let raw = self.device.raw();
        let mut buffer = MatrixBuffer::new(raw, self.device.memory_properties(), n)?;
        buffer.upload(matrix, packing)?;
        self.resources.bind_storage_buffer(buffer.buffer());

        let plan = PassPlan {
            order,
            workgroup_width: self.config.workgroup_width,
            fence_timeout_ns: self.config.fence_timeout_ns(),
        };
        dispatch::run_passes(raw, self.device.queue(), &self.resources, plan)?;

        buffer.download(matrix, packing)?;
        tracing::debug!(n, ?packing, elapsed = ?start.elapsed(), "run finished");
        Ok(())
    }

    /// [`run`](Self::run) with the packing given as a flag.
    pub fn run_with(&mut self, matrix: &mut Matrix, vectors_as_columns: bool) -> Result<()> {
        self.run(matrix, Packing::from_columns(vectors_as_columns))
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn queue_slot(&self) -> QueueSlot {
        self.reservation.slot()
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }
}

impl std::fmt::Debug for GramSchmidt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GramSchmidt")
            .field("device", &self.info.name)
            .field("slot", &self.reservation.slot())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::path::PathBuf;

    /// Where the reference kernel lives: build output, then VGS_KERNEL_DIR,
    /// then the source tree.
    fn kernel_dir() -> Option<PathBuf> {
        let candidates = [
            option_env!("VGS_BUILT_KERNEL_DIR").map(PathBuf::from),
            std::env::var_os("VGS_KERNEL_DIR").map(PathBuf::from),
            Some(PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../shaders")),
        ];
        candidates
            .into_iter()
            .flatten()
            .find(|dir| dir.join(crate::config::DEFAULT_KERNEL_FILE).exists())
    }

    /// A solver on its own pool, or `None` when no kernel or GPU is available.
    fn solver(pool: &Arc<QueuePool>) -> Option<GramSchmidt> {
        let dir = kernel_dir()?;
        match GramSchmidt::with_pool(pool, SolverConfig::new().kernel_dir(dir)) {
            Ok(s) => Some(s),
            Err(e) => {
                eprintln!("Skipping GPU test — {e}");
                None
            }
        }
    }

    fn dot(a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    fn columns(m: &Matrix) -> Matrix {
        (0..m.len()).map(|j| m.iter().map(|row| row[j]).collect()).collect()
    }

    /// Diagonally dominant, hence non-singular.
    fn test_matrix(n: usize) -> Matrix {
        (0..n)
            .map(|i| {
                (0..n)
                    .map(|j| if i == j { n as f64 + 1.0 } else { ((i * 7 + j * 3) % 5) as f64 * 0.1 })
                    .collect()
            })
            .collect()
    }

    fn assert_pairwise_orthogonal(vectors: &Matrix) {
        for i in 0..vectors.len() {
            for j in 0..i {
                let cos = dot(&vectors[i], &vectors[j])
                    / (dot(&vectors[i], &vectors[i]).sqrt() * dot(&vectors[j], &vectors[j]).sqrt());
                assert_abs_diff_eq!(cos, 0.0, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_two_by_two_rows() {
        let pool = QueuePool::new();
        let Some(mut gs) = solver(&pool) else { return };
        let mut m = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        gs.run(&mut m, Packing::Rows).unwrap();
        assert_abs_diff_eq!(m[0][0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(m[0][1], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(m[1][0], -0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(m[1][1], -0.4, epsilon = 1e-12);
    }

    #[test]
    fn test_two_by_two_columns() {
        let pool = QueuePool::new();
        let Some(mut gs) = solver(&pool) else { return };
        let mut m = vec![vec![1.0, 3.0], vec![2.0, 4.0]];
        gs.run_with(&mut m, true).unwrap();
        assert_abs_diff_eq!(m[0][0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(m[1][0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(m[0][1], -0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(m[1][1], -0.4, epsilon = 1e-12);
    }

    #[test]
    fn test_output_is_orthogonal_and_spans_input() {
        let pool = QueuePool::new();
        let Some(mut gs) = solver(&pool) else { return };
        // 70 > 2 * 32 exercises multi-group passes.
        for n in [3, 33, 70] {
            let original = test_matrix(n);
            let mut m = original.clone();
            gs.run(&mut m, Packing::Rows).unwrap();
            assert_pairwise_orthogonal(&m);
            // First vector is untouched; vector k differs from the input only by
            // components along earlier vectors, so its projection on the input
            // vector k equals its own squared norm.
            assert_eq!(m[0], original[0]);
            for k in 0..n {
                assert_abs_diff_eq!(
                    dot(&m[k], &original[k]) / dot(&m[k], &m[k]),
                    1.0,
                    epsilon = 1e-9
                );
            }
        }
    }

    #[test]
    fn test_columns_match_rows_of_transpose() {
        let pool = QueuePool::new();
        let Some(mut gs) = solver(&pool) else { return };
        let rows = test_matrix(5);
        let mut by_rows = rows.clone();
        let mut by_columns = columns(&rows);
        gs.run(&mut by_rows, Packing::Rows).unwrap();
        gs.run(&mut by_columns, Packing::Columns).unwrap();
        for (a, b) in by_rows.iter().flatten().zip(columns(&by_columns).iter().flatten()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_orthogonal_input_is_fixed_point() {
        let pool = QueuePool::new();
        let Some(mut gs) = solver(&pool) else { return };
        let mut m = test_matrix(6);
        gs.run(&mut m, Packing::Rows).unwrap();
        let once = m.clone();
        gs.run(&mut m, Packing::Rows).unwrap();
        for (row_once, row_twice) in once.iter().zip(&m) {
            let norm = dot(row_once, row_once).sqrt();
            for (a, b) in row_once.iter().zip(row_twice) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-12 * norm.max(1.0));
            }
        }
    }

    #[test]
    fn test_single_vector_unchanged() {
        let pool = QueuePool::new();
        let Some(mut gs) = solver(&pool) else { return };
        let mut m = vec![vec![-2.5]];
        gs.run(&mut m, Packing::Rows).unwrap();
        assert_eq!(m, vec![vec![-2.5]]);
    }

    #[test]
    fn test_empty_and_ragged_input() {
        let pool = QueuePool::new();
        let Some(mut gs) = solver(&pool) else { return };
        let mut empty: Matrix = Vec::new();
        gs.run(&mut empty, Packing::Rows).unwrap();

        let mut ragged = vec![vec![1.0, 2.0], vec![3.0]];
        assert!(matches!(
            gs.run(&mut ragged, Packing::Rows),
            Err(GramSchmidtError::NotSquare { row: 1, .. })
        ));
        assert_eq!(ragged, vec![vec![1.0, 2.0], vec![3.0]]);
    }

    #[test]
    fn test_reservation_follows_solver_lifetime() {
        let pool = QueuePool::new();
        let Some(gs) = solver(&pool) else { return };
        let slot = gs.queue_slot();
        assert_eq!(pool.reserved(slot), 1);
        assert_eq!(gs.device_info().queue_family_index, slot.family_index);
        drop(gs);
        assert_eq!(pool.total_reserved(), 0);
    }

    #[test]
    fn test_concurrent_construction() {
        let pool = QueuePool::new();
        let Some(probe) = solver(&pool) else { return };
        let capacity = probe.device_info().family_queue_count.min(4) as usize;
        drop(probe);

        let handles: Vec<_> = (0..capacity)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || solver(&pool))
            })
            .collect();
        let solvers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(solvers.iter().all(Option::is_some));
        assert_eq!(pool.total_reserved(), capacity as u32);
        drop(solvers);
        assert_eq!(pool.total_reserved(), 0);
    }

    #[test]
    fn test_fence_timeout_aborts_run_and_solver_recovers() {
        let pool = QueuePool::new();
        let Some(dir) = kernel_dir() else { return };
        let config = SolverConfig::new()
            .kernel_dir(dir)
            .fence_timeout(std::time::Duration::from_nanos(1));
        let mut gs = match GramSchmidt::with_pool(&pool, config) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("Skipping GPU test — {e}");
                return;
            }
        };

        let mut m = test_matrix(256);
        match gs.run(&mut m, Packing::Rows) {
            // A fast device may finish every pass inside 1 ns.
            Ok(()) => {}
            Err(err) => {
                assert!(
                    matches!(
                        err,
                        GramSchmidtError::SubmissionFailure { result: ash::vk::Result::TIMEOUT, .. }
                    ),
                    "{err}"
                );
                assert_eq!(err.vk_result(), Some(ash::vk::Result::TIMEOUT));

                // Device was drained and the fence reset; the solver is still usable.
                let mut small = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
                match gs.run(&mut small, Packing::Rows) {
                    Ok(()) => assert_abs_diff_eq!(small[1][0], -0.2, epsilon = 1e-12),
                    Err(e) => assert_eq!(e.vk_result(), Some(ash::vk::Result::TIMEOUT), "{e}"),
                }
            }
        }

        assert_eq!(pool.total_reserved(), 1);
        drop(gs);
        assert_eq!(pool.total_reserved(), 0);
    }

    #[test]
    fn test_missing_kernel_leaves_ledger_clean() {
        let pool = QueuePool::new();
        let dir = tempfile::tempdir().unwrap();
        let err = GramSchmidt::with_pool(&pool, SolverConfig::new().kernel_dir(dir.path())).unwrap_err();
        assert!(matches!(err, GramSchmidtError::Io { .. }));
        assert_eq!(pool.total_reserved(), 0);
        // Lock was not left held.
        drop(pool.lock());
    }

    #[test]
    fn test_invalid_config_rejected_before_device_work() {
        let pool = QueuePool::new();
        let err = GramSchmidt::with_pool(&pool, SolverConfig::new().workgroup_width(0)).unwrap_err();
        assert!(matches!(err, GramSchmidtError::InvalidConfig(_)));
    }
}
