//! vgs-bench: run the Vulkan Gram-Schmidt solver from the command line.
//!
//! Without arguments it orthogonalizes a fixed 2×2 example and prints it.
//! `--size N` switches to timing random N×N matrices.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

use vgs_vulkan::{GramSchmidt, Matrix, Packing, QueuePool, SolverConfig};

#[derive(Parser)]
#[command(name = "vgs-bench", about = "Gram-Schmidt orthogonalization on a Vulkan compute queue")]
struct Cli {
    /// Orthogonalize a random N×N matrix instead of the built-in example
    #[arg(short = 'n', long)]
    size: Option<usize>,
    /// Seed for the random matrix
    #[arg(long, default_value = "1")]
    seed: u64,
    /// Number of timed runs
    #[arg(short, long, default_value = "1")]
    repeat: u32,
    /// Treat columns rather than rows as the vectors
    #[arg(long)]
    columns: bool,
    /// Enable the Khronos validation layer
    #[arg(long)]
    debug: bool,
    /// Directory holding gram_schmidt.spv
    #[arg(long)]
    kernel_dir: Option<PathBuf>,
    /// Construct K solvers concurrently on one queue pool and report how many got a queue
    #[arg(long)]
    instances: Option<usize>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("ERROR! {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = SolverConfig::from_env();
    if cli.debug {
        config = config.debug(true);
    }
    if let Some(dir) = &cli.kernel_dir {
        config = config.kernel_dir(dir);
    }
    let packing = Packing::from_columns(cli.columns);

    if let Some(k) = cli.instances {
        return cmd_instances(k, config);
    }
    match cli.size {
        None => cmd_example(config, packing),
        Some(n) => cmd_bench(n, cli.seed, cli.repeat, config, packing),
    }
}

fn cmd_example(config: SolverConfig, packing: Packing) -> Result<()> {
    let mut solver = GramSchmidt::new(config)?;
    let mut m = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
    solver.run(&mut m, packing)?;
    for row in &m {
        let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        println!("{}", cells.join("\t"));
    }
    Ok(())
}

fn cmd_bench(n: usize, seed: u64, repeat: u32, config: SolverConfig, packing: Packing) -> Result<()> {
    if n == 0 {
        bail!("--size must be at least 1");
    }
    if repeat == 0 {
        bail!("--repeat must be at least 1");
    }

    let mut solver = GramSchmidt::new(config)?;
    let info = solver.device_info();
    println!(
        "device: {} ({}), family {} with {} queue(s)",
        info.name, info.device_type, info.queue_family_index, info.family_queue_count
    );

    let input = random_matrix(n, seed);
    let mut total = Duration::ZERO;
    let mut result = input.clone();
    for i in 0..repeat {
        result.clone_from(&input);
        let start = Instant::now();
        solver
            .run(&mut result, packing)
            .with_context(|| format!("run {} of {repeat}", i + 1))?;
        total += start.elapsed();
    }

    let vectors = match packing {
        Packing::Rows => result,
        Packing::Columns => transpose(&result),
    };
    println!("n = {n}, runs = {repeat}");
    println!("mean time: {:.3} ms", total.as_secs_f64() * 1e3 / f64::from(repeat));
    println!("max |cos| between output vectors: {:.3e}", max_off_diagonal(&vectors));
    Ok(())
}

fn cmd_instances(k: usize, config: SolverConfig) -> Result<()> {
    let pool = QueuePool::new();
    let handles: Vec<_> = (0..k)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let config = config.clone();
            std::thread::spawn(move || GramSchmidt::with_pool(&pool, config))
        })
        .collect();

    let mut solvers = Vec::new();
    for handle in handles {
        match handle.join() {
            Ok(Ok(solver)) => solvers.push(solver),
            Ok(Err(e)) => println!("instance failed: {e}"),
            Err(_) => bail!("solver thread panicked"),
        }
    }
    println!("{} of {k} instance(s) got a queue, {} reserved", solvers.len(), pool.total_reserved());
    Ok(())
}

/// Random entries in [-1, 1) plus `n` on the diagonal, so the vectors are
/// well away from linear dependence.
fn random_matrix(n: usize, seed: u64) -> Matrix {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            (0..n)
                .map(|j| {
                    let v: f64 = rng.gen_range(-1.0..1.0);
                    if i == j { v + n as f64 } else { v }
                })
                .collect()
        })
        .collect()
}

fn transpose(m: &Matrix) -> Matrix {
    (0..m.len()).map(|j| m.iter().map(|row| row[j]).collect()).collect()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Largest |cos θ| over all pairs of distinct vectors.
fn max_off_diagonal(vectors: &Matrix) -> f64 {
    let norms: Vec<f64> = vectors.iter().map(|v| dot(v, v).sqrt()).collect();
    let mut worst = 0.0f64;
    for i in 0..vectors.len() {
        for j in 0..i {
            worst = worst.max((dot(&vectors[i], &vectors[j]) / (norms[i] * norms[j])).abs());
        }
    }
    worst
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_off_diagonal_identity_and_parallel() {
        let identity = vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 1.0]];
        assert_eq!(max_off_diagonal(&identity), 0.0);

        let parallel = vec![vec![1.0, 2.0], vec![-2.0, -4.0]];
        assert!((max_off_diagonal(&parallel) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_random_matrix_is_seeded_and_dominant() {
        let a = random_matrix(6, 7);
        assert_eq!(a, random_matrix(6, 7));
        assert_ne!(a, random_matrix(6, 8));
        for (i, row) in a.iter().enumerate() {
            let off: f64 = row.iter().enumerate().filter(|&(j, _)| j != i).map(|(_, v)| v.abs()).sum();
            assert!(row[i] > 5.0 && off < 5.0);
        }
    }

    #[test]
    fn test_transpose() {
        let m = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        assert_eq!(transpose(&m), vec![vec![1.0, 3.0], vec![2.0, 4.0]]);
        assert_eq!(transpose(&transpose(&m)), m);
    }
}
