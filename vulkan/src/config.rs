//! Solver configuration.
//!
//! Every knob has a default matching the reference kernel in `shaders/`.
//! Values are checked by [`SolverConfig::validate`] before any Vulkan object
//! is created.

use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{GramSchmidtError, Result};

/// Default directory searched for the kernel binary.
pub const DEFAULT_KERNEL_DIR: &str = "shaders";
/// Default kernel file name inside the kernel directory.
pub const DEFAULT_KERNEL_FILE: &str = "gram_schmidt.spv";
/// Kernel-side `local_size_x`; host dispatch math divides by this.
pub const DEFAULT_WORKGROUP_WIDTH: u32 = 32;
/// Bound on each per-pass fence wait.
pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_secs(1);

/// Options for constructing a [`GramSchmidt`](crate::GramSchmidt) solver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolverConfig {
    /// Enable `VK_LAYER_KHRONOS_validation` and `VK_EXT_debug_utils`.
    /// Construction fails if either is missing. Default: `false`.
    pub enable_debug: bool,
    /// Directory holding the kernel binary. Default: `shaders`.
    pub kernel_dir: PathBuf,
    /// Kernel binary file name. Default: `gram_schmidt.spv`.
    pub kernel_file: String,
    /// Kernel entry point. Default: `main`.
    pub entry_point: String,
    /// Invocations per work-group on the x axis. Must equal the kernel's
    /// `local_size_x`. Default: 32.
    pub workgroup_width: u32,
    /// Per-pass fence wait bound. Default: 1 s.
    pub fence_timeout: Duration,
    /// Reported to the driver in `VkApplicationInfo`.
    pub application_name: String,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            enable_debug: false,
            kernel_dir: PathBuf::from(DEFAULT_KERNEL_DIR),
            kernel_file: DEFAULT_KERNEL_FILE.to_string(),
            entry_point: "main".to_string(),
            workgroup_width: DEFAULT_WORKGROUP_WIDTH,
            fence_timeout: DEFAULT_FENCE_TIMEOUT,
            application_name: "Vulkan Gram-Schmidt".to_string(),
        }
    }
}

impl SolverConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `VGS_KERNEL_DIR`, `VGS_DEBUG` and `VGS_FENCE_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        Self::default().with_env(|key| std::env::var(key).ok())
    }

    fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup("VGS_KERNEL_DIR") {
            self.kernel_dir = PathBuf::from(dir);
        }
        if let Some(flag) = lookup("VGS_DEBUG") {
            self.enable_debug = matches!(flag.trim(), "1" | "true" | "yes" | "on");
        }
        if let Some(ms) = lookup("VGS_FENCE_TIMEOUT_MS").and_then(|v| v.trim().parse().ok()) {
            self.fence_timeout = Duration::from_millis(ms);
        }
        self
    }

    pub fn debug(mut self, enable: bool) -> Self {
        self.enable_debug = enable;
        self
    }

    pub fn kernel_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.kernel_dir = dir.into();
        self
    }

    pub fn kernel_file(mut self, file: impl Into<String>) -> Self {
        self.kernel_file = file.into();
        self
    }

    pub fn entry_point(mut self, name: impl Into<String>) -> Self {
        self.entry_point = name.into();
        self
    }

    pub fn workgroup_width(mut self, width: u32) -> Self {
        self.workgroup_width = width;
        self
    }

    pub fn fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout = timeout;
        self
    }

    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Full path of the kernel binary.
    pub fn kernel_path(&self) -> PathBuf {
        Path::new(&self.kernel_dir).join(&self.kernel_file)
    }

    /// Fence timeout in nanoseconds, saturated to `u64`.
    pub fn fence_timeout_ns(&self) -> u64 {
        u64::try_from(self.fence_timeout.as_nanos()).unwrap_or(u64::MAX)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workgroup_width == 0 {
            return Err(GramSchmidtError::InvalidConfig(
                "workgroup_width must be at least 1".into(),
            ));
        }
        if self.fence_timeout.is_zero() {
            return Err(GramSchmidtError::InvalidConfig(
                "fence_timeout must be non-zero".into(),
            ));
        }
        if self.kernel_file.is_empty() {
            return Err(GramSchmidtError::InvalidConfig("kernel_file is empty".into()));
        }
        if self.entry_point.is_empty() || self.entry_point.contains('\0') {
            return Err(GramSchmidtError::InvalidConfig(format!(
                "entry point {:?} is not a valid C identifier",
                self.entry_point
            )));
        }
        if self.application_name.contains('\0') {
            return Err(GramSchmidtError::InvalidConfig(
                "application_name contains a NUL byte".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn entry_point_cstr(&self) -> Result<CString> {
        CString::new(self.entry_point.as_str())
            .map_err(|e| GramSchmidtError::InvalidConfig(e.to_string()))
    }

    pub(crate) fn application_name_cstr(&self) -> Result<CString> {
        CString::new(self.application_name.as_str())
            .map_err(|e| GramSchmidtError::InvalidConfig(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_kernel() {
        let config = SolverConfig::default();
        assert!(!config.enable_debug);
        assert_eq!(config.workgroup_width, 32);
        assert_eq!(config.entry_point, "main");
        assert_eq!(config.kernel_path(), Path::new("shaders").join("gram_schmidt.spv"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_chain() {
        let config = SolverConfig::new()
            .debug(true)
            .kernel_dir("/opt/kernels")
            .kernel_file("gs.spv")
            .workgroup_width(64)
            .fence_timeout(Duration::from_millis(10));
        assert!(config.enable_debug);
        assert_eq!(config.kernel_path(), Path::new("/opt/kernels").join("gs.spv"));
        assert_eq!(config.workgroup_width, 64);
        assert_eq!(config.fence_timeout_ns(), 10_000_000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero_width = SolverConfig::new().workgroup_width(0);
        assert!(matches!(zero_width.validate(), Err(GramSchmidtError::InvalidConfig(_))));

        let zero_timeout = SolverConfig::new().fence_timeout(Duration::ZERO);
        assert!(zero_timeout.validate().is_err());

        let bad_entry = SolverConfig::new().entry_point("ma\0in");
        assert!(bad_entry.validate().is_err());

        let no_file = SolverConfig::new().kernel_file("");
        assert!(no_file.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let config = SolverConfig::default().with_env(|key| match key {
            "VGS_KERNEL_DIR" => Some("/tmp/k".to_string()),
            "VGS_DEBUG" => Some("1".to_string()),
            "VGS_FENCE_TIMEOUT_MS" => Some("250".to_string()),
            _ => None,
        });
        assert_eq!(config.kernel_dir, PathBuf::from("/tmp/k"));
        assert!(config.enable_debug);
        assert_eq!(config.fence_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_env_ignores_garbage_timeout() {
        let config = SolverConfig::default().with_env(|key| match key {
            "VGS_FENCE_TIMEOUT_MS" => Some("soon".to_string()),
            "VGS_DEBUG" => Some("no".to_string()),
            _ => None,
        });
        assert_eq!(config.fence_timeout, DEFAULT_FENCE_TIMEOUT);
        assert!(!config.enable_debug);
    }

    #[test]
    fn test_huge_timeout_saturates() {
        let config = SolverConfig::new().fence_timeout(Duration::from_secs(u64::MAX));
        assert_eq!(config.fence_timeout_ns(), u64::MAX);
    }
}
