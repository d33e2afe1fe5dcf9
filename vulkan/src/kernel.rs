//! Kernel binary loading.
//!
//! The kernel is an opaque SPIR-V blob; we only make sure it arrives as a
//! host-endian sequence of 32-bit words.

use std::path::Path;

use crate::error::{GramSchmidtError, Result};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// A kernel binary ready for `vkCreateShaderModule`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelBinary {
    words: Vec<u32>,
}

impl KernelBinary {
    /// Read the kernel at `path`. A missing file is an [`GramSchmidtError::Io`] error.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|source| GramSchmidtError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let kernel = Self::from_bytes(&bytes)?;
        tracing::debug!(path = %path.display(), words = kernel.words.len(), "kernel loaded");
        Ok(kernel)
    }

    /// Pad `bytes` with zeros to a 4-byte boundary and split into words.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(GramSchmidtError::InvalidKernel("kernel binary is empty".into()));
        }
        let mut padded = bytes.to_vec();
        padded.resize(bytes.len().next_multiple_of(4), 0);

        let mut words: Vec<u32> = padded
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        // Big-endian module: swap every word.
        if words[0] == SPIRV_MAGIC.swap_bytes() {
            for word in &mut words {
                *word = word.swap_bytes();
            }
        }
        Ok(Self { words })
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn byte_len(&self) -> usize {
        self.words.len() * 4
    }
}
