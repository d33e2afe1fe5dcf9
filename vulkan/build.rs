// Build script for vgs-vulkan: compiles the reference kernel when glslc is available.
// The library loads libvulkan at runtime through ash, so nothing is linked here.
// If no compiler is found the build still succeeds; the kernel is then expected
// at runtime under VGS_KERNEL_DIR (see SolverConfig::from_env).

use std::path::{Path, PathBuf};
use std::process::Command;

const KERNEL_SOURCE: &str = "../shaders/gram_schmidt.comp";
const KERNEL_OUTPUT: &str = "gram_schmidt.spv";

fn main() {
    println!("cargo:rerun-if-changed={}", KERNEL_SOURCE);
    println!("cargo:rerun-if-env-changed=VULKAN_SDK");
    println!("cargo:rerun-if-env-changed=GLSLC");

    let out_dir = match std::env::var("OUT_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => return,
    };

    let Some(glslc) = find_glslc() else {
        println!("cargo:warning=glslc not found, reference kernel not compiled");
        return;
    };

    let output = out_dir.join(KERNEL_OUTPUT);
    let status = Command::new(&glslc)
        .arg("-fshader-stage=compute")
        .arg("-O")
        .arg(KERNEL_SOURCE)
        .arg("-o")
        .arg(&output)
        .status();

    match status {
        Ok(s) if s.success() => {
            println!("cargo:rustc-env=VGS_BUILT_KERNEL_DIR={}", out_dir.display());
        }
        Ok(s) => println!("cargo:warning=glslc exited with {}, kernel not compiled", s),
        Err(e) => println!("cargo:warning=failed to run {}: {}", glslc.display(), e),
    }
}

/// Locate glslc: explicit GLSLC, then the Vulkan SDK, then PATH.
fn find_glslc() -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var("GLSLC") {
        return Some(PathBuf::from(explicit));
    }

    let exe = if cfg!(target_os = "windows") { "glslc.exe" } else { "glslc" };
    let mut dirs: Vec<PathBuf> = Vec::new();

    if let Ok(sdk) = std::env::var("VULKAN_SDK") {
        dirs.push(Path::new(&sdk).join("bin"));
        dirs.push(Path::new(&sdk).join("Bin"));
    }

    // Windows installers without VULKAN_SDK set: C:\VulkanSDK\<version>\Bin,
    // highest version first.
    if cfg!(target_os = "windows") {
        let mut installed: Vec<PathBuf> = std::fs::read_dir(r"C:\VulkanSDK")
            .into_iter()
            .flatten()
            .flatten()
            .map(|version| version.path().join("Bin"))
            .collect();
        installed.sort_unstable_by(|a, b| b.cmp(a));
        dirs.extend(installed);
    }

    if let Some(path) = std::env::var_os("PATH") {
        dirs.extend(std::env::split_paths(&path));
    }

    dirs.into_iter()
        .map(|dir| dir.join(exe))
        .find(|candidate| candidate.is_file())
}
