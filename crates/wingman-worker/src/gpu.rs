//! GPU vendor detection and executable variant selection.
//!
//! Detection shells out to whatever the platform offers (`nvidia-smi`,
//! `lspci`, `wmic`, `system_profiler`); parsing is kept separate so it can be
//! tested against captured output.

use serde::Serialize;
use std::process::Command;
use wingman_types::{sys_debug, ExecutableVariant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
}

fn vendor_of(line: &str) -> Option<GpuVendor> {
    let lower = line.to_lowercase();
    if lower.contains("nvidia") {
        Some(GpuVendor::Nvidia)
    } else if lower.contains("amd") || lower.contains("radeon") || lower.contains("advanced micro devices") {
        Some(GpuVendor::Amd)
    } else if lower.contains("intel") {
        Some(GpuVendor::Intel)
    } else if lower.contains("apple") {
        Some(GpuVendor::Apple)
    } else {
        None
    }
}

/// Vendors mentioned in `lspci` output. Only display controller lines count,
/// so an Intel chipset next to an NVIDIA card is not reported as a GPU.
pub fn parse_lspci(output: &str) -> Vec<GpuVendor> {
    collect(output.lines().filter(|line| {
        line.contains("VGA compatible controller")
            || line.contains("3D controller")
            || line.contains("Display controller")
    }))
}

/// Vendors in a plain list of adapter names (`wmic`, `nvidia-smi -L`,
/// `system_profiler` chipset lines).
pub fn parse_gpu_names(output: &str) -> Vec<GpuVendor> {
    collect(output.lines())
}

fn collect<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<GpuVendor> {
    let mut vendors = Vec::new();
    for vendor in lines.filter_map(vendor_of) {
        if !vendors.contains(&vendor) {
            vendors.push(vendor);
        }
    }
    vendors
}

fn run(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Ask the OS which GPU vendors are present.
pub fn detect_gpu_vendors() -> Vec<GpuVendor> {
    let mut vendors = Vec::new();

    if cfg!(target_os = "macos") {
        if let Some(out) = run("system_profiler", &["SPDisplaysDataType"]) {
            vendors = parse_gpu_names(
                &out.lines()
                    .filter(|l| l.contains("Chipset Model"))
                    .collect::<Vec<_>>()
                    .join("\n"),
            );
        }
    } else if cfg!(windows) {
        if let Some(out) = run("wmic", &["path", "win32_VideoController", "get", "name"]) {
            vendors = parse_gpu_names(&out);
        }
    } else if let Some(out) = run("lspci", &[]) {
        vendors = parse_lspci(&out);
    }

    // nvidia-smi is authoritative when the driver is installed.
    if !vendors.contains(&GpuVendor::Nvidia) {
        if let Some(out) = run("nvidia-smi", &["-L"]) {
            if out.lines().any(|l| l.starts_with("GPU ")) {
                vendors.insert(0, GpuVendor::Nvidia);
            }
        }
    }

    sys_debug!("[GPU] Detected vendors: {:?}", vendors);
    vendors
}

/// Metal on macOS, CUDA with an NVIDIA card, Vulkan with AMD or Intel,
/// otherwise the CPU build.
pub fn select_variant(os: &str, vendors: &[GpuVendor]) -> ExecutableVariant {
    if os == "macos" {
        return ExecutableVariant::Metal;
    }
    if vendors.contains(&GpuVendor::Nvidia) {
        ExecutableVariant::Cuda
    } else if vendors.contains(&GpuVendor::Amd) || vendors.contains(&GpuVendor::Intel) {
        ExecutableVariant::Vulkan
    } else {
        ExecutableVariant::Cpu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LSPCI: &str = "\
00:00.0 Host bridge: Intel Corporation 8th Gen Core Processor Host Bridge/DRAM Registers (rev 07)
00:14.0 USB controller: Intel Corporation Cannon Lake PCH USB 3.1 xHCI Host Controller (rev 10)
01:00.0 VGA compatible controller: NVIDIA Corporation TU106 [GeForce RTX 2060 Rev. A] (rev a1)
01:00.1 Audio device: NVIDIA Corporation TU106 High Definition Audio Controller (rev a1)";

    #[test]
    fn test_lspci_ignores_chipset() {
        assert_eq!(parse_lspci(LSPCI), vec![GpuVendor::Nvidia]);
    }

    #[test]
    fn test_lspci_amd() {
        let out = "03:00.0 VGA compatible controller: Advanced Micro Devices, Inc. [AMD/ATI] Navi 22";
        assert_eq!(parse_lspci(out), vec![GpuVendor::Amd]);
    }

    #[test]
    fn test_wmic_names() {
        let out = "Name\r\nIntel(R) UHD Graphics 630\r\nNVIDIA GeForce GTX 1650\r\n";
        assert_eq!(parse_gpu_names(out), vec![GpuVendor::Intel, GpuVendor::Nvidia]);
    }

    #[test]
    fn test_select_variant() {
        assert_eq!(select_variant("macos", &[]), ExecutableVariant::Metal);
        assert_eq!(
            select_variant("windows", &[GpuVendor::Intel, GpuVendor::Nvidia]),
            ExecutableVariant::Cuda
        );
        assert_eq!(select_variant("linux", &[GpuVendor::Amd]), ExecutableVariant::Vulkan);
        assert_eq!(select_variant("linux", &[GpuVendor::Intel]), ExecutableVariant::Vulkan);
        assert_eq!(select_variant("linux", &[]), ExecutableVariant::Cpu);
    }
}
