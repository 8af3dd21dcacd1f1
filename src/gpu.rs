//! GPU detection and layer offload suggestions
//!
//! Queries hardware tools in a fixed order (nvidia-smi, rocm-smi, lspci) and
//! normalizes their output into a [`GpuProfile`]. A missing tool or output
//! that does not parse means "not present", never an error.

use crate::process::{CommandRunner, CommandSpec};
use serde::{Deserialize, Serialize};
use std::fmt;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Ceiling used when the model's layer count is unknown
pub const DEFAULT_LAYER_CEILING: u32 = 32;

/// Device memory kept free for the KV cache and runtime buffers
const RESERVED_BYTES: u64 = GIB;

/// Memory assumed for an AMD device whose size cannot be parsed
const AMD_FALLBACK_BYTES: u64 = 8 * GIB;

/// Accelerator vendor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    #[default]
    None,
    Nvidia,
    Amd,
    Other,
}

impl fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Nvidia => write!(f, "NVIDIA"),
            Self::Amd => write!(f, "AMD"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Normalized hardware profile
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpuProfile {
    pub vendor: GpuVendor,
    /// Total device memory across all devices, 0 if unknown
    pub memory_bytes: u64,
    pub device_count: u32,
    /// Suggestion for a model of unknown size
    pub recommended_layers: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl GpuProfile {
    pub fn none() -> Self {
        Self::default()
    }

    fn detected(vendor: GpuVendor, memory_bytes: u64, device_count: u32, name: Option<String>) -> Self {
        let mut profile = Self {
            vendor,
            memory_bytes,
            device_count,
            recommended_layers: 0,
            name,
        };
        profile.recommended_layers = recommend_layers(&profile, 0, None, LayerEstimate::default());
        profile
    }

    pub fn has_device(&self) -> bool {
        self.vendor != GpuVendor::None
    }
}

/// Per-layer memory estimate used when the layer count is unknown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerEstimate(pub u64);

impl Default for LayerEstimate {
    fn default() -> Self {
        Self(768 * MIB)
    }
}

/// Estimate how many layers fit in device memory.
///
/// With a layer count hint and a known file size the per-layer cost is
/// `file_size / layers` and the result is clamped to `[0, layers]`.
/// Without a hint the configured per-layer estimate is used and the result
/// is clamped to [`DEFAULT_LAYER_CEILING`] (and to the layers the file could
/// hold at that estimate), preferring under-allocation.
pub fn recommend_layers(
    profile: &GpuProfile,
    model_file_size: u64,
    total_layers_hint: Option<u32>,
    estimate: LayerEstimate,
) -> u32 {
    if !profile.has_device() || profile.memory_bytes == 0 {
        return 0;
    }

    let usable = (profile.memory_bytes / 10 * 9).saturating_sub(RESERVED_BYTES);
    let hint = total_layers_hint.filter(|h| *h > 0);

    let per_layer = match hint {
        Some(layers) if model_file_size > 0 => model_file_size.div_ceil(u64::from(layers)),
        _ => estimate.0,
    }
    .max(1);

    let fit = u32::try_from(usable / per_layer).unwrap_or(u32::MAX);

    match hint {
        Some(layers) => fit.min(layers),
        None => {
            let mut ceiling = DEFAULT_LAYER_CEILING;
            if model_file_size > 0 {
                let file_layers = model_file_size.div_ceil(estimate.0.max(1));
                ceiling = ceiling.min(u32::try_from(file_layers).unwrap_or(u32::MAX));
            }
            fit.min(ceiling)
        }
    }
}

/// Detects accelerators through external tools
pub struct GpuProfiler<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> GpuProfiler<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    /// Detect the host's accelerator. Never fails.
    pub async fn detect(&self) -> GpuProfile {
        if let Some(profile) = self.query_nvidia().await {
            return profile;
        }
        if let Some(profile) = self.query_amd().await {
            return profile;
        }
        if let Some(profile) = self.query_lspci().await {
            return profile;
        }

        tracing::info!("No GPU detected, inference will run on CPU");
        GpuProfile::none()
    }

    async fn run_tool(&self, program: &str, args: &[&str]) -> Option<String> {
        let spec = CommandSpec::new(program, args.iter().copied());
        match self.runner.run(&spec).await {
            Ok(output) if output.success => Some(output.stdout),
            Ok(output) => {
                tracing::debug!(
                    tool = program,
                    code = ?output.code,
                    stderr = %output.stderr.trim(),
                    "Hardware query failed, assuming device absent"
                );
                None
            }
            Err(e) => {
                tracing::debug!(tool = program, error = %e, "Hardware query tool unavailable");
                None
            }
        }
    }

    async fn query_nvidia(&self) -> Option<GpuProfile> {
        let stdout = self
            .run_tool(
                "nvidia-smi",
                &["--query-gpu=name,memory.total", "--format=csv,noheader,nounits"],
            )
            .await?;
        let profile = parse_nvidia_smi(&stdout)?;

        tracing::info!(
            vendor = %profile.vendor,
            devices = profile.device_count,
            memory_mib = profile.memory_bytes / MIB,
            recommended_layers = profile.recommended_layers,
            "Detected GPU"
        );
        Some(profile)
    }

    async fn query_amd(&self) -> Option<GpuProfile> {
        let stdout = self
            .run_tool("rocm-smi", &["--showmeminfo", "vram", "--csv"])
            .await?;
        let profile = parse_rocm_smi(&stdout)?;

        tracing::info!(
            vendor = %profile.vendor,
            devices = profile.device_count,
            memory_mib = profile.memory_bytes / MIB,
            recommended_layers = profile.recommended_layers,
            "Detected GPU"
        );
        Some(profile)
    }

    async fn query_lspci(&self) -> Option<GpuProfile> {
        let stdout = self.run_tool("lspci", &[]).await?;
        let profile = parse_lspci(&stdout)?;

        tracing::info!(
            vendor = %profile.vendor,
            name = ?profile.name,
            "Detected display controller without memory information"
        );
        Some(profile)
    }
}

/// Parse `nvidia-smi --query-gpu=name,memory.total --format=csv,noheader,nounits`.
/// One line per device, memory in MiB.
pub fn parse_nvidia_smi(stdout: &str) -> Option<GpuProfile> {
    let mut name = None;
    let mut total_mib: u64 = 0;
    let mut count: u32 = 0;

    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (device, memory) = line.rsplit_once(',')?;
        let mib: u64 = memory.trim().parse().ok()?;
        total_mib += mib;
        count += 1;
        name.get_or_insert_with(|| device.trim().to_string());
    }

    (count > 0).then(|| GpuProfile::detected(GpuVendor::Nvidia, total_mib * MIB, count, name))
}

/// Parse `rocm-smi --showmeminfo vram --csv`.
///
/// ```text
/// device,VRAM Total Memory (B),VRAM Total Used Memory (B)
/// card0,17163091968,12345
/// ```
pub fn parse_rocm_smi(stdout: &str) -> Option<GpuProfile> {
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let header = lines.next()?;
    let total_col = header
        .split(',')
        .position(|col| col.contains("Total Memory") && !col.contains("Used"));

    let mut total: u64 = 0;
    let mut count: u32 = 0;
    for line in lines {
        let cols: Vec<&str> = line.split(',').collect();
        if !cols.first().is_some_and(|c| c.starts_with("card") || c.starts_with("GPU")) {
            continue;
        }
        count += 1;
        if let Some(bytes) = total_col
            .and_then(|idx| cols.get(idx))
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            total += bytes;
        }
    }

    if count == 0 {
        return None;
    }
    if total == 0 {
        total = AMD_FALLBACK_BYTES * u64::from(count);
    }
    Some(GpuProfile::detected(GpuVendor::Amd, total, count, None))
}

/// Parse `lspci` output for display controllers. Memory is unknown.
pub fn parse_lspci(stdout: &str) -> Option<GpuProfile> {
    let controllers: Vec<&str> = stdout
        .lines()
        .filter(|l| {
            l.contains("VGA compatible controller")
                || l.contains("3D controller")
                || l.contains("Display controller")
        })
        .collect();

    // Prefer a discrete vendor when several controllers are listed
    let pick = |needles: &[&str]| {
        controllers
            .iter()
            .find(|l| needles.iter().any(|n| l.contains(n)))
            .copied()
    };
    let (vendor, line) = if let Some(line) = pick(&["NVIDIA"]) {
        (GpuVendor::Nvidia, line)
    } else if let Some(line) = pick(&["Advanced Micro Devices", "AMD", "ATI"]) {
        (GpuVendor::Amd, line)
    } else {
        (GpuVendor::Other, *controllers.first()?)
    };

    let name = line
        .split_once(": ")
        .map(|(_, desc)| desc.trim().to_string());
    Some(GpuProfile::detected(
        vendor,
        0,
        controllers.len() as u32,
        name,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::mocks::MockCommandRunner;

    fn nvidia(memory_gib: u64) -> GpuProfile {
        GpuProfile {
            vendor: GpuVendor::Nvidia,
            memory_bytes: memory_gib * GIB,
            device_count: 1,
            recommended_layers: 0,
            name: None,
        }
    }

    #[test]
    fn test_no_device_recommends_zero() {
        let profile = GpuProfile::none();
        assert_eq!(
            recommend_layers(&profile, 5 * GIB, Some(32), LayerEstimate::default()),
            0
        );
        assert_eq!(profile.recommended_layers, 0);
    }

    #[test]
    fn test_unknown_memory_recommends_zero() {
        let profile = GpuProfile {
            vendor: GpuVendor::Other,
            ..Default::default()
        };
        assert_eq!(recommend_layers(&profile, GIB, None, LayerEstimate::default()), 0);
    }

    #[test]
    fn test_model_fits_entirely() {
        // 24 GiB card, 5 GiB model with 32 layers -> all layers
        let layers = recommend_layers(&nvidia(24), 5 * GIB, Some(32), LayerEstimate::default());
        assert_eq!(layers, 32);
    }

    #[test]
    fn test_partial_offload_with_hint() {
        // 8 GiB card: usable = 7.2 GiB - 1 GiB; 64 layers of 0.5 GiB each
        let layers = recommend_layers(&nvidia(8), 32 * GIB, Some(64), LayerEstimate::default());
        assert!(layers > 0 && layers < 64, "got {}", layers);
        assert_eq!(layers, 12);
    }

    #[test]
    fn test_no_hint_clamps_to_default_ceiling() {
        let layers = recommend_layers(&nvidia(80), 0, None, LayerEstimate::default());
        assert_eq!(layers, DEFAULT_LAYER_CEILING);
    }

    #[test]
    fn test_no_hint_clamps_to_file_size() {
        // 3 GiB file at 768 MiB per layer holds at most 4 layers
        let layers = recommend_layers(&nvidia(80), 3 * GIB, None, LayerEstimate::default());
        assert_eq!(layers, 4);
    }

    #[test]
    fn test_tiny_card_recommends_zero() {
        let layers = recommend_layers(&nvidia(1), 4 * GIB, Some(32), LayerEstimate::default());
        assert_eq!(layers, 0);
    }

    #[test]
    fn test_parse_nvidia_multi_gpu() {
        let profile = parse_nvidia_smi("NVIDIA GeForce RTX 4090, 24564\nNVIDIA GeForce RTX 4090, 24564\n")
            .unwrap();
        assert_eq!(profile.vendor, GpuVendor::Nvidia);
        assert_eq!(profile.device_count, 2);
        assert_eq!(profile.memory_bytes, 2 * 24564 * MIB);
        assert_eq!(profile.name.as_deref(), Some("NVIDIA GeForce RTX 4090"));
        assert_eq!(profile.recommended_layers, DEFAULT_LAYER_CEILING);
    }

    #[test]
    fn test_parse_nvidia_garbage() {
        assert!(parse_nvidia_smi("").is_none());
        assert!(parse_nvidia_smi("No devices were found").is_none());
        assert!(parse_nvidia_smi("GPU, [N/A]").is_none());
    }

    #[test]
    fn test_parse_rocm_csv() {
        let out = "device,VRAM Total Memory (B),VRAM Total Used Memory (B)\ncard0,17163091968,524288\n";
        let profile = parse_rocm_smi(out).unwrap();
        assert_eq!(profile.vendor, GpuVendor::Amd);
        assert_eq!(profile.memory_bytes, 17163091968);
        assert_eq!(profile.device_count, 1);
    }

    #[test]
    fn test_parse_rocm_without_memory_uses_fallback() {
        let out = "device,Something Else\ncard0,abc\n";
        let profile = parse_rocm_smi(out).unwrap();
        assert_eq!(profile.memory_bytes, AMD_FALLBACK_BYTES);
        assert!(parse_rocm_smi("WARNING: No AMD GPUs specified\n").is_none());
    }

    #[test]
    fn test_parse_lspci() {
        let out = "00:02.0 VGA compatible controller: Intel Corporation UHD Graphics 630\n\
                   01:00.0 3D controller: NVIDIA Corporation GA107M [GeForce RTX 3050 Mobile]\n\
                   00:1f.3 Audio device: Intel Corporation Cannon Lake PCH cAVS\n";
        let profile = parse_lspci(out).unwrap();
        assert_eq!(profile.vendor, GpuVendor::Nvidia);
        assert_eq!(profile.memory_bytes, 0);
        assert_eq!(profile.recommended_layers, 0);
        assert_eq!(profile.device_count, 2);

        assert!(parse_lspci("00:1f.3 Audio device: Intel\n").is_none());
    }

    #[tokio::test]
    async fn test_detect_prefers_nvidia() {
        let runner = MockCommandRunner::new()
            .with_success("nvidia-smi", "NVIDIA A10, 23028\n")
            .with_success("rocm-smi", "device,VRAM Total Memory (B)\ncard0,1\n");
        let profile = GpuProfiler::new(&runner).detect().await;
        assert_eq!(profile.vendor, GpuVendor::Nvidia);
        assert_eq!(runner.called_programs(), vec!["nvidia-smi"]);
    }

    #[tokio::test]
    async fn test_detect_falls_through_failures() {
        let runner = MockCommandRunner::new()
            .with_failure("nvidia-smi", "NVIDIA-SMI has failed")
            .with_success(
                "rocm-smi",
                "device,VRAM Total Memory (B),VRAM Total Used Memory (B)\ncard0,8589934592,0\n",
            );
        let profile = GpuProfiler::new(&runner).detect().await;
        assert_eq!(profile.vendor, GpuVendor::Amd);
        assert_eq!(profile.memory_bytes, 8 * GIB);
    }

    #[tokio::test]
    async fn test_detect_nothing_installed() {
        let runner = MockCommandRunner::new();
        let profile = GpuProfiler::new(&runner).detect().await;
        assert_eq!(profile, GpuProfile::none());
        assert_eq!(
            runner.called_programs(),
            vec!["nvidia-smi", "rocm-smi", "lspci"]
        );
    }
}
