//! CPU identification and static per-model capability data.
//!
//! Identification happens once at startup: vendor signature check, family
//! and model computation from the extended CPUID fields, brand string,
//! boost capability, and cache geometry for diagnostics. The Tctl offset
//! table corrects the reported package temperature for parts whose thermal
//! control value runs above the true junction temperature.

use serde::Serialize;

use crate::error::{PmError, Result};

/// Startup snapshot of the running processor.
#[derive(Debug, Clone, Serialize)]
pub struct CpuIdentity {
    pub vendor: String,
    pub family: u32,
    pub model: u32,
    pub brand: String,
    /// Core performance boost supported (CPUID 8000_0007h EDX[9]).
    pub boost_capable: bool,
    pub l1_per_core_kb: u32,
    pub l2_per_core_kb: u32,
    pub l3_kb: u32,
}

impl CpuIdentity {
    /// Officially supported families. Others still run the generic paths
    /// but telemetry constants may not apply.
    pub fn supported(&self) -> bool {
        self.family == 0x17
    }
}

/// Per-model Tctl offset corrections, matched by family plus a brand-string
/// prefix. The Threadripper prefixes cover the 19x0X and 29x0[W]X parts.
const TCTL_OFFSET_TABLE: &[(u32, &str, f32)] = &[
    (0x17, "AMD Ryzen 5 1600X", 20.0),
    (0x17, "AMD Ryzen 7 1700X", 20.0),
    (0x17, "AMD Ryzen 7 1800X", 20.0),
    (0x17, "AMD Ryzen 7 2700X", 10.0),
    (0x17, "AMD Ryzen Threadripper 19", 27.0),
    (0x17, "AMD Ryzen Threadripper 29", 27.0),
];

/// Look up the Tctl offset for a family/brand pair. Parts without an entry
/// report true temperature and need no correction.
pub fn tctl_offset_for(family: u32, brand: &str) -> f32 {
    for &(fam, id, offset) in TCTL_OFFSET_TABLE {
        if family == fam && brand.contains(id) {
            return offset;
        }
    }
    0.0
}

/// Identify the running CPU via CPUID.
///
/// Fails with [`PmError::UnsupportedCpu`] when the vendor signature is not
/// AuthenticAMD: every register address in this crate is family-specific.
#[cfg(target_arch = "x86_64")]
pub fn identify_cpu() -> Result<CpuIdentity> {
    use core::arch::x86_64::__cpuid;

    // SAFETY: CPUID is unprivileged on x86_64.
    let leaf0 = unsafe { __cpuid(0) };
    let vendor = vendor_string(leaf0.ebx, leaf0.edx, leaf0.ecx);
    if vendor != "AuthenticAMD" {
        return Err(PmError::UnsupportedCpu { vendor });
    }

    let leaf1 = unsafe { __cpuid(1) };
    let family = ((leaf1.eax >> 20) & 0xff) + ((leaf1.eax >> 8) & 0xf);
    let model = ((leaf1.eax >> 16) & 0xf) + ((leaf1.eax >> 4) & 0xf);

    let mut brand_bytes = Vec::with_capacity(48);
    for leaf in 0x8000_0002u32..=0x8000_0004 {
        let r = unsafe { __cpuid(leaf) };
        for reg in [r.eax, r.ebx, r.ecx, r.edx] {
            brand_bytes.extend_from_slice(&reg.to_le_bytes());
        }
    }
    let brand = String::from_utf8_lossy(&brand_bytes)
        .trim_end_matches('\0')
        .trim()
        .to_string();

    let l1 = unsafe { __cpuid(0x8000_0005) };
    let l2l3 = unsafe { __cpuid(0x8000_0006) };
    let power = unsafe { __cpuid(0x8000_0007) };

    Ok(CpuIdentity {
        vendor,
        family,
        model,
        brand,
        boost_capable: (power.edx >> 9) & 0x1 != 0,
        l1_per_core_kb: l1.ecx >> 24,
        l2_per_core_kb: l2l3.ecx >> 16,
        l3_kb: (l2l3.edx >> 18) * 512,
    })
}

#[cfg(not(target_arch = "x86_64"))]
pub fn identify_cpu() -> Result<CpuIdentity> {
    Err(PmError::Setup("CPUID unavailable on this architecture".into()))
}

#[cfg(target_arch = "x86_64")]
fn vendor_string(ebx: u32, edx: u32, ecx: u32) -> String {
    let mut bytes = Vec::with_capacity(12);
    for reg in [ebx, edx, ecx] {
        bytes.extend_from_slice(&reg.to_le_bytes());
    }
    String::from_utf8_lossy(&bytes).to_string()
}

// ---------------------------------------------------------------------------
// Board identity
// ---------------------------------------------------------------------------

/// Mainboard identification strings, consumed for diagnostics only, never
/// for control decisions.
pub trait BoardInfoProvider: Send + Sync {
    fn board_vendor(&self) -> Option<String>;
    fn board_name(&self) -> Option<String>;
}

/// Board identity from the DMI tables exposed in sysfs.
pub struct DmiBoardInfo;

impl DmiBoardInfo {
    fn read(name: &str) -> Option<String> {
        let raw = std::fs::read_to_string(format!("/sys/class/dmi/id/{name}")).ok()?;
        let v = raw.trim();
        if v.is_empty() { None } else { Some(v.to_string()) }
    }
}

impl BoardInfoProvider for DmiBoardInfo {
    fn board_vendor(&self) -> Option<String> {
        Self::read("board_vendor")
    }

    fn board_name(&self) -> Option<String> {
        Self::read("board_name")
    }
}
