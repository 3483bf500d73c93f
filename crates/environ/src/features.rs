use core::fmt;
use thiserror::Error;

bitflags::bitflags! {
    /// The set of WebAssembly proposals enabled for validation and execution.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Features: u64 {
        /// Import and export of mutable globals.
        const MUTABLE_GLOBAL = 1 << 0;
        /// `i32.extend8_s` and friends.
        const SIGN_EXTENSION_OPS = 1 << 1;
        /// Multiple function results and block types with parameters.
        const MULTI_VALUE = 1 << 2;
        /// The saturating `*.trunc_sat_*` conversions.
        const NONTRAPPING_FLOAT_TO_INT = 1 << 3;
        /// Passive segments, `memory.copy`, `memory.fill` and the data count section.
        const BULK_MEMORY_OPERATIONS = 1 << 4;
        /// `funcref`/`externref` values, multiple tables and the table instructions.
        const REFERENCE_TYPES = 1 << 5;
        /// 128-bit vectors and the `0xfd` prefixed instructions.
        const SIMD = 1 << 6;
    }
}

/// Error returned when an instruction or section needs a disabled proposal.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("feature {name:?} is disabled")]
pub struct FeatureError {
    name: &'static str,
}

impl FeatureError {
    /// The name of the disabled feature.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Features {
    /// Features defined by WebAssembly 1.0 (20191205).
    pub const V1: Features = Features::MUTABLE_GLOBAL;

    /// Features defined by WebAssembly 2.0.
    pub const V2: Features = Features::all();

    /// Returns `Ok` if every flag in `feature` is enabled.
    pub fn require(self, feature: Features) -> Result<(), FeatureError> {
        if self.contains(feature) {
            Ok(())
        } else {
            Err(FeatureError {
                name: feature.name(),
            })
        }
    }

    /// Returns true if every flag in `feature` is enabled.
    pub fn get(self, feature: Features) -> bool {
        self.contains(feature)
    }

    fn name(self) -> &'static str {
        if self == Features::MUTABLE_GLOBAL {
            "mutable-global"
        } else if self == Features::SIGN_EXTENSION_OPS {
            "sign-extension-ops"
        } else if self == Features::MULTI_VALUE {
            "multi-value"
        } else if self == Features::NONTRAPPING_FLOAT_TO_INT {
            "nontrapping-float-to-int-conversion"
        } else if self == Features::BULK_MEMORY_OPERATIONS {
            "bulk-memory-operations"
        } else if self == Features::REFERENCE_TYPES {
            "reference-types"
        } else if self == Features::SIMD {
            "simd"
        } else {
            ""
        }
    }
}

impl Default for Features {
    fn default() -> Features {
        Features::V2
    }
}

impl fmt::Display for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for flag in self.iter() {
            if !first {
                f.write_str("|")?;
            }
            first = false;
            f.write_str(flag.name())?;
        }
        Ok(())
    }
}
