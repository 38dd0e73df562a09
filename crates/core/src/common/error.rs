//! Fault and configuration error definitions.
//!
//! Pipeline-internal faults are data, not `Err`: they attach to the
//! instruction that raised them and surface at retirement so program order is
//! preserved. `ConfigError` is the only error type returned through `Result`
//! by the library — configuration problems are fatal before the core starts.

use std::fmt;

/// An instruction-synchronous fault, carried on the instruction to retirement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// The program counter was not aligned to the instruction size.
    /// The associated value is the misaligned address.
    MisalignedPc(u64),

    /// The instruction encoding is invalid or unimplemented.
    /// The associated value is the raw encoding.
    IllegalInstruction(u32),

    /// A supervisor call was requested.
    SyscallRequest,

    /// A floating-point operation trapped.
    FloatingPointTrap,

    /// A data access aborted (translation returned no mapping, or a faulty
    /// response packet arrived). The associated value is the faulting address.
    DataAbort(u64),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::MisalignedPc(addr) => write!(f, "MisalignedPc({:#x})", addr),
            Fault::IllegalInstruction(bits) => write!(f, "IllegalInstruction({:#010x})", bits),
            Fault::SyscallRequest => write!(f, "SyscallRequest"),
            Fault::FloatingPointTrap => write!(f, "FloatingPointTrap"),
            Fault::DataAbort(addr) => write!(f, "DataAbort({:#x})", addr),
        }
    }
}

impl std::error::Error for Fault {}

/// A fatal configuration problem, reported before the core starts.
#[derive(Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    Io(std::io::Error),
    /// The configuration file could not be parsed.
    Parse(serde_json::Error),
    /// A value was present but outside its permitted range or set.
    Invalid {
        /// Dotted key path of the offending option.
        key: &'static str,
        /// Human-readable description of the constraint that failed.
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config read failed: {}", e),
            ConfigError::Parse(e) => write!(f, "config parse failed: {}", e),
            ConfigError::Invalid { key, reason } => {
                write!(f, "config option `{}` invalid: {}", key, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e)
    }
}
