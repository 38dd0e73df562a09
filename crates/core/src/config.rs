//! Simulator configuration.
//!
//! This module defines all configuration structures used to parameterize the
//! core. It provides:
//! 1. **Defaults:** Baseline hardware constants (queue sizes, bandwidths, widths).
//! 2. **Structures:** Hierarchical config for core, fetch, queues, LSQ memory
//!    interface, execution units, ports, and register banks.
//! 3. **Validation:** A `validate()` pass that rejects out-of-range values
//!    before the core is constructed.
//!
//! Configuration is supplied via JSON, or use `Config::default()`.

use serde::Deserialize;

use crate::common::ConfigError;

/// Default configuration constants for the simulator.
mod defaults {
    /// Bytes fetched per cycle.
    pub const FETCH_BLOCK_SIZE: u16 = 16;

    /// Loop buffer capacity in macro-ops.
    pub const LOOP_BUFFER_SIZE: u16 = 32;

    /// Consecutive identical branch commits before a loop is reported.
    pub const LOOP_DETECTION_THRESHOLD: u16 = 5;

    /// Frontend pipeline width (slots per inter-stage buffer).
    pub const FRONTEND_WIDTH: usize = 2;

    /// Completion slots allocated to the load/store queue.
    pub const LSQ_COMPLETION_SLOTS: usize = 1;

    /// Instructions retired per cycle.
    pub const COMMIT_WIDTH: usize = 2;

    /// Load queue capacity.
    pub const LOAD_QUEUE_SIZE: usize = 16;

    /// Store queue capacity.
    pub const STORE_QUEUE_SIZE: usize = 16;

    /// Reorder buffer capacity.
    pub const ROB_SIZE: usize = 32;

    /// Load bandwidth in bytes per cycle.
    pub const LOAD_BANDWIDTH: u64 = 32;

    /// Store bandwidth in bytes per cycle.
    pub const STORE_BANDWIDTH: u64 = 16;

    /// Load instructions admitted to the memory interface per cycle.
    pub const LOADS_PER_CYCLE: usize = 2;

    /// Store instructions admitted to the memory interface per cycle.
    pub const STORES_PER_CYCLE: usize = 1;

    /// Combined loads + stores admitted per cycle.
    pub const REQUESTS_PER_CYCLE: usize = 2;

    /// Load/store queue access latency in cycles.
    pub const LSQ_ACCESS_LATENCY: u64 = 1;

    /// Cache line width in bytes (request splitting boundary).
    pub const CACHE_LINE_WIDTH: u64 = 64;

    /// Memory backend access latency in cycles.
    pub const MEMORY_ACCESS_LATENCY: u64 = 2;

    /// Physical general-purpose register count.
    pub const GENERAL_COUNT: u16 = 96;

    /// Physical floating-point register count.
    pub const FLOAT_COUNT: u16 = 96;

    /// Physical predicate register count.
    pub const PREDICATE_COUNT: u16 = 32;

    /// Physical flags register count.
    pub const FLAGS_COUNT: u16 = 32;

    /// Physical system register count.
    pub const SYSTEM_COUNT: u16 = 8;

    /// Physical matrix register count.
    pub const MATRIX_COUNT: u16 = 8;

    /// Streaming vector length in bits.
    pub const STREAMING_VECTOR_LENGTH: u64 = 128;

    /// Reservation station capacity.
    pub const RS_SIZE: usize = 16;

    /// Instructions dispatched into one reservation station per cycle.
    pub const RS_DISPATCH_RATE: usize = 2;
}

/// Instruction set architecture selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum IsaKind {
    /// The bundled RV64I-subset architecture.
    #[default]
    Rv64,
}

/// Core simulation model selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimulationMode {
    /// Single-instruction-per-cycle reference model.
    Emulation,
    /// In-order pipelined model.
    #[serde(rename = "inorderpipelined")]
    InOrderPipelined,
    /// Out-of-order superscalar model.
    #[default]
    #[serde(rename = "outoforder")]
    OutOfOrder,
}

/// Root configuration structure.
///
/// # Examples
///
/// ```
/// use ooo_core::config::Config;
///
/// let config = Config::default().with_default_units();
/// assert_eq!(config.queue_sizes.rob, 32);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Core model and ISA selection.
    pub core: CoreConfig,
    /// Fetch unit parameters.
    pub fetch: FetchConfig,
    /// Inter-stage pipeline buffer widths.
    pub pipeline_widths: PipelineWidths,
    /// Queue capacities (load, store, ROB).
    pub queue_sizes: QueueSizes,
    /// LSQ-to-memory interface bandwidth and request caps.
    pub lsq_memory_interface: LsqMemoryInterface,
    /// Memory hierarchy parameters.
    pub memory_hierarchy: MemoryHierarchy,
    /// One entry per execution unit / issue port.
    pub execution_units: Vec<ExecutionUnitConfig>,
    /// Issue port instruction-group routing. Parallel to `execution_units`.
    pub ports: Vec<PortConfig>,
    /// Reservation station arrangement.
    pub reservation_stations: Vec<ReservationStationConfig>,
    /// Per-group latency/throughput overrides.
    pub latencies: Vec<LatencyConfig>,
    /// Physical register counts per bank.
    pub register_set: RegisterSet,
    /// Host-visible process information emulation.
    pub cpu_info: CpuInfoConfig,
}

impl Config {
    /// Loads and validates a configuration from a JSON string.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every option against its permitted range or set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                key,
                reason: reason.into(),
            }
        }

        if self.fetch.fetch_block_size == 0 || !self.fetch.fetch_block_size.is_power_of_two() {
            return Err(invalid(
                "Fetch.Fetch-Block-Size",
                "must be a non-zero power of two",
            ));
        }
        if self.pipeline_widths.frontend == 0 {
            return Err(invalid("Pipeline-Widths.FrontEnd", "must be non-zero"));
        }
        if self.pipeline_widths.commit == 0 {
            return Err(invalid("Pipeline-Widths.Commit", "must be non-zero"));
        }
        if self.pipeline_widths.lsq_completion == 0 {
            return Err(invalid("Pipeline-Widths.LSQ-Completion", "must be non-zero"));
        }
        if self.queue_sizes.rob == 0 {
            return Err(invalid("Queue-Sizes.ROB", "must be non-zero"));
        }
        if self.queue_sizes.load == 0 || self.queue_sizes.store == 0 {
            return Err(invalid("Queue-Sizes.Load/Store", "must be non-zero"));
        }
        if self.lsq_memory_interface.load_bandwidth == 0
            || self.lsq_memory_interface.store_bandwidth == 0
        {
            return Err(invalid(
                "LSQ-Memory-Interface.Load-Bandwidth/Store-Bandwidth",
                "must be non-zero",
            ));
        }
        if self.lsq_memory_interface.permitted_requests_per_cycle == 0 {
            return Err(invalid(
                "LSQ-Memory-Interface.Permitted-Requests-Per-Cycle",
                "must be non-zero",
            ));
        }
        if !self.memory_hierarchy.cache_line_width.is_power_of_two() {
            return Err(invalid(
                "Memory-Hierarchy.Cache-Line-Width",
                "must be a power of two",
            ));
        }
        if self.execution_units.is_empty() {
            return Err(invalid("Execution-Units", "at least one unit required"));
        }
        if self.ports.len() != self.execution_units.len() {
            return Err(invalid(
                "Ports",
                format!(
                    "expected {} port entries to match Execution-Units, found {}",
                    self.execution_units.len(),
                    self.ports.len()
                ),
            ));
        }
        if self.reservation_stations.is_empty() {
            return Err(invalid(
                "Reservation-Stations",
                "at least one reservation station required",
            ));
        }
        let mut mapped_ports: Vec<u8> = self
            .reservation_stations
            .iter()
            .flat_map(|rs| rs.ports.iter().copied())
            .collect();
        mapped_ports.sort_unstable();
        let expected: Vec<u8> = (0..self.ports.len() as u8).collect();
        if mapped_ports != expected {
            return Err(invalid(
                "Reservation-Stations.Ports",
                "every issue port must map to exactly one reservation station",
            ));
        }
        for rs in &self.reservation_stations {
            if rs.size == 0 || rs.dispatch_rate == 0 {
                return Err(invalid(
                    "Reservation-Stations",
                    "size and dispatch rate must be non-zero",
                ));
            }
        }
        if self.register_set.general_count == 0 || self.register_set.system_count == 0 {
            return Err(invalid(
                "Register-Set",
                "general and system bank counts must be non-zero",
            ));
        }
        if self.core.streaming_vector_length % 128 != 0 {
            return Err(invalid(
                "Core.Streaming-Vector-Length",
                "must be a multiple of 128",
            ));
        }
        if self.core.streaming_vector_length / 64 > self.register_set.matrix_count as u64 {
            return Err(invalid(
                "Core.Streaming-Vector-Length",
                "matrix rows exceed the physical matrix register count",
            ));
        }
        Ok(())
    }
}

/// Core model and ISA selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Architecture collaborator selection.
    pub isa: IsaKind,
    /// Simulation model.
    pub simulation_mode: SimulationMode,
    /// Streaming vector length in bits; sets the matrix register row count.
    pub streaming_vector_length: u64,
    /// Enables per-stage trace output to stderr.
    pub trace: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            isa: IsaKind::default(),
            simulation_mode: SimulationMode::default(),
            streaming_vector_length: defaults::STREAMING_VECTOR_LENGTH,
            trace: false,
        }
    }
}

/// Fetch unit parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Bytes fetched per cycle.
    pub fetch_block_size: u16,
    /// Loop buffer capacity in macro-ops.
    pub loop_buffer_size: u16,
    /// Consecutive identical branch commits before a loop is reported.
    pub loop_detection_threshold: u16,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            fetch_block_size: defaults::FETCH_BLOCK_SIZE,
            loop_buffer_size: defaults::LOOP_BUFFER_SIZE,
            loop_detection_threshold: defaults::LOOP_DETECTION_THRESHOLD,
        }
    }
}

/// Inter-stage pipeline buffer widths.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineWidths {
    /// Frontend width: slots in fetch/decode/rename buffers.
    pub frontend: usize,
    /// Completion slots allocated to the load/store queue.
    pub lsq_completion: usize,
    /// Instructions retired per cycle.
    pub commit: usize,
}

impl Default for PipelineWidths {
    fn default() -> Self {
        Self {
            frontend: defaults::FRONTEND_WIDTH,
            lsq_completion: defaults::LSQ_COMPLETION_SLOTS,
            commit: defaults::COMMIT_WIDTH,
        }
    }
}

/// Queue capacities.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSizes {
    /// Load queue capacity.
    pub load: usize,
    /// Store queue capacity.
    pub store: usize,
    /// Reorder buffer capacity.
    pub rob: usize,
}

impl Default for QueueSizes {
    fn default() -> Self {
        Self {
            load: defaults::LOAD_QUEUE_SIZE,
            store: defaults::STORE_QUEUE_SIZE,
            rob: defaults::ROB_SIZE,
        }
    }
}

/// LSQ-to-memory interface bandwidth and request caps.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LsqMemoryInterface {
    /// Load bandwidth in bytes per cycle.
    pub load_bandwidth: u64,
    /// Store bandwidth in bytes per cycle.
    pub store_bandwidth: u64,
    /// Load instructions admitted per cycle.
    pub permitted_loads_per_cycle: usize,
    /// Store instructions admitted per cycle.
    pub permitted_stores_per_cycle: usize,
    /// Combined loads + stores admitted per cycle.
    pub permitted_requests_per_cycle: usize,
    /// When true, loads and stores cannot coexist in the in-flight set.
    pub exclusive: bool,
    /// Cycles between a request being scheduled and sent to the MMU.
    pub access_latency: u64,
}

impl Default for LsqMemoryInterface {
    fn default() -> Self {
        Self {
            load_bandwidth: defaults::LOAD_BANDWIDTH,
            store_bandwidth: defaults::STORE_BANDWIDTH,
            permitted_loads_per_cycle: defaults::LOADS_PER_CYCLE,
            permitted_stores_per_cycle: defaults::STORES_PER_CYCLE,
            permitted_requests_per_cycle: defaults::REQUESTS_PER_CYCLE,
            exclusive: false,
            access_latency: defaults::LSQ_ACCESS_LATENCY,
        }
    }
}

/// Memory hierarchy parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryHierarchy {
    /// Cache line width in bytes; accesses crossing this boundary are split.
    pub cache_line_width: u64,
    /// Memory backend access latency in cycles.
    pub access_latency: u64,
}

impl Default for MemoryHierarchy {
    fn default() -> Self {
        Self {
            cache_line_width: defaults::CACHE_LINE_WIDTH,
            access_latency: defaults::MEMORY_ACCESS_LATENCY,
        }
    }
}

/// Per-execution-unit semantics.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionUnitConfig {
    /// When true, the unit accepts a new instruction every cycle
    /// (subject to per-group throughput).
    pub pipelined: bool,
    /// Instruction groups that block the unit until completion.
    pub blocking_groups: Vec<u16>,
}

impl Default for ExecutionUnitConfig {
    fn default() -> Self {
        Self {
            pipelined: true,
            blocking_groups: Vec::new(),
        }
    }
}

/// Issue port routing: which instruction groups this port accepts.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// Instruction groups supported by this port.
    pub instruction_group_support: Vec<u16>,
    /// Individual opcodes supported by this port, by name. Overrides the
    /// group routing for matching instructions.
    pub instruction_opcode_support: Vec<String>,
}

/// Reservation station arrangement.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReservationStationConfig {
    /// Station capacity in instructions.
    pub size: usize,
    /// Instructions dispatched into this station per cycle.
    pub dispatch_rate: usize,
    /// Issue ports fed by this station.
    pub ports: Vec<u8>,
}

impl Default for ReservationStationConfig {
    fn default() -> Self {
        Self {
            size: defaults::RS_SIZE,
            dispatch_rate: defaults::RS_DISPATCH_RATE,
            ports: Vec::new(),
        }
    }
}

/// Per-group latency and throughput overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    /// Instruction groups this entry applies to.
    pub instruction_groups: Vec<u16>,
    /// Execution latency in cycles.
    pub execution_latency: u16,
    /// Minimum cycles between successive executions on one pipe.
    pub execution_throughput: u16,
}

/// Physical register counts per bank.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegisterSet {
    /// General-purpose physical register count.
    pub general_count: u16,
    /// Floating-point physical register count.
    pub float_count: u16,
    /// Predicate physical register count.
    pub predicate_count: u16,
    /// Flags physical register count.
    pub flags_count: u16,
    /// System physical register count.
    pub system_count: u16,
    /// Matrix physical register count.
    pub matrix_count: u16,
}

impl RegisterSet {
    /// Physical register count for a bank index.
    pub fn count_for(&self, bank_index: usize) -> u16 {
        match bank_index {
            0 => self.general_count,
            1 => self.float_count,
            2 => self.predicate_count,
            3 => self.flags_count,
            4 => self.system_count,
            5 => self.matrix_count,
            _ => 0,
        }
    }
}

impl Default for RegisterSet {
    fn default() -> Self {
        Self {
            general_count: defaults::GENERAL_COUNT,
            float_count: defaults::FLOAT_COUNT,
            predicate_count: defaults::PREDICATE_COUNT,
            flags_count: defaults::FLAGS_COUNT,
            system_count: defaults::SYSTEM_COUNT,
            matrix_count: defaults::MATRIX_COUNT,
        }
    }
}

/// Host-visible process information emulation.
///
/// Consumed by the OS emulation layer, not the pipeline; carried here so a
/// single config document covers the whole simulator.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CpuInfoConfig {
    /// When true, generate a sysfs-like special directory for the guest.
    pub generate_special_dir: bool,
}

impl Config {
    /// A small three-port default arrangement used when no units are given:
    /// two general-purpose ports and one load/store port.
    pub fn with_default_units(mut self) -> Self {
        use crate::isa::groups;
        if self.execution_units.is_empty() {
            self.execution_units = vec![ExecutionUnitConfig::default(); 3];
            self.ports = vec![
                PortConfig {
                    instruction_group_support: vec![
                        groups::INT_SIMPLE,
                        groups::INT_MUL,
                        groups::INT_DIV,
                        groups::BRANCH,
                        groups::SYSTEM,
                    ],
                    instruction_opcode_support: Vec::new(),
                },
                PortConfig {
                    instruction_group_support: vec![groups::INT_SIMPLE, groups::BRANCH],
                    instruction_opcode_support: Vec::new(),
                },
                PortConfig {
                    instruction_group_support: vec![groups::LOAD, groups::STORE],
                    instruction_opcode_support: Vec::new(),
                },
            ];
            self.reservation_stations = vec![ReservationStationConfig {
                size: defaults::RS_SIZE,
                dispatch_rate: defaults::RS_DISPATCH_RATE,
                ports: vec![0, 1, 2],
            }];
        }
        self
    }
}
