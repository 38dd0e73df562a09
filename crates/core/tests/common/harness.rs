use ooo_core::branch::{BranchPredictor, StaticPredictor};
use ooo_core::common::{Register, RegisterValue};
use ooo_core::config::Config;
use ooo_core::core::{Core, CoreStatus, CpuContext};
use ooo_core::isa::rv64::Rv64Architecture;
use ooo_core::isa::Architecture;
use ooo_core::memory::{FixedLatencyMemory, IdentityPageTable};

/// Memory backing test programs.
const MEMORY_SIZE: usize = 64 * 1024;

/// Builder for a runnable core with a program image in place.
pub struct TestContextBuilder {
    config: Config,
    program: Vec<u32>,
    data: Vec<(u64, Vec<u8>)>,
    predictor: Option<Box<dyn BranchPredictor>>,
}

impl TestContextBuilder {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self {
            config: Config::default().with_default_units(),
            program: Vec::new(),
            data: Vec::new(),
            predictor: None,
        }
    }

    /// Adjusts the configuration before the core is built.
    pub fn configure(mut self, f: impl FnOnce(&mut Config)) -> Self {
        f(&mut self.config);
        self
    }

    /// Sets the program, loaded at address 0.
    pub fn program(mut self, instructions: &[u32]) -> Self {
        self.program = instructions.to_vec();
        self
    }

    /// Preloads raw bytes into memory.
    pub fn data(mut self, addr: u64, bytes: &[u8]) -> Self {
        self.data.push((addr, bytes.to_vec()));
        self
    }

    /// Overrides the default static (not-taken) predictor.
    pub fn predictor(mut self, predictor: Box<dyn BranchPredictor>) -> Self {
        self.predictor = Some(predictor);
        self
    }

    pub fn build(self) -> TestContext {
        let mut memory =
            FixedLatencyMemory::new(MEMORY_SIZE, self.config.memory_hierarchy.access_latency);
        let image: Vec<u8> = self.program.iter().flat_map(|w| w.to_le_bytes()).collect();
        memory.load_image(0, &image);
        for (addr, bytes) in &self.data {
            memory.load_image(*addr, bytes);
        }

        let arch = Rv64Architecture::new(&self.config);
        let arch_counts = arch.architectural_register_counts();
        let predictor = self
            .predictor
            .unwrap_or_else(|| Box::new(StaticPredictor));

        let mut core = Core::new(
            &self.config,
            Box::new(arch),
            predictor,
            Box::new(memory),
            Box::new(IdentityPageTable::new(MEMORY_SIZE as u64)),
        )
        .expect("test configuration must be valid");

        core.schedule(CpuContext {
            tid: 1,
            pc: 0,
            program_byte_length: image.len() as u64,
            register_file: arch_counts
                .iter()
                .map(|&count| vec![RegisterValue::default(); count as usize])
                .collect(),
        });

        TestContext { core }
    }
}

/// A running core plus assertion helpers.
pub struct TestContext {
    pub core: Core,
}

impl TestContext {
    pub fn builder() -> TestContextBuilder {
        TestContextBuilder::new()
    }

    /// Runs for up to `cycles`, stopping early on halt.
    pub fn run(&mut self, cycles: u64) {
        for _ in 0..cycles {
            self.core.tick();
            if self.core.status() == CoreStatus::Halted {
                break;
            }
        }
    }

    /// Reads general-purpose register `x<tag>`.
    pub fn reg(&self, tag: u16) -> u64 {
        self.core.read_arch_register(Register::general(tag)).as_u64()
    }

    /// Writes general-purpose register `x<tag>`.
    pub fn set_reg(&mut self, tag: u16, value: u64) {
        self.core
            .write_arch_register(Register::general(tag), RegisterValue::from_u64(value));
    }

    /// Looks up one statistic by key.
    pub fn stat(&self, key: &str) -> u64 {
        self.core
            .stats()
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.parse().ok())
            .unwrap_or_else(|| panic!("missing numeric stat {}", key))
    }
}
