//! End-to-end pipeline scenarios.

use crate::common::harness::TestContext;
use crate::common::mocks::{FailingWriteMemory, MockPageTable};

use ooo_core::branch::{BimodalPredictor, StaticPredictor};
use ooo_core::common::Register;
use ooo_core::config::Config;
use ooo_core::core::{Core, CoreStatus, CpuContext};
use ooo_core::isa::rv64::{asm, Rv64Architecture};
use ooo_core::isa::{groups, Architecture};
use ooo_core::memory::{FixedLatencyMemory, Translation};

/// Straight-line dependent add chain: x1 = x0 + 1 ... x10 = x9 + 1.
#[test]
fn straight_line_add_chain() {
    let program: Vec<u32> = (0..10).map(|i| asm::addi(i + 1, i, 1)).collect();
    let mut ctx = TestContext::builder().program(&program).build();
    ctx.run(300);

    assert_eq!(ctx.reg(10), 10);
    assert_eq!(ctx.core.instructions_retired(), 10);
    assert_eq!(ctx.stat("flushes"), 0);
    assert_eq!(ctx.stat("lsq.loadViolations"), 0);
}

/// A taken branch against a not-taken predictor: one misprediction, one
/// flush, and the skipped instruction never commits.
#[test]
fn taken_branch_mispredicts_and_recovers() {
    let program = vec![
        asm::beq(0, 0, 8),     // 0x0: always taken, predicted not-taken
        asm::addi(1, 0, 99),   // 0x4: skipped
        asm::addi(1, 0, 7),    // 0x8: target
    ];
    let mut ctx = TestContext::builder().program(&program).build();
    ctx.run(300);

    assert_eq!(ctx.reg(1), 7);
    assert!(ctx.stat("flushes") >= 1);
    assert_eq!(ctx.stat("branch.executed"), 1);
    assert_eq!(ctx.stat("branch.mispredict"), 1);
}

/// Store followed by an overlapping load: committed values match sequential
/// semantics.
#[test]
fn store_load_raw_through_lsq() {
    let program = vec![
        asm::sd(5, 10, 0), // str x5, [x10]
        asm::ld(6, 10, 0), // ldr x6, [x10]
    ];
    let mut ctx = TestContext::builder().program(&program).build();
    ctx.set_reg(5, 0xDEAD);
    ctx.set_reg(10, 0x100);
    ctx.run(300);

    assert_eq!(ctx.reg(6), 0xDEAD);
    assert_eq!(ctx.core.instructions_retired(), 2);
}

/// An 8-byte store at 0x3C crosses the 64-byte line; the split write reads
/// back intact.
#[test]
fn split_store_across_cache_lines() {
    let program = vec![asm::sd(5, 10, 0), asm::ld(6, 10, 0)];
    let mut ctx = TestContext::builder().program(&program).build();
    ctx.set_reg(5, 0x1122_3344_5566_7788);
    ctx.set_reg(10, 0x3C);
    ctx.run(300);

    assert_eq!(ctx.reg(6), 0x1122_3344_5566_7788);
}

/// Eight long-latency divides against a four-entry ROB: rename stalls but
/// everything retires in order without livelock.
#[test]
fn rob_full_backpressure() {
    let program: Vec<u32> = (0..8).map(|i| asm::div(3 + i, 1, 2)).collect();
    let mut ctx = TestContext::builder()
        .configure(|config| {
            config.queue_sizes.rob = 4;
            config.latencies.push(ooo_core::config::LatencyConfig {
                instruction_groups: vec![groups::INT_DIV],
                execution_latency: 20,
                execution_throughput: 20,
            });
        })
        .program(&program)
        .build();
    ctx.set_reg(1, 100);
    ctx.set_reg(2, 5);
    ctx.run(2000);

    assert_eq!(ctx.core.instructions_retired(), 8);
    for i in 0..8 {
        assert_eq!(ctx.reg(3 + i), 20);
    }
    assert!(ctx.stat("rename.robStalls") >= 4);
}

/// Interrupt mid-run: the core drains, parks idle, and resumes a newly
/// scheduled context.
#[test]
fn context_switch_drains_and_resumes() {
    let program: Vec<u32> = (0..120).map(|_| asm::addi(1, 1, 1)).collect();
    let mut ctx = TestContext::builder()
        .configure(|config| config.lsq_memory_interface.exclusive = true)
        .program(&program)
        .build();

    // Run until at least 100 instructions have retired.
    while ctx.core.instructions_retired() < 100 {
        ctx.core.tick();
        assert!(ctx.core.ticks() < 2000, "chain did not make progress");
    }

    assert!(ctx.core.interrupt());
    assert_eq!(ctx.core.status(), CoreStatus::Switching);

    // Drain to idle.
    while ctx.core.status() == CoreStatus::Switching {
        ctx.core.tick();
        assert!(ctx.core.ticks() < 4000, "drain did not converge");
    }
    assert_eq!(ctx.core.status(), CoreStatus::Idle);
    assert!(ctx.core.pipeline_empty());
    assert!(!ctx.core.has_pending_memory_requests());

    // Resume with a fresh context on another thread id.
    let retired_before = ctx.core.instructions_retired();
    let mut context = ctx.core.current_context();
    context.tid = 2;
    context.pc = 0;
    context.program_byte_length = (program.len() * 4) as u64;
    ctx.core.schedule(context);
    assert_eq!(ctx.core.status(), CoreStatus::Executing);

    ctx.run(400);
    assert!(ctx.core.instructions_retired() > retired_before);
}

/// A load that executed speculatively before an older store's address was
/// known is caught at store commit and re-executed.
#[test]
fn memory_order_violation_flushes_and_reexecutes() {
    let program = vec![
        asm::div(10, 1, 2), // x10 = 0x200 / 2 = 0x100, slowly
        asm::sd(5, 10, 0),  // store to 0x100 once the address resolves
        asm::ld(6, 20, 0),  // overlapping load issues long before
    ];
    let mut ctx = TestContext::builder()
        .configure(|config| {
            config.latencies.push(ooo_core::config::LatencyConfig {
                instruction_groups: vec![groups::INT_DIV],
                execution_latency: 20,
                execution_throughput: 20,
            });
        })
        .program(&program)
        .build();
    ctx.set_reg(1, 0x200);
    ctx.set_reg(2, 2);
    ctx.set_reg(5, 0xABCD);
    ctx.set_reg(20, 0x100);
    ctx.run(1000);

    assert_eq!(ctx.stat("lsq.loadViolations"), 1);
    assert!(ctx.stat("flushes") >= 1);
    // The re-executed load observes the store's value.
    assert_eq!(ctx.reg(6), 0xABCD);
}

/// Load-reserved / store-conditional success path.
#[test]
fn store_conditional_success() {
    let program = vec![
        asm::lr_d(5, 10),    // x5 = [x10]
        asm::sc_d(6, 10, 9), // [x10] = x9, x6 = 0 on success
        asm::ld(7, 10, 0),   // read back
    ];
    let mut ctx = TestContext::builder()
        .program(&program)
        .data(0x100, &17u64.to_le_bytes())
        .build();
    ctx.set_reg(9, 42);
    ctx.set_reg(10, 0x100);
    ctx.run(400);

    assert_eq!(ctx.reg(5), 17);
    assert_eq!(ctx.reg(6), 0, "store-conditional should succeed");
    assert_eq!(ctx.reg(7), 42);
}

/// A failed store-conditional write reports 1 in the result register.
#[test]
fn store_conditional_failure() {
    let program = vec![asm::sc_d(6, 10, 9)];
    let image: Vec<u8> = program.iter().flat_map(|w| w.to_le_bytes()).collect();

    let config = Config::default().with_default_units();
    let mut memory = FixedLatencyMemory::new(0x10000, 1);
    memory.load_image(0, &image);
    let backend = FailingWriteMemory::new(memory, vec![0x100]);

    let arch = Rv64Architecture::new(&config);
    let arch_counts = arch.architectural_register_counts();
    let mut core = Core::new(
        &config,
        Box::new(arch),
        Box::new(StaticPredictor),
        Box::new(backend),
        Box::new(ooo_core::memory::IdentityPageTable::new(0x10000)),
    )
    .unwrap();
    core.schedule(CpuContext {
        tid: 1,
        pc: 0,
        program_byte_length: image.len() as u64,
        register_file: arch_counts
            .iter()
            .map(|&count| vec![Default::default(); count as usize])
            .collect(),
    });
    core.write_arch_register(
        Register::general(9),
        ooo_core::common::RegisterValue::from_u64(1),
    );
    core.write_arch_register(
        Register::general(10),
        ooo_core::common::RegisterValue::from_u64(0x100),
    );

    for _ in 0..400 {
        core.tick();
    }
    assert_eq!(core.instructions_retired(), 1);
    assert_eq!(core.read_arch_register(Register::general(6)).as_u64(), 1);
}

/// A data access outside the mapped range aborts and halts the core at
/// retirement.
#[test]
fn data_abort_halts_at_retirement() {
    let program = vec![asm::ld(1, 10, 0)];
    let image: Vec<u8> = program.iter().flat_map(|w| w.to_le_bytes()).collect();

    let config = Config::default().with_default_units();
    let mut memory = FixedLatencyMemory::new(0x10000, 1);
    memory.load_image(0, &image);

    let mut page_table = MockPageTable::new();
    page_table.expect_translate().returning(|vaddr, _| {
        if vaddr < 0x1000 {
            Translation::Mapped(vaddr)
        } else {
            Translation::DataAbort
        }
    });

    let arch = Rv64Architecture::new(&config);
    let arch_counts = arch.architectural_register_counts();
    let mut core = Core::new(
        &config,
        Box::new(arch),
        Box::new(StaticPredictor),
        Box::new(memory),
        Box::new(page_table),
    )
    .unwrap();
    core.schedule(CpuContext {
        tid: 1,
        pc: 0,
        program_byte_length: image.len() as u64,
        register_file: arch_counts
            .iter()
            .map(|&count| vec![Default::default(); count as usize])
            .collect(),
    });
    core.write_arch_register(
        Register::general(10),
        ooo_core::common::RegisterValue::from_u64(0x8000),
    );

    for _ in 0..400 {
        core.tick();
        if core.status() == CoreStatus::Halted {
            break;
        }
    }
    assert_eq!(core.status(), CoreStatus::Halted);
    assert!(core.exit_code().is_none());
}

/// A getpid syscall applies its register state change and execution resumes
/// at the following instruction.
#[test]
fn syscall_state_change_resumes() {
    let program = vec![
        asm::addi(17, 0, 172), // a7 = getpid
        asm::ecall(),
        asm::addi(5, 0, 1), // runs after the handler resumes
    ];
    let mut ctx = TestContext::builder().program(&program).build();
    ctx.run(400);

    assert_eq!(ctx.reg(10), 1, "getpid writes a0");
    assert_eq!(ctx.reg(5), 1, "execution resumed past the ecall");
}

/// A program image written to disk round-trips through the driver load
/// path and executes.
#[test]
fn program_image_loads_from_disk() {
    use std::io::Write;

    let program = vec![asm::addi(1, 0, 5), asm::addi(2, 1, 3)];
    let image: Vec<u8> = program.iter().flat_map(|w| w.to_le_bytes()).collect();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&image).unwrap();

    let bytes = std::fs::read(file.path()).unwrap();
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();

    let mut ctx = TestContext::builder().program(&words).build();
    ctx.run(200);
    assert_eq!(ctx.reg(1), 5);
    assert_eq!(ctx.reg(2), 8);
}

/// An exit syscall halts with the requested status.
#[test]
fn exit_syscall_reports_status() {
    let program = vec![
        asm::addi(17, 0, 93), // a7 = exit
        asm::addi(10, 0, 7),  // a0 = status
        asm::ecall(),
    ];
    let mut ctx = TestContext::builder().program(&program).build();
    ctx.run(400);

    assert_eq!(ctx.core.status(), CoreStatus::Halted);
    assert_eq!(ctx.core.exit_code(), Some(7));
}

/// A tight countdown loop under a learning predictor: once the branch
/// settles, the loop is detected, the fetch loop buffer replays the body,
/// and the final values still match sequential semantics.
#[test]
fn tight_loop_detection_and_replay() {
    // x1 counts down from 50; x2 accumulates.
    let program = vec![
        asm::addi(1, 0, 50), // 0x0
        asm::addi(2, 2, 1),  // 0x4: loop body
        asm::addi(1, 1, -1), // 0x8
        asm::bne(1, 0, -8),  // 0xC: back to 0x4
        asm::addi(3, 0, 9),  // 0x10: after loop
    ];
    let mut ctx = TestContext::builder()
        .configure(|config| config.fetch.loop_detection_threshold = 4)
        .predictor(Box::new(BimodalPredictor::new(64)))
        .program(&program)
        .build();
    ctx.run(4000);

    assert_eq!(ctx.reg(2), 50);
    assert_eq!(ctx.reg(3), 9);
    assert_eq!(ctx.reg(1), 0);
}
