//! CPU backend seam.
//!
//! The scheduler only needs to run a CPU for a number of cycles, switch its
//! execution backend and snapshot it; instruction semantics live behind the
//! [`Cpu`] trait. [`ReferenceCpu`] is a minimal implementation used by the
//! headless binary and the scheduler tests.

use crate::bus::Bus;
use crate::error::SnapshotError;
use crate::mmio::AccessWidth;
use crate::snapshot::{StateReader, StateWriter, TAG_CPU};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// How a CPU executes guest code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuBackendKind {
    Interpreter,
    CachedInterpreter,
    Recompiler,
}

impl CpuBackendKind {
    /// Encoding used by atomics and snapshots.
    pub fn to_u8(self) -> u8 {
        match self {
            CpuBackendKind::Interpreter => 0,
            CpuBackendKind::CachedInterpreter => 1,
            CpuBackendKind::Recompiler => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CpuBackendKind::Interpreter),
            1 => Some(CpuBackendKind::CachedInterpreter),
            2 => Some(CpuBackendKind::Recompiler),
            _ => None,
        }
    }
}

impl fmt::Display for CpuBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CpuBackendKind::Interpreter => "interpreter",
            CpuBackendKind::CachedInterpreter => "cached-interpreter",
            CpuBackendKind::Recompiler => "recompiler",
        };
        f.write_str(name)
    }
}

impl FromStr for CpuBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "interpreter" => Ok(CpuBackendKind::Interpreter),
            "cached-interpreter" | "cached" => Ok(CpuBackendKind::CachedInterpreter),
            "recompiler" | "jit" => Ok(CpuBackendKind::Recompiler),
            other => Err(format!("unknown CPU backend '{}'", other)),
        }
    }
}

/// Monotonic execution counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    pub cycles_executed: u64,
    pub instructions_interpreted: u64,
    pub exceptions_raised: u64,
    pub interrupts_serviced: u64,
    pub code_cache_blocks_executed: u64,
    pub code_cache_instructions_executed: u64,
}

impl ExecutionStats {
    /// Counter increase since `earlier`.
    pub fn since(&self, earlier: &ExecutionStats) -> ExecutionStats {
        ExecutionStats {
            cycles_executed: self.cycles_executed.saturating_sub(earlier.cycles_executed),
            instructions_interpreted: self
                .instructions_interpreted
                .saturating_sub(earlier.instructions_interpreted),
            exceptions_raised: self.exceptions_raised.saturating_sub(earlier.exceptions_raised),
            interrupts_serviced: self.interrupts_serviced.saturating_sub(earlier.interrupts_serviced),
            code_cache_blocks_executed: self
                .code_cache_blocks_executed
                .saturating_sub(earlier.code_cache_blocks_executed),
            code_cache_instructions_executed: self
                .code_cache_instructions_executed
                .saturating_sub(earlier.code_cache_instructions_executed),
        }
    }

    /// Instructions retired by any backend.
    pub fn instructions(&self) -> u64 {
        self.instructions_interpreted + self.code_cache_instructions_executed
    }
}

/// A guest CPU.
pub trait Cpu {
    fn reset(&mut self);

    fn backend(&self) -> CpuBackendKind;

    fn supports_backend(&self, kind: CpuBackendKind) -> bool;

    /// Switch backend. Returns `false` (and keeps the current one) if `kind`
    /// is not supported.
    fn set_backend(&mut self, kind: CpuBackendKind) -> bool;

    /// Run for up to `cycles` cycles and return how many were executed.
    fn execute(&mut self, bus: &Bus, cycles: u64) -> u64;

    /// Drop any translated code.
    fn flush_code_cache(&mut self);

    fn stats(&self) -> ExecutionStats;

    fn save_state(&self, writer: &mut StateWriter) -> Result<(), SnapshotError>;

    fn load_state(&mut self, reader: &mut StateReader<'_>) -> Result<(), SnapshotError>;
}

/// Real-mode reset vector (F000:FFF0).
pub const RESET_VECTOR: u32 = 0xFFFF0;

/// Longest run of bytes a cached block covers.
const MAX_BLOCK_LEN: u32 = 16;
const BLOCK_CACHE_SIZE: usize = 1024;

#[derive(Debug, Clone)]
struct CachedBlock {
    len: u32,
    checksum: u32,
    generation: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReferenceCpuState {
    pc: u32,
    backend: CpuBackendKind,
    checksum: u32,
}

/// Stand-in CPU: every cycle fetches and retires one byte at `pc`.
///
/// The cached-interpreter backend groups fetches from cacheable memory into
/// blocks keyed by start address, invalidated by generation on flush.
#[derive(Debug)]
pub struct ReferenceCpu {
    pc: u32,
    backend: CpuBackendKind,
    /// Running sum of fetched bytes, so fetched code is observable.
    checksum: u32,
    blocks: HashMap<u32, CachedBlock>,
    generation: u32,
    stats: ExecutionStats,
}

impl ReferenceCpu {
    pub fn new(backend: CpuBackendKind) -> Self {
        let mut cpu = Self {
            pc: RESET_VECTOR,
            backend: CpuBackendKind::Interpreter,
            checksum: 0,
            blocks: HashMap::with_capacity(BLOCK_CACHE_SIZE),
            generation: 0,
            stats: ExecutionStats::default(),
        };
        if !cpu.set_backend(backend) {
            log::warn!("[CPU] Backend {} unsupported, using interpreter", backend);
        }
        cpu
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    pub fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    fn interpret_one(&mut self, bus: &Bus) {
        let opcode = bus.fetch_memory(self.pc, AccessWidth::Byte) as u8;
        self.checksum = self.checksum.wrapping_add(opcode as u32);
        self.pc = self.pc.wrapping_add(1);
        self.stats.instructions_interpreted += 1;
    }

    fn compile_block(&mut self, bus: &Bus, start: u32) -> Option<CachedBlock> {
        let mut len = 0;
        let mut checksum = 0u32;
        while len < MAX_BLOCK_LEN && bus.is_cacheable(start.wrapping_add(len)) {
            let byte = bus.fetch_memory(start.wrapping_add(len), AccessWidth::Byte) as u8;
            checksum = checksum.wrapping_add(byte as u32);
            len += 1;
        }
        if len == 0 {
            return None;
        }

        if self.blocks.len() >= BLOCK_CACHE_SIZE {
            let generation = self.generation;
            self.blocks.retain(|_, b| b.generation == generation);
            if self.blocks.len() >= BLOCK_CACHE_SIZE {
                self.blocks.clear();
            }
        }
        let block = CachedBlock {
            len,
            checksum,
            generation: self.generation,
        };
        self.blocks.insert(start, block.clone());
        Some(block)
    }

    fn lookup_block(&mut self, bus: &Bus) -> Option<CachedBlock> {
        match self.blocks.get(&self.pc) {
            Some(block) if block.generation == self.generation => Some(block.clone()),
            _ => self.compile_block(bus, self.pc),
        }
    }

    fn execute_cached(&mut self, bus: &Bus, cycles: u64) -> u64 {
        let mut executed = 0;
        while executed < cycles {
            match self.lookup_block(bus) {
                Some(block) if block.len as u64 <= cycles - executed => {
                    self.checksum = self.checksum.wrapping_add(block.checksum);
                    self.pc = self.pc.wrapping_add(block.len);
                    self.stats.code_cache_blocks_executed += 1;
                    self.stats.code_cache_instructions_executed += block.len as u64;
                    executed += block.len as u64;
                }
                _ => {
                    self.interpret_one(bus);
                    executed += 1;
                }
            }
        }
        executed
    }
}

impl Cpu for ReferenceCpu {
    fn reset(&mut self) {
        self.pc = RESET_VECTOR;
        self.checksum = 0;
        self.flush_code_cache();
    }

    fn backend(&self) -> CpuBackendKind {
        self.backend
    }

    fn supports_backend(&self, kind: CpuBackendKind) -> bool {
        matches!(kind, CpuBackendKind::Interpreter | CpuBackendKind::CachedInterpreter)
    }

    fn set_backend(&mut self, kind: CpuBackendKind) -> bool {
        if !self.supports_backend(kind) {
            return false;
        }
        if kind != self.backend {
            log::info!("[CPU] Switching to {} backend", kind);
            self.backend = kind;
            self.flush_code_cache();
        }
        true
    }

    fn execute(&mut self, bus: &Bus, cycles: u64) -> u64 {
        let executed = match self.backend {
            CpuBackendKind::CachedInterpreter => self.execute_cached(bus, cycles),
            _ => {
                for _ in 0..cycles {
                    self.interpret_one(bus);
                }
                cycles
            }
        };
        self.stats.cycles_executed += executed;
        executed
    }

    fn flush_code_cache(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        log::debug!("[CPU] Code cache flushed (generation {})", self.generation);
    }

    fn stats(&self) -> ExecutionStats {
        self.stats
    }

    fn save_state(&self, writer: &mut StateWriter) -> Result<(), SnapshotError> {
        writer.write_section(
            TAG_CPU,
            &ReferenceCpuState {
                pc: self.pc,
                backend: self.backend,
                checksum: self.checksum,
            },
        )
    }

    fn load_state(&mut self, reader: &mut StateReader<'_>) -> Result<(), SnapshotError> {
        let state: ReferenceCpuState = reader.read_section(TAG_CPU)?;
        if !self.supports_backend(state.backend) {
            return Err(SnapshotError::Invalid(format!(
                "CPU backend {} not supported",
                state.backend
            )));
        }
        self.pc = state.pc;
        self.checksum = state.checksum;
        self.set_backend(state.backend);
        self.flush_code_cache();
        Ok(())
    }
}
