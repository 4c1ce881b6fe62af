//! The pluggable instruction set (§4.5 "ISA is out of scope, decode/
//! execute are pluggable").
//!
//! The original ships three concrete ISA backends (`ISA.mips.cpp`,
//! `ISA.mtalpha.cpp`, `ISA.mtsparc.cpp`) behind a `#if defined(TARGET_*)`
//! compile-time switch. A trait object is the natural Rust replacement for
//! that seam: `Core` is generic over nothing, but holds a `Box<dyn Isa>`
//! chosen once at `Grid::new` time, the same way the teacher's kernel
//! picks its `arch::*` backend at build time rather than at every call
//! site.

use abi::error::SimError;
use abi::regs::{RegAddr, RegType};

/// Raw bits fetched from the I-cache for one instruction.
pub type RawInstruction = u32;

/// The decoded shape of one instruction: which registers it reads, which
/// one (if any) it writes, and what `execute` needs to do the work.
#[derive(Clone, Debug)]
pub struct Decoded {
    pub sources: Vec<RegAddr>,
    pub dest: Option<RegAddr>,
    pub opcode: u32,
    pub immediate: u64,
    pub is_memory_op: bool,
    pub is_control_flow: bool,
}

/// The result of executing a decoded instruction against its operands.
#[derive(Clone, Debug)]
pub struct Executed {
    pub dest: Option<RegAddr>,
    pub value: u64,
    /// For a taken branch or jump: the next PC. `None` means "fall
    /// through" (§4.5 "Execute may redirect Fetch").
    pub redirect_pc: Option<u64>,
    pub memory_address: Option<u64>,
}

/// An instruction-set backend: everything Decode and Execute need that is
/// specific to the simulated architecture rather than to the Microgrid
/// control plane (§4.5 Non-goals: "the instruction set itself").
pub trait Isa {
    fn decode(&self, pc: u64, raw: RawInstruction) -> Result<Decoded, SimError>;

    fn execute(
        &self,
        decoded: &Decoded,
        operands: &[u64],
        pc: u64,
    ) -> Result<Executed, SimError>;
}

/// A minimal ISA used by engine-level tests and as a template for a real
/// backend: four opcodes (ADD, LOADIMM, BRANCH-IF-ZERO, LOAD), enough to
/// exercise every pipeline hazard path without depending on a real target
/// architecture's encoding.
#[derive(Default)]
pub struct TestIsa;

mod opcode {
    pub const ADD: u32 = 0;
    pub const LOADIMM: u32 = 1;
    pub const BEQZ: u32 = 2;
    pub const LOAD: u32 = 3;
}

impl Isa for TestIsa {
    fn decode(&self, pc: u64, raw: RawInstruction) -> Result<Decoded, SimError> {
        let opcode = raw & 0x7;
        let dest_idx = (raw >> 3) & 0x1F;
        let src1_idx = (raw >> 8) & 0x1F;
        let src2_idx = (raw >> 13) & 0x1F;
        let immediate = ((raw >> 18) & 0x3FFF) as u64;

        let dest = RegAddr::new(RegType::Integer, dest_idx);
        let src1 = RegAddr::new(RegType::Integer, src1_idx);
        let src2 = RegAddr::new(RegType::Integer, src2_idx);

        match opcode {
            opcode::ADD => Ok(Decoded {
                sources: vec![src1, src2],
                dest: Some(dest),
                opcode,
                immediate,
                is_memory_op: false,
                is_control_flow: false,
            }),
            opcode::LOADIMM => Ok(Decoded {
                sources: vec![],
                dest: Some(dest),
                opcode,
                immediate,
                is_memory_op: false,
                is_control_flow: false,
            }),
            opcode::BEQZ => Ok(Decoded {
                sources: vec![src1],
                dest: None,
                opcode,
                immediate,
                is_memory_op: false,
                is_control_flow: true,
            }),
            opcode::LOAD => Ok(Decoded {
                sources: vec![src1],
                dest: Some(dest),
                opcode,
                immediate,
                is_memory_op: true,
                is_control_flow: false,
            }),
            other => Err(SimError::IllegalInstruction {
                core: 0,
                pc,
                reason: format!("unknown opcode {other}"),
            }),
        }
    }

    fn execute(&self, decoded: &Decoded, operands: &[u64], pc: u64) -> Result<Executed, SimError> {
        match decoded.opcode {
            opcode::ADD => {
                let value = operands.first().copied().unwrap_or(0)
                    .wrapping_add(operands.get(1).copied().unwrap_or(0));
                Ok(Executed { dest: decoded.dest, value, redirect_pc: None, memory_address: None })
            }
            opcode::LOADIMM => Ok(Executed {
                dest: decoded.dest,
                value: decoded.immediate,
                redirect_pc: None,
                memory_address: None,
            }),
            opcode::BEQZ => {
                let taken = operands.first().copied().unwrap_or(0) == 0;
                let redirect_pc = taken.then(|| pc.wrapping_add(decoded.immediate));
                Ok(Executed { dest: None, value: 0, redirect_pc, memory_address: None })
            }
            opcode::LOAD => {
                let address = operands.first().copied().unwrap_or(0).wrapping_add(decoded.immediate);
                Ok(Executed {
                    dest: decoded.dest,
                    value: 0,
                    redirect_pc: None,
                    memory_address: Some(address),
                })
            }
            other => Err(SimError::IllegalInstruction {
                core: 0,
                pc,
                reason: format!("unknown opcode {other}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_and_executes_add() {
        let isa = TestIsa;
        // opcode=ADD(0), dest=1, src1=2, src2=3
        let raw = opcode::ADD | (1 << 3) | (2 << 8) | (3 << 13);
        let decoded = isa.decode(0, raw).unwrap();
        assert_eq!(decoded.sources.len(), 2);
        let executed = isa.execute(&decoded, &[10, 20], 0).unwrap();
        assert_eq!(executed.value, 30);
    }

    #[test]
    fn branch_redirects_pc_when_taken() {
        let isa = TestIsa;
        let raw = opcode::BEQZ | (0 << 3) | (1 << 8) | (0 << 13) | (4 << 18);
        let decoded = isa.decode(0x100, raw).unwrap();
        let executed = isa.execute(&decoded, &[0], 0x100).unwrap();
        assert_eq!(executed.redirect_pc, Some(0x104));
    }

    #[test]
    fn unknown_opcode_is_illegal_instruction() {
        let isa = TestIsa;
        let err = isa.decode(0, 7).unwrap_err();
        assert!(matches!(err, SimError::IllegalInstruction { .. }));
    }
}
