//! Recovers the semantics of a faulting load/store from raw instruction bytes.
//!
//! Scope (§4.D): single-memory-operand `MOV`/`MOVZX` forms — register-indirect
//! and base+displacement addressing, 1/2/4/8-byte integers, with or without
//! REX/operand-size prefixes — as produced by a C compiler at `-O0`..`-O2`.
//! Sign-extending loads, vector/SIMD accesses, string instructions, and
//! `LOCK`-prefixed forms are out of scope and report [`DecodeError::Unsupported`].
//!
//! The faulting address itself is *not* recovered here: the OS hands it to the
//! trap handler directly as `siginfo_t.si_addr`. This crate only has to work
//! out which register is the source/destination and how many bytes move.

use iced_x86::{Code, Decoder, DecoderOptions, Instruction, Mnemonic, OpKind};

// Re-exported so downstream crates (the trap handler maps these onto gregs
// indices) can name the register enum without a direct iced-x86 dependency.
pub use iced_x86::Register;

/// Architectural cap on an x86 instruction's encoded length.
pub const MAX_INSTRUCTION_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty instruction byte window")]
    EmptyInput,
    #[error("instruction byte window ended before a complete instruction was decoded")]
    UnexpectedEof,
    #[error("byte window does not contain a valid x86-64 instruction")]
    InvalidInstruction,
    #[error("instruction form is not a supported single-memory-operand move")]
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Load,
    Store,
}

/// Which bits of the destination GPR a sub-word load writes, and which are
/// left untouched (§4.D edge case table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteWidth {
    /// Only the low 8 bits change; bits 8..64 are preserved.
    Byte,
    /// Only the low 16 bits change; bits 16..64 are preserved.
    Word,
    /// The low 32 bits change; bits 32..64 are zeroed (x86-64 implicit
    /// zero-extension of 32-bit destinations).
    DWordZeroExtend,
    /// All 64 bits change.
    QWord,
}

impl WriteWidth {
    fn for_register(reg: Register) -> Option<Self> {
        // The legacy high-byte registers (AH/BH/CH/DH) address bits 8..16 of
        // their parent register rather than bits 0..8; the trap handler's
        // register file access only models the low-byte/word/dword/qword
        // slots, so these are out of scope rather than silently mishandled.
        if is_high_byte_register(reg) {
            return None;
        }
        Some(match reg.size() {
            1 => WriteWidth::Byte,
            2 => WriteWidth::Word,
            4 => WriteWidth::DWordZeroExtend,
            8 => WriteWidth::QWord,
            _ => return None,
        })
    }
}

fn is_high_byte_register(reg: Register) -> bool {
    matches!(reg, Register::AH | Register::BH | Register::CH | Register::DH)
}

/// The CPU register a `LOAD` writes into, or a `STORE` reads its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegSlot {
    pub reg: Register,
    pub write_width: WriteWidth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    pub direction: Direction,
    /// Bytes transferred over the bus: 1, 2, 4, or 8.
    pub width: u8,
    pub reg_slot: RegSlot,
    /// Address to resume execution at after the synthetic load/store completes.
    pub post_pc: u64,
    pub len: u8,
}

/// Decodes the instruction at `pc` from `bytes` (the bytes at `pc` in the
/// faulting process's own code pages) and classifies it per the scope above.
pub fn decode(pc: u64, bytes: &[u8]) -> Result<Decoded, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::EmptyInput);
    }

    let mut decoder = Decoder::with_ip(64, bytes, pc, DecoderOptions::NONE);
    let ins: Instruction = decoder.decode();
    let consumed = (decoder.ip().wrapping_sub(pc)) as usize;

    if ins.code() == Code::INVALID {
        if consumed >= bytes.len() && bytes.len() < MAX_INSTRUCTION_LEN {
            return Err(DecodeError::UnexpectedEof);
        }
        return Err(DecodeError::InvalidInstruction);
    }

    if ins.has_lock_prefix() {
        return Err(DecodeError::Unsupported);
    }

    let len = ins.len();
    if len == 0 || len > MAX_INSTRUCTION_LEN {
        return Err(DecodeError::InvalidInstruction);
    }

    let (direction, reg) = match ins.mnemonic() {
        Mnemonic::Mov | Mnemonic::Movzx if ins.op_count() == 2 => {
            match (ins.op0_kind(), ins.op1_kind()) {
                (OpKind::Register, OpKind::Memory) => (Direction::Load, ins.op0_register()),
                (OpKind::Memory, OpKind::Register) => (Direction::Store, ins.op1_register()),
                _ => return Err(DecodeError::Unsupported),
            }
        }
        _ => return Err(DecodeError::Unsupported),
    };

    let mem_size = ins.memory_size();
    let width = mem_size.size();
    if !matches!(width, 1 | 2 | 4 | 8) {
        return Err(DecodeError::Unsupported);
    }

    // MOVZX's destination is always wider than its memory operand; the bus
    // transaction width is the memory operand's width, not the register's.
    let write_width = WriteWidth::for_register(reg).ok_or(DecodeError::Unsupported)?;

    Ok(Decoded {
        direction,
        width: width as u8,
        reg_slot: RegSlot { reg, write_width },
        post_pc: pc.wrapping_add(len as u64),
        len: len as u8,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_32bit_register_indirect_load_zero_extends() {
        // mov eax, dword ptr [rbx]
        let bytes = [0x8B, 0x03];
        let d = decode(0x1000, &bytes).expect("decode");
        assert_eq!(d.direction, Direction::Load);
        assert_eq!(d.width, 4);
        assert_eq!(d.reg_slot.reg, Register::EAX);
        assert_eq!(d.reg_slot.write_width, WriteWidth::DWordZeroExtend);
        assert_eq!(d.post_pc, 0x1000 + bytes.len() as u64);
    }

    #[test]
    fn decodes_64bit_base_plus_disp_load() {
        // mov rax, qword ptr [rbx+0x10]
        let bytes = [0x48, 0x8B, 0x43, 0x10];
        let d = decode(0, &bytes).expect("decode");
        assert_eq!(d.direction, Direction::Load);
        assert_eq!(d.width, 8);
        assert_eq!(d.reg_slot.reg, Register::RAX);
        assert_eq!(d.reg_slot.write_width, WriteWidth::QWord);
        assert_eq!(d.len as usize, bytes.len());
    }

    #[test]
    fn decodes_byte_store_preserving_upper_bits() {
        // mov byte ptr [rax], bl
        let bytes = [0x88, 0x18];
        let d = decode(0, &bytes).expect("decode");
        assert_eq!(d.direction, Direction::Store);
        assert_eq!(d.width, 1);
        assert_eq!(d.reg_slot.reg, Register::BL);
        assert_eq!(d.reg_slot.write_width, WriteWidth::Byte);
    }

    #[test]
    fn decodes_16bit_store_with_operand_size_prefix() {
        // 66 89 18 => mov word ptr [rax], bx
        let bytes = [0x66, 0x89, 0x18];
        let d = decode(0, &bytes).expect("decode");
        assert_eq!(d.direction, Direction::Store);
        assert_eq!(d.width, 2);
        assert_eq!(d.reg_slot.reg, Register::BX);
        assert_eq!(d.reg_slot.write_width, WriteWidth::Word);
        assert_eq!(d.len, 3);
    }

    #[test]
    fn decodes_movzx_byte_to_32bit_register() {
        // 0f b6 00 => movzx eax, byte ptr [rax]
        let bytes = [0x0F, 0xB6, 0x00];
        let d = decode(0, &bytes).expect("decode");
        assert_eq!(d.direction, Direction::Load);
        assert_eq!(d.width, 1, "bus transaction moves only the 1-byte source");
        assert_eq!(d.reg_slot.reg, Register::EAX);
        assert_eq!(
            d.reg_slot.write_width,
            WriteWidth::DWordZeroExtend,
            "32-bit destination still zero-extends to 64 bits"
        );
    }

    #[test]
    fn decodes_movzx_word_to_16bit_register_preserves_upper_bits() {
        // 66 0f b7 00 => movzx ax, word ptr [rax]
        let bytes = [0x66, 0x0F, 0xB7, 0x00];
        let d = decode(0, &bytes).expect("decode");
        assert_eq!(d.width, 2);
        assert_eq!(d.reg_slot.reg, Register::AX);
        assert_eq!(d.reg_slot.write_width, WriteWidth::Word);
    }

    #[test]
    fn rejects_sign_extending_load() {
        // 0f be 00 => movsx eax, byte ptr [rax]
        let bytes = [0x0F, 0xBE, 0x00];
        assert_eq!(decode(0, &bytes), Err(DecodeError::Unsupported));
    }

    #[test]
    fn rejects_vector_access() {
        // 0f 10 00 => movups xmm0, [rax]
        let bytes = [0x0F, 0x10, 0x00];
        assert_eq!(decode(0, &bytes), Err(DecodeError::Unsupported));
    }

    #[test]
    fn rejects_register_to_register_mov() {
        // mov rax, rbx (no memory operand at all)
        let bytes = [0x48, 0x89, 0xD8];
        assert_eq!(decode(0, &bytes), Err(DecodeError::Unsupported));
    }

    #[test]
    fn rejects_lock_prefixed_form() {
        // f0 01 03 => lock add dword ptr [rbx], eax
        let bytes = [0xF0, 0x01, 0x03];
        assert_eq!(decode(0, &bytes), Err(DecodeError::Unsupported));
    }

    #[test]
    fn rejects_high_byte_register_destination() {
        // mov ah, byte ptr [rax]
        let bytes = [0x8A, 0x20];
        assert_eq!(decode(0, &bytes), Err(DecodeError::Unsupported));
    }

    #[test]
    fn rejects_empty_input() {
        assert_eq!(decode(0, &[]), Err(DecodeError::EmptyInput));
    }

    #[test]
    fn truncated_instruction_reports_eof_not_invalid() {
        // 48 8b (REX.W + MOV opcode) with the modrm/disp bytes missing.
        let bytes = [0x48, 0x8B];
        assert_eq!(decode(0, &bytes), Err(DecodeError::UnexpectedEof));
    }

    #[test]
    fn never_reports_a_length_over_the_architectural_cap() {
        let bytes = [0x66u8; MAX_INSTRUCTION_LEN];
        // An instruction built entirely from operand-size-override bytes is
        // invalid (no opcode byte within the length cap), not merely truncated.
        assert_eq!(decode(0x2000, &bytes), Err(DecodeError::InvalidInstruction));
    }
}
