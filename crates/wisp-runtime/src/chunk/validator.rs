//! Bytecode validator
//!
//! A belt-and-suspenders internal consistency check run once after
//! compilation (debug builds only, see `Compiler::compile`): walks a freshly
//! emitted chunk confirming every opcode's operand bytes land on an opcode
//! boundary and every constant/jump index it references is in range. This
//! is not part of the spec's execution contract — a chunk the compiler
//! produced is assumed well-formed by the VM — it exists to catch compiler
//! bugs before they reach the dispatch loop.

use super::Chunk;
use crate::opcode::Opcode;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("truncated instruction at offset {0}")]
    Truncated(usize),
    #[error("unknown opcode {0:#04x} at offset {1}")]
    UnknownOpcode(u8, usize),
    #[error("constant index {0} out of range at offset {1}")]
    ConstantOutOfRange(u8, usize),
    #[error("jump target out of range at offset {0}")]
    JumpOutOfRange(usize),
}

pub fn validate(chunk: &Chunk) -> Result<(), ValidationError> {
    let mut offset = 0;
    let len = chunk.code.len();

    let need = |offset: usize, n: usize| -> Result<(), ValidationError> {
        if offset + n > len {
            Err(ValidationError::Truncated(offset))
        } else {
            Ok(())
        }
    };

    while offset < len {
        let byte = chunk.code[offset];
        let op = Opcode::try_from(byte).map_err(|_| ValidationError::UnknownOpcode(byte, offset))?;

        let operand_bytes = match op {
            Opcode::Nil
            | Opcode::True
            | Opcode::False
            | Opcode::Pop
            | Opcode::Equal
            | Opcode::Greater
            | Opcode::Less
            | Opcode::Add
            | Opcode::Subtract
            | Opcode::Multiply
            | Opcode::Divide
            | Opcode::Not
            | Opcode::Negate
            | Opcode::Print
            | Opcode::CloseUpvalue
            | Opcode::Inherit
            | Opcode::Return => 0,

            Opcode::GetLocal | Opcode::SetLocal | Opcode::GetUpvalue | Opcode::SetUpvalue
            | Opcode::Call => 1,

            Opcode::Constant | Opcode::GetGlobal | Opcode::DefineGlobal | Opcode::SetGlobal
            | Opcode::GetProperty | Opcode::SetProperty | Opcode::GetSuper | Opcode::Class
            | Opcode::Method => {
                need(offset + 1, 1)?;
                let idx = chunk.code[offset + 1];
                if idx as usize >= chunk.constants.len() {
                    return Err(ValidationError::ConstantOutOfRange(idx, offset));
                }
                1
            }

            Opcode::Invoke | Opcode::SuperInvoke => {
                need(offset + 1, 2)?;
                let idx = chunk.code[offset + 1];
                if idx as usize >= chunk.constants.len() {
                    return Err(ValidationError::ConstantOutOfRange(idx, offset));
                }
                2
            }

            Opcode::Jump | Opcode::JumpIfFalse => {
                need(offset + 1, 2)?;
                let hi = chunk.code[offset + 1] as u16;
                let lo = chunk.code[offset + 2] as u16;
                let target = offset + 3 + (((hi << 8) | lo) as usize);
                if target > len {
                    return Err(ValidationError::JumpOutOfRange(offset));
                }
                2
            }

            Opcode::Loop => {
                need(offset + 1, 2)?;
                let hi = chunk.code[offset + 1] as u16;
                let lo = chunk.code[offset + 2] as u16;
                let back = ((hi << 8) | lo) as usize;
                if back > offset + 3 {
                    return Err(ValidationError::JumpOutOfRange(offset));
                }
                2
            }

            Opcode::Closure => {
                need(offset + 1, 1)?;
                let idx = chunk.code[offset + 1];
                if idx as usize >= chunk.constants.len() {
                    return Err(ValidationError::ConstantOutOfRange(idx, offset));
                }
                // Upvalue descriptor pairs aren't independently length-checked
                // here: their count comes from the function constant, which
                // the compiler always keeps in lockstep with the emitted
                // descriptor bytes.
                1
            }
        };

        need(offset + 1, operand_bytes)?;
        offset += 1 + operand_bytes;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;
    use crate::value::Value;

    #[test]
    fn rejects_truncated_operand() {
        let mut chunk = Chunk::new();
        chunk.write_opcode(Opcode::Constant, 1);
        // no operand byte follows
        assert_eq!(validate(&chunk), Err(ValidationError::Truncated(0)));
    }

    #[test]
    fn rejects_out_of_range_constant() {
        let mut chunk = Chunk::new();
        chunk.write_opcode(Opcode::Constant, 1);
        chunk.write_u8(0, 1);
        assert_eq!(
            validate(&chunk),
            Err(ValidationError::ConstantOutOfRange(0, 0))
        );
    }

    #[test]
    fn accepts_well_formed_chunk() {
        let mut chunk = Chunk::new();
        let idx = chunk.add_constant(Value::Number(1.0)).unwrap();
        chunk.write_opcode(Opcode::Constant, 1);
        chunk.write_u8(idx, 1);
        chunk.write_opcode(Opcode::Return, 1);
        assert_eq!(validate(&chunk), Ok(()));
    }
}
