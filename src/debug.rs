use crate::compiler::chunk::Chunk;
use crate::vm::instruction::OpCode;
use crate::vm::value::Value;

/// Compile-time switches for diagnostic output. All of them are off in a
/// normal build; flip and rebuild to trace a misbehaving program.
pub const TRACE_EXECUTION_INSTR: bool = false;
pub const TRACE_EXECUTION_STACK: bool = false;
pub const LOG_COMPILED_CODE: bool = false;
pub const LOG_GC: bool = false;
/// Collect before every allocation. Brutal, but flushes out liveness bugs.
pub const STRESS_GC: bool = false;

pub fn disassemble_chunk(chunk: &Chunk, name: &str) {
    print!("{}", chunk_to_text(chunk, name));
}

pub fn chunk_to_text(chunk: &Chunk, name: &str) -> String {
    let mut text = format!("== {} ==\n", name);

    let mut offset = 0;
    let mut previous_line = None;
    while offset < chunk.code.len() {
        let line = chunk.line_at(offset);
        let line_column = if previous_line == Some(line) {
            "   |".to_owned()
        } else {
            format!("{:4}", line)
        };
        previous_line = Some(line);

        let (instruction, size) = disassemble_instruction(chunk, offset);
        text.push_str(&format!("{:04} {} {}\n", offset, line_column, instruction));
        offset += size;
    }
    text
}

/// Renders the instruction at `offset` and reports how many bytes it spans,
/// operands included.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let byte = chunk.code[offset];
    let op_code = match OpCode::from_byte(byte) {
        Some(op_code) => op_code,
        None => return (format!("Unknown opcode {:#04x}", byte), 1),
    };

    match op_code {
        OpCode::Nil
        | OpCode::True
        | OpCode::False
        | OpCode::Pop
        | OpCode::Equal
        | OpCode::Greater
        | OpCode::Less
        | OpCode::Add
        | OpCode::Subtract
        | OpCode::Multiply
        | OpCode::Divide
        | OpCode::Not
        | OpCode::Negate
        | OpCode::Print
        | OpCode::CloseUpvalue
        | OpCode::Return
        | OpCode::Inherit => (op_code.name().to_owned(), 1),

        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Method => constant_instruction(chunk, op_code, offset),

        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call => {
            let slot = operand(chunk, offset + 1);
            (format!("{:<16} {:4}", op_code.name(), slot), 2)
        }

        OpCode::Jump | OpCode::JumpIfFalse => {
            let jump = jump_operand(chunk, offset + 1);
            let target = offset + 3 + jump;
            (
                format!("{:<16} {:4} -> {}", op_code.name(), offset, target),
                3,
            )
        }
        OpCode::Loop => {
            let jump = jump_operand(chunk, offset + 1);
            let target = (offset + 3).saturating_sub(jump);
            (
                format!("{:<16} {:4} -> {}", op_code.name(), offset, target),
                3,
            )
        }

        OpCode::Invoke | OpCode::SuperInvoke => {
            let index = operand(chunk, offset + 1) as usize;
            let arg_count = operand(chunk, offset + 2);
            (
                format!(
                    "{:<16} ({} args) {:4} '{}'",
                    op_code.name(),
                    arg_count,
                    index,
                    constant_text(chunk, index)
                ),
                3,
            )
        }

        OpCode::Closure => {
            let index = operand(chunk, offset + 1) as usize;
            let mut text = format!(
                "{:<16} {:4} {}",
                op_code.name(),
                index,
                constant_text(chunk, index)
            );

            // The capture pairs that follow belong to this instruction.
            let num_upvalues = match chunk.constants.get(index) {
                Some(Value::Object(object)) => object.as_ref().as_function().num_upvalues,
                _ => 0,
            };
            let mut size = 2;
            for _ in 0..num_upvalues {
                let is_local = operand(chunk, offset + size);
                let slot = operand(chunk, offset + size + 1);
                let kind = if is_local == 1 { "local" } else { "upvalue" };
                text.push_str(&format!(
                    "\n{:04}    |                   {} {}",
                    offset + size,
                    kind,
                    slot
                ));
                size += 2;
            }
            (text, size)
        }
    }
}

fn operand(chunk: &Chunk, offset: usize) -> u8 {
    chunk.code.get(offset).copied().unwrap_or(0xff)
}

fn jump_operand(chunk: &Chunk, offset: usize) -> usize {
    (operand(chunk, offset) as usize) << 8 | operand(chunk, offset + 1) as usize
}

fn constant_instruction(chunk: &Chunk, op_code: OpCode, offset: usize) -> (String, usize) {
    let index = operand(chunk, offset + 1) as usize;
    (
        format!(
            "{:<16} {:4} '{}'",
            op_code.name(),
            index,
            constant_text(chunk, index)
        ),
        2,
    )
}

fn constant_text(chunk: &Chunk, index: usize) -> String {
    match chunk.constants.get(index) {
        Some(constant) => format!("{}", constant),
        None => "<missing constant>".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::memory::Heap;

    const SOURCE: &str = r#"
        var greeting = "hello";
        fun shout(message) {
            var loud = message + "!";
            fun again() { return loud; }
            return again;
        }
        class Base {
            init(x) { this.x = x; }
            describe() { print this.x; }
        }
        class Derived < Base {
            describe() {
                super.describe();
                print "derived";
            }
        }
        for (var i = 0; i < 3; i = i + 1) {
            if (i > 1 and true or false) {
                print shout(greeting)();
            }
        }
        Derived(1).describe();
        var d = Derived(2);
        d.x = -4;
        d.describe();
    "#;

    /// Walks every instruction of a chunk, returning the byte offsets that
    /// begin an instruction. Panics (via indexing) if any opcode would read
    /// past the end of the chunk.
    fn boundaries(chunk: &Chunk) -> Vec<usize> {
        let mut offsets = Vec::new();
        let mut offset = 0;
        while offset < chunk.code.len() {
            offsets.push(offset);
            let (_, size) = disassemble_instruction(chunk, offset);
            offset += size;
        }
        assert_eq!(offset, chunk.code.len(), "decoder overran the chunk");
        offsets
    }

    fn check_chunk(chunk: &Chunk) {
        let offsets = boundaries(chunk);

        for &offset in &offsets {
            let byte = chunk.code[offset];
            let op_code = OpCode::from_byte(byte).expect("invalid opcode byte");
            match op_code {
                OpCode::Jump | OpCode::JumpIfFalse => {
                    let target = offset + 3 + jump_operand(chunk, offset + 1);
                    assert!(
                        offsets.contains(&target),
                        "jump at {} lands inside an instruction",
                        offset
                    );
                }
                OpCode::Loop => {
                    let target = offset + 3 - jump_operand(chunk, offset + 1);
                    assert!(
                        offsets.contains(&target),
                        "loop at {} lands inside an instruction",
                        offset
                    );
                }
                _ => {}
            }
        }

        // Recurse into nested functions.
        for constant in chunk.constants.iter() {
            if let Value::Object(object) = constant {
                if let crate::memory::Object::Function(function) = object.as_ref() {
                    check_chunk(&function.chunk);
                }
            }
        }
    }

    #[test]
    fn compiled_chunks_decode_cleanly() {
        let mut gc = Heap::new();
        let function = Compiler::new(SOURCE, &mut gc).compile().unwrap();
        check_chunk(&function.as_ref().as_function().chunk);
    }

    #[test]
    fn disassembly_is_deterministic() {
        let mut gc = Heap::new();
        let function = Compiler::new(SOURCE, &mut gc).compile().unwrap();
        let chunk = &function.as_ref().as_function().chunk;
        assert_eq!(chunk_to_text(chunk, "script"), chunk_to_text(chunk, "script"));
    }
}
