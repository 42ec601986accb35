//! Human-readable cluster dumps.
//!
//! One line per instruction: offset, source index, mnemonic, operands.
//! Operands interpreted through a type flag get an `r`/`c` suffix; constant
//! operands print the constant's value. Function constants are
//! disassembled recursively after the main listing.

use risa_core::bytecode::{REGISTER_NULL, TYPE_LEFT_CONSTANT, TYPE_RIGHT_CONSTANT};
use risa_core::heap::Dense;
use risa_core::value::to_display_string;
use risa_core::{Cluster, Heap, OpCode, Value};

/// Renders a full cluster listing, recursing into function constants.
pub fn disassemble_to_string(heap: &Heap, cluster: &Cluster) -> String {
    let mut out = String::new();
    out.push_str("\nOFFS INDX OP\n");

    for (offset, instr) in cluster.instructions() {
        disassemble_instruction(heap, cluster, offset, instr, &mut out);
    }

    for constant in &cluster.constants {
        if let Value::Dense(handle) = constant {
            if let Dense::Function(function) = heap.dense(*handle) {
                let name = match function.name {
                    Some(name) => String::from_utf8_lossy(heap.string_bytes(name)).into_owned(),
                    None => "script".to_string(),
                };

                out.push_str(&format!("\n<{}>", name));
                out.push_str(&disassemble_to_string(heap, &function.cluster));
            }
        }
    }

    out
}

fn flag_suffix(flags: u8, mask: u8) -> char {
    if flags & mask != 0 {
        'c'
    } else {
        'r'
    }
}

fn constant_text(heap: &Heap, cluster: &Cluster, index: usize) -> String {
    match cluster.constants.get(index) {
        Some(value) => to_display_string(heap, *value),
        None => "<bad constant>".to_string(),
    }
}

fn disassemble_instruction(
    heap: &Heap,
    cluster: &Cluster,
    offset: usize,
    instr: [u8; 4],
    out: &mut String,
) {
    let index = cluster.indices.get(offset).copied().unwrap_or(0);
    out.push_str(&format!("{:04} {:4} ", offset, index));

    let flags = instr[0] & 0xC0;
    let (a, b, c) = (instr[1], instr[2], instr[3]);

    let op = match OpCode::from_byte(instr[0]) {
        Some(op) => op,
        None => {
            out.push_str(&format!("DATA             {:4} {:4} {:4}\n", a, b, c));
            return;
        }
    };

    let name = op.name();

    let line = match op {
        OpCode::Cnst => format!(
            "{:16} {:4} {:4}    '{}'",
            name,
            a,
            b,
            constant_text(heap, cluster, b as usize)
        ),
        OpCode::Cnstw => {
            let index = u16::from_le_bytes([b, c]) as usize;
            format!(
                "{:16} {:4} {:4}    '{}'",
                name,
                a,
                index,
                constant_text(heap, cluster, index)
            )
        }
        OpCode::Mov
        | OpCode::Clone
        | OpCode::Gupval
        | OpCode::Supval
        | OpCode::Len
        | OpCode::Call => {
            format!("{:16} {:4} {:4}", name, a, b)
        }
        OpCode::Dglob | OpCode::Sglob => format!(
            "{:16} {:4} {:4}{}    '{}'",
            name,
            a,
            b,
            flag_suffix(flags, TYPE_LEFT_CONSTANT),
            constant_text(heap, cluster, a as usize)
        ),
        OpCode::Gglob => format!(
            "{:16} {:4} {:4}    '{}'",
            name,
            a,
            b,
            constant_text(heap, cluster, b as usize)
        ),
        OpCode::Upval => format!(
            "{:16} {:4} {:4}    {}",
            name,
            a,
            b,
            if b == 0 { "upvalue" } else { "local" }
        ),
        OpCode::Clsr => format!(
            "{:16} {:4} {:4} {:4}   '{}'",
            name,
            a,
            b,
            c,
            constant_text(heap, cluster, b as usize)
        ),
        OpCode::Parr => format!(
            "{:16} {:4} {:4}{}",
            name,
            a,
            b,
            flag_suffix(flags, TYPE_LEFT_CONSTANT)
        ),
        OpCode::Get => format!(
            "{:16} {:4} {:4} {:4}{}",
            name,
            a,
            b,
            c,
            flag_suffix(flags, TYPE_RIGHT_CONSTANT)
        ),
        OpCode::Set => format!(
            "{:16} {:4} {:4}{} {:4}{}",
            name,
            a,
            b,
            flag_suffix(flags, TYPE_LEFT_CONSTANT),
            c,
            flag_suffix(flags, TYPE_RIGHT_CONSTANT)
        ),
        OpCode::Not | OpCode::Bnot | OpCode::Neg => format!(
            "{:16} {:4} {:4}{}",
            name,
            a,
            b,
            flag_suffix(flags, TYPE_LEFT_CONSTANT)
        ),
        OpCode::Add
        | OpCode::Sub
        | OpCode::Mul
        | OpCode::Div
        | OpCode::Mod
        | OpCode::Shl
        | OpCode::Shr
        | OpCode::Lt
        | OpCode::Lte
        | OpCode::Gt
        | OpCode::Gte
        | OpCode::Eq
        | OpCode::Neq
        | OpCode::Band
        | OpCode::Bxor
        | OpCode::Bor => format!(
            "{:16} {:4} {:4}{} {:4}{}",
            name,
            a,
            b,
            flag_suffix(flags, TYPE_LEFT_CONSTANT),
            c,
            flag_suffix(flags, TYPE_RIGHT_CONSTANT)
        ),
        OpCode::Jmpw | OpCode::Bjmpw => {
            format!("{:16} {:5}", name, u16::from_le_bytes([a, b]))
        }
        OpCode::Ret | OpCode::Dis => {
            if a == REGISTER_NULL {
                format!("{:16} null", name)
            } else {
                format!("{:16} {:4}", name, a)
            }
        }
        // Single-operand shapes: ARR, OBJ, NULL, TRUE, FALSE, INC, DEC,
        // TEST, NTEST, JMP, BJMP, CUPVAL, ACC.
        _ => format!("{:16} {:4}", name, a),
    };

    out.push_str(&line);
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use risa_core::heap::{HeapContext, ScratchHeap};

    fn write_instr(cluster: &mut Cluster, bytes: [u8; 4]) {
        for byte in bytes {
            cluster.write(byte, 0);
        }
    }

    #[test]
    fn test_listing_shape() {
        let mut scratch = ScratchHeap::new();
        let mut cluster = Cluster::new();

        let hello = scratch.intern(b"hi");
        let k = cluster.write_constant(Value::Dense(hello)) as u8;

        write_instr(&mut cluster, [OpCode::Cnst as u8, 0, k, 0]);
        write_instr(&mut cluster, [OpCode::Ret as u8, 0, 0, 0]);

        let text = disassemble_to_string(&scratch.heap, &cluster);

        assert!(text.starts_with("\nOFFS INDX OP\n"));
        assert!(text.contains("CNST"));
        assert!(text.contains("'hi'"));
        assert!(text.contains("RET"));
    }

    #[test]
    fn test_constant_flag_suffixes() {
        let scratch = ScratchHeap::new();
        let mut cluster = Cluster::new();
        cluster.write_constant(Value::Int(1));
        cluster.write_constant(Value::Int(2));

        write_instr(
            &mut cluster,
            [
                OpCode::Add as u8 | TYPE_LEFT_CONSTANT | TYPE_RIGHT_CONSTANT,
                0,
                0,
                1,
            ],
        );

        let text = disassemble_to_string(&scratch.heap, &cluster);
        assert!(text.contains("0c"));
        assert!(text.contains("1c"));
    }

    #[test]
    fn test_register_operands_marked_r() {
        let scratch = ScratchHeap::new();
        let mut cluster = Cluster::new();

        write_instr(&mut cluster, [OpCode::Add as u8, 0, 1, 2]);

        let text = disassemble_to_string(&scratch.heap, &cluster);
        assert!(text.contains("1r"));
        assert!(text.contains("2r"));
    }

    #[test]
    fn test_ret_null_sentinel() {
        let scratch = ScratchHeap::new();
        let mut cluster = Cluster::new();

        write_instr(&mut cluster, [OpCode::Ret as u8, REGISTER_NULL, 0, 0]);

        let text = disassemble_to_string(&scratch.heap, &cluster);
        assert!(text.contains("RET"));
        assert!(text.contains("null"));
    }

    #[test]
    fn test_function_constants_recurse() {
        use risa_core::heap::Function;
        use std::rc::Rc;

        let mut scratch = ScratchHeap::new();
        let name = scratch.intern(b"inner");

        let mut inner = Cluster::new();
        write_instr(&mut inner, [OpCode::Ret as u8, REGISTER_NULL, 0, 0]);

        let function = scratch.register(Dense::Function(Rc::new(Function {
            name: Some(name),
            arity: 0,
            cluster: inner,
        })));

        let mut outer = Cluster::new();
        let k = outer.write_constant(Value::Dense(function)) as u8;
        write_instr(&mut outer, [OpCode::Cnst as u8, 0, k, 0]);

        let text = disassemble_to_string(&scratch.heap, &outer);
        assert!(text.contains("<inner>"));
        // The header appears once per listing.
        assert_eq!(text.matches("OFFS INDX OP").count(), 2);
    }
}
