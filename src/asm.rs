//! Inline assembly for patch payloads.
//!
//! A fixed 32-bit x86 vocabulary, just enough for patch scripts: `nop`,
//! `ret`, PC-relative `jmp`, `mov reg, imm32`, and register-register ALU
//! ops. Anything else yields `None`; the script engine then tries the
//! string-literal and raw-hex interpretations of the payload.

/// Register index for the `+rd` and ModRM encodings.
fn register_index(name: &str) -> Option<u8> {
    Some(match name {
        "eax" => 0,
        "ecx" => 1,
        "edx" => 2,
        "ebx" => 3,
        "esp" => 4,
        "ebp" => 5,
        "esi" => 6,
        "edi" => 7,
        _ => return None,
    })
}

/// ALU opcode table for the reg, reg forms.
fn alu_opcode(mnemonic: &str) -> Option<u8> {
    Some(match mnemonic {
        "add" => 0x01,
        "or" => 0x09,
        "and" => 0x21,
        "sub" => 0x29,
        "xor" => 0x31,
        "cmp" => 0x39,
        _ => return None,
    })
}

fn parse_int(token: &str) -> Option<i64> {
    let (digits, negative) = match token.strip_prefix('-') {
        Some(rest) => (rest, true),
        None => (token, false),
    };
    let value = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()?
    } else {
        digits.parse::<i64>().ok()?
    };
    Some(if negative { -value } else { value })
}

/// Encode one line of mnemonic text at write address `current`.
///
/// Returns `None` when the line matches no rule or an operand does not
/// fit its encoding; the caller falls back to other interpretations.
pub fn encode(line: &str, current: u64) -> Option<Vec<u8>> {
    let lowered = line.to_ascii_lowercase();
    let tokens: Vec<&str> = lowered
        .split([' ', ','])
        .filter(|t| !t.is_empty())
        .collect();

    match tokens.as_slice() {
        ["nop"] => Some(vec![0x90]),
        ["ret"] => Some(vec![0xC3]),
        ["jmp", target] => {
            let target = parse_int(target)?;
            let next = current.checked_add(5)?;
            let next = i64::try_from(next).ok()?;
            let rel = target.checked_sub(next)?;
            let rel = i32::try_from(rel).ok()?;
            let mut out = vec![0xE9];
            out.extend_from_slice(&rel.to_le_bytes());
            Some(out)
        }
        ["mov", register, immediate] => {
            let rd = register_index(register)?;
            let value = parse_int(immediate)?;
            // Immediates are i32; anything wider is not an encoding and
            // falls through to the other payload interpretations.
            let imm = i32::try_from(value).ok()? as u32;
            let mut out = vec![0xB8 + rd];
            out.extend_from_slice(&imm.to_le_bytes());
            Some(out)
        }
        [mnemonic, dst, src] => {
            let opcode = alu_opcode(mnemonic)?;
            let dst = register_index(dst)?;
            let src = register_index(src)?;
            Some(vec![opcode, 0xC0 | (src << 3) | dst])
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_byte_ops() {
        assert_eq!(encode("nop", 0).unwrap(), vec![0x90]);
        assert_eq!(encode("ret", 0x1234).unwrap(), vec![0xC3]);
        assert_eq!(encode("  NOP  ", 0).unwrap(), vec![0x90]);
    }

    #[test]
    fn test_jmp_forward() {
        // rel32 = 0x00402000 - (0x00401000 + 5) = 0x0FFB
        let bytes = encode("jmp 0x00402000", 0x0040_1000).unwrap();
        assert_eq!(bytes, vec![0xE9, 0xFB, 0x0F, 0x00, 0x00]);
    }

    #[test]
    fn test_jmp_backward_and_round_trip() {
        for (current, target) in [
            (0x0040_1000u64, 0x0040_0000i64),
            (0x10u64, 0x10i64),
            (0u64, 0x7FFF_0000i64),
        ] {
            let bytes = encode(&format!("jmp {target}"), current).unwrap();
            assert_eq!(bytes[0], 0xE9);
            let rel = i32::from_le_bytes(bytes[1..5].try_into().unwrap());
            assert_eq!(current as i64 + 5 + rel as i64, target);
        }
    }

    #[test]
    fn test_jmp_decimal_operand() {
        let bytes = encode("jmp 4202496", 0x0040_1000).unwrap();
        assert_eq!(bytes, vec![0xE9, 0xFB, 0x0F, 0x00, 0x00]);
    }

    #[test]
    fn test_jmp_out_of_reach() {
        // Displacement does not fit an i32.
        assert!(encode("jmp 0", 0x7FFF_FFFF_FFFF).is_none());
    }

    #[test]
    fn test_mov_all_registers() {
        let registers = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];
        for (index, register) in registers.iter().enumerate() {
            let bytes = encode(&format!("mov {register}, 0x11223344"), 0).unwrap();
            assert_eq!(bytes[0], 0xB8 + index as u8);
            assert_eq!(&bytes[1..], &[0x44, 0x33, 0x22, 0x11]);
        }
    }

    #[test]
    fn test_mov_negative_immediate() {
        let bytes = encode("mov eax, -1", 0).unwrap();
        assert_eq!(bytes, vec![0xB8, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_mov_immediate_bounds() {
        assert!(encode("mov eax, 2147483647", 0).is_some());
        assert!(encode("mov eax, -2147483648", 0).is_some());

        // Wider than i32: no encoding.
        assert!(encode("mov eax, 2147483648", 0).is_none());
        assert!(encode("mov eax, 0xFFFFFFFF", 0).is_none());
        assert!(encode("mov eax, 4000000000", 0).is_none());
        assert!(encode("mov eax, -2147483649", 0).is_none());
    }

    #[test]
    fn test_alu_modrm() {
        // xor ecx, edx -> 31 /r with ModRM 0xC0 | (src << 3) | dst.
        let bytes = encode("xor ecx, edx", 0).unwrap();
        assert_eq!(bytes, vec![0x31, 0xC0 | (2 << 3) | 1]);

        let bytes = encode("add eax, eax", 0).unwrap();
        assert_eq!(bytes, vec![0x01, 0xC0]);

        let bytes = encode("cmp edi, esi", 0).unwrap();
        assert_eq!(bytes, vec![0x39, 0xC0 | (6 << 3) | 7]);
    }

    #[test]
    fn test_no_encoding() {
        assert!(encode("push eax", 0).is_none());
        assert!(encode("mov eax", 0).is_none());
        assert!(encode("mov rax, 1", 0).is_none());
        assert!(encode("jmp eax", 0).is_none());
        assert!(encode("", 0).is_none());
        assert!(encode("hello world", 0).is_none());
        assert!(encode("90 90", 0).is_none());
    }
}
