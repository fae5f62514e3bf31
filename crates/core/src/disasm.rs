//! AVR instruction disassembler.
//!
//! Converts decoded [`DecodedInstr`] records back to human-readable assembly
//! text for the disassembly table and profiler hotspot listings.

use crate::opcodes::{DecodedInstr, Op};

/// Format a decoded instruction as an assembly string.
///
/// The output follows AVR assembly conventions (e.g. `ADD R1, R2`).
/// The `pc` parameter (word address) is used to resolve relative branch targets.
pub fn disassemble(i: DecodedInstr, pc: u16) -> String {
    let rel_target = |k: u16| -> u16 { (pc as i32 + 1 + (k as i16) as i32) as u16 };
    match i.op {
        Op::Nop => "NOP".into(),
        Op::Add => format!("ADD R{}, R{}", i.dst, i.src),
        Op::Adc => format!("ADC R{}, R{}", i.dst, i.src),
        Op::Sub => format!("SUB R{}, R{}", i.dst, i.src),
        Op::Sbc => format!("SBC R{}, R{}", i.dst, i.src),
        Op::And => format!("AND R{}, R{}", i.dst, i.src),
        Op::Or => format!("OR R{}, R{}", i.dst, i.src),
        Op::Eor => format!("EOR R{}, R{}", i.dst, i.src),
        Op::Cp => format!("CP R{}, R{}", i.dst, i.src),
        Op::Cpc => format!("CPC R{}, R{}", i.dst, i.src),
        Op::Cpse => format!("CPSE R{}, R{}", i.dst, i.src),
        Op::Mov => format!("MOV R{}, R{}", i.dst, i.src),
        Op::Movw => format!("MOVW R{}:R{}, R{}:R{}", i.dst + 1, i.dst, i.src + 1, i.src),
        Op::Subi => format!("SUBI R{}, 0x{:02X}", i.dst, i.src),
        Op::Sbci => format!("SBCI R{}, 0x{:02X}", i.dst, i.src),
        Op::Andi => format!("ANDI R{}, 0x{:02X}", i.dst, i.src),
        Op::Ori => format!("ORI R{}, 0x{:02X}", i.dst, i.src),
        Op::Ldi => format!("LDI R{}, 0x{:02X}", i.dst, i.src),
        Op::Cpi => format!("CPI R{}, 0x{:02X}", i.dst, i.src),
        Op::Adiw => format!("ADIW R{}:R{}, {}", i.dst + 1, i.dst, i.src),
        Op::Sbiw => format!("SBIW R{}:R{}, {}", i.dst + 1, i.dst, i.src),
        Op::Mul => format!("MUL R{}, R{}", i.dst, i.src),
        Op::Muls => format!("MULS R{}, R{}", i.dst, i.src),
        Op::Mulsu => format!("MULSU R{}, R{}", i.dst, i.src),
        Op::Fmul => format!("FMUL R{}, R{}", i.dst, i.src),
        Op::Fmuls => format!("FMULS R{}, R{}", i.dst, i.src),
        Op::Fmulsu => format!("FMULSU R{}, R{}", i.dst, i.src),
        Op::Com => format!("COM R{}", i.dst),
        Op::Neg => format!("NEG R{}", i.dst),
        Op::Swap => format!("SWAP R{}", i.dst),
        Op::Inc => format!("INC R{}", i.dst),
        Op::Dec => format!("DEC R{}", i.dst),
        Op::Asr => format!("ASR R{}", i.dst),
        Op::Lsr => format!("LSR R{}", i.dst),
        Op::Ror => format!("ROR R{}", i.dst),
        Op::In => format!("IN R{}, 0x{:02X}", i.dst, i.word),
        Op::Out => format!("OUT 0x{:02X}, R{}", i.word, i.src),
        Op::Bld => format!("BLD R{}, {}", i.dst, i.src),
        Op::Bst => format!("BST R{}, {}", i.dst, i.src),
        Op::Sbrs => format!("SBRS R{}, {}", i.dst, i.src),
        Op::Sbrc => format!("SBRC R{}, {}", i.dst, i.src),
        Op::Sbic => format!("SBIC 0x{:02X}, {}", i.dst, i.src),
        Op::Sbis => format!("SBIS 0x{:02X}, {}", i.dst, i.src),
        Op::Cbi => format!("CBI 0x{:02X}, {}", i.dst, i.src),
        Op::Sbi => format!("SBI 0x{:02X}, {}", i.dst, i.src),
        Op::Bset => format!("BSET {}", i.src),
        Op::Bclr => format!("BCLR {}", i.src),
        Op::Brbs => {
            let name = match i.src {
                0 => "BRCS",
                1 => "BREQ",
                2 => "BRMI",
                3 => "BRVS",
                4 => "BRLT",
                5 => "BRHS",
                6 => "BRTS",
                7 => "BRIE",
                _ => "BRBS",
            };
            format!("{} .{:+} ; 0x{:04X}", name, i.word as i16, rel_target(i.word) * 2)
        }
        Op::Brbc => {
            let name = match i.src {
                0 => "BRCC",
                1 => "BRNE",
                2 => "BRPL",
                3 => "BRVC",
                4 => "BRGE",
                5 => "BRHC",
                6 => "BRTC",
                7 => "BRID",
                _ => "BRBC",
            };
            format!("{} .{:+} ; 0x{:04X}", name, i.word as i16, rel_target(i.word) * 2)
        }
        Op::Rjmp => format!("RJMP .{:+} ; 0x{:04X}", i.word as i16, rel_target(i.word) * 2),
        Op::Rcall => format!("RCALL .{:+} ; 0x{:04X}", i.word as i16, rel_target(i.word) * 2),
        Op::Jmp => format!("JMP 0x{:06X}", (i.word as u32) * 2),
        Op::Call => format!("CALL 0x{:06X}", (i.word as u32) * 2),
        Op::Ijmp => "IJMP".into(),
        Op::Icall => "ICALL".into(),
        Op::Ret => "RET".into(),
        Op::Reti => "RETI".into(),
        Op::LdX => format!("LD R{}, X", i.dst),
        Op::LdXInc => format!("LD R{}, X+", i.dst),
        Op::LdXDec => format!("LD R{}, -X", i.dst),
        Op::LdY => format!("LD R{}, Y", i.dst),
        Op::LdYInc => format!("LD R{}, Y+", i.dst),
        Op::LdYDec => format!("LD R{}, -Y", i.dst),
        Op::LddY => format!("LDD R{}, Y+{}", i.dst, i.word),
        Op::LdZ => format!("LD R{}, Z", i.dst),
        Op::LdZInc => format!("LD R{}, Z+", i.dst),
        Op::LdZDec => format!("LD R{}, -Z", i.dst),
        Op::LddZ => format!("LDD R{}, Z+{}", i.dst, i.word),
        Op::StX => format!("ST X, R{}", i.src),
        Op::StXInc => format!("ST X+, R{}", i.src),
        Op::StXDec => format!("ST -X, R{}", i.src),
        Op::StY => format!("ST Y, R{}", i.src),
        Op::StYInc => format!("ST Y+, R{}", i.src),
        Op::StYDec => format!("ST -Y, R{}", i.src),
        Op::StdY => format!("STD Y+{}, R{}", i.word, i.src),
        Op::StZ => format!("ST Z, R{}", i.src),
        Op::StZInc => format!("ST Z+, R{}", i.src),
        Op::StZDec => format!("ST -Z, R{}", i.src),
        Op::StdZ => format!("STD Z+{}, R{}", i.word, i.src),
        Op::Lds => format!("LDS R{}, 0x{:04X}", i.dst, i.word),
        Op::Sts => format!("STS 0x{:04X}, R{}", i.word, i.src),
        Op::Lpm0 => "LPM R0, Z".into(),
        Op::LpmD => format!("LPM R{}, Z", i.dst),
        Op::LpmDInc => format!("LPM R{}, Z+", i.dst),
        Op::Push => format!("PUSH R{}", i.src),
        Op::Pop => format!("POP R{}", i.dst),
        Op::Sleep => "SLEEP".into(),
        Op::Wdr => "WDR".into(),
        Op::Unknown => ".dw".into(),
    }
}

/// Format the SREG byte as a flag string like "ithsvnzc" (lowercase=clear, UPPER=set).
pub fn format_sreg(sreg: u8) -> String {
    let flags = ['I', 'T', 'H', 'S', 'V', 'N', 'Z', 'C'];
    let mut s = String::with_capacity(8);
    for (i, &f) in flags.iter().enumerate() {
        let bit = 7 - i;
        if sreg & (1 << bit) != 0 {
            s.push(f);
        } else {
            s.push(f.to_ascii_lowercase());
        }
    }
    s
}
