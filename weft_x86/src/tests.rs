//! Tests for register definitions, decoding, encoding and display.

use weft_obj::{Arch, Binding, Module, ObjectFormat, RelocKind, Relocation, SectionKind, Symbol, SymbolKind};

use crate::build;
use crate::decode::{decode_all, decode_one, refine_relocations, Decoder, Unrecognized};
use crate::encode::{encode, EncodeError};
use crate::inst::{Mem, Op, OpSize, Operand, Reg};
use crate::reg::{Cond, Gpr};

#[test]
fn gpr_encoding() {
    assert_eq!(Gpr::Rax.encoding(), 0);
    assert_eq!(Gpr::Rcx.encoding(), 1);
    assert_eq!(Gpr::Rdi.encoding(), 7);
    assert_eq!(Gpr::R12.encoding(), 4);
    assert!(Gpr::R12.needs_rex());
    assert_eq!(Gpr::from_num(13), Gpr::R13);
}

#[test]
fn gpr_names() {
    assert_eq!(Gpr::Rax.name32(), "eax");
    assert_eq!(Gpr::Rdi.name64(), "rdi");
    assert_eq!(Gpr::Rsi.name8(), "sil");
    assert_eq!(Reg::high8(Gpr::Rbx).name(), "bh");
}

#[test]
fn cond_negation() {
    assert_eq!(Cond::E.negate(), Cond::Ne);
    assert_eq!(Cond::L.negate(), Cond::Ge);
    assert_eq!(Cond::from_bits(0x7f), Cond::G);
}

const X64_CORPUS: &[&[u8]] = &[
    &[0x55],
    &[0x48, 0x89, 0xe5],
    &[0x48, 0x83, 0xec, 0x20],
    &[0x48, 0x81, 0xec, 0x00, 0x01, 0x00, 0x00],
    &[0x48, 0x8d, 0x05, 0x00, 0x00, 0x00, 0x00],
    &[0x48, 0x8b, 0x05, 0x10, 0x00, 0x00, 0x00],
    &[0xff, 0x15, 0x00, 0x00, 0x00, 0x00],
    &[0xe8, 0x00, 0x00, 0x00, 0x00],
    &[0x0f, 0x84, 0x10, 0x00, 0x00, 0x00],
    &[0x74, 0x05],
    &[0xeb, 0xfe],
    &[0x31, 0xc0],
    &[0x41, 0x57],
    &[0x4c, 0x8d, 0x44, 0x24, 0x08],
    &[0x8b, 0x44, 0x8d, 0x00],
    &[0xc7, 0x44, 0x24, 0x04, 0x2a, 0x00, 0x00, 0x00],
    &[0x48, 0xb8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11],
    &[0x66, 0x0f, 0x1f, 0x44, 0x00, 0x00],
    &[0x66, 0x2e, 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x0f, 0x1f, 0x40, 0x00],
    &[0x40, 0x88, 0xf0],
    &[0x88, 0xe0],
    &[0xf3, 0x0f, 0x1e, 0xfa],
    &[0xc3],
    &[0xf3, 0xc3],
    &[0xcc],
    &[0xc9],
    &[0x90],
    &[0x0f, 0x0b],
    &[0x48, 0x63, 0xc8],
    &[0x0f, 0xb6, 0xc0],
    &[0x0f, 0x94, 0xc0],
    &[0x48, 0x0f, 0x44, 0xc1],
    &[0x48, 0xc1, 0xe0, 0x04],
    &[0xd1, 0xf8],
    &[0x48, 0xd3, 0xe8],
    &[0x48, 0xf7, 0xd8],
    &[0x48, 0x99],
    &[0x48, 0x98],
    &[0xf3, 0x48, 0xab],
    &[0xf3, 0xa4],
    &[0x65, 0x48, 0x8b, 0x04, 0x25, 0x60, 0x00, 0x00, 0x00],
    &[0xff, 0xe0],
    &[0x41, 0xff, 0xd3],
    &[0x48, 0x83, 0xc4, 0x28],
    &[0x69, 0xc0, 0xe8, 0x03, 0x00, 0x00],
    &[0x0f, 0xaf, 0xc1],
    &[0x48, 0x8d, 0x0c, 0x8d, 0x00, 0x00, 0x00, 0x00],
    &[0xc2, 0x08, 0x00],
    &[0xa8, 0x01],
    &[0x3c, 0x0a],
    &[0x48, 0x3d, 0x00, 0x10, 0x00, 0x00],
    &[0x4d, 0x85, 0xc0],
    &[0x4c, 0x89, 0x6d, 0x00],
    &[0x48, 0x87, 0xd1],
    &[0x9c],
    &[0x9d],
    &[0xfe, 0xc0],
    &[0x48, 0xff, 0x44, 0x24, 0x10],
    &[0xff, 0x74, 0x24, 0x08],
    &[0x8f, 0x00],
    &[0xf7, 0xf1],
    &[0x6a, 0xff],
];

const X86_CORPUS: &[&[u8]] = &[
    &[0x55],
    &[0x89, 0xe5],
    &[0x8b, 0x45, 0x08],
    &[0xff, 0x15, 0x00, 0x00, 0x00, 0x00],
    &[0xa1, 0x00, 0x00, 0x00, 0x00],
    &[0x64, 0xa1, 0x30, 0x00, 0x00, 0x00],
    &[0xa3, 0x78, 0x56, 0x34, 0x12],
    &[0x68, 0x00, 0x00, 0x00, 0x00],
    &[0x6a, 0x00],
    &[0x40],
    &[0x4b],
    &[0xe8, 0x00, 0x00, 0x00, 0x00],
    &[0xb8, 0x01, 0x00, 0x00, 0x00],
    &[0xc3],
    &[0x8d, 0x04, 0x85, 0x00, 0x00, 0x00, 0x00],
    &[0x8b, 0x0d, 0x00, 0x00, 0x00, 0x00],
    &[0x8b, 0x0c, 0x25, 0x00, 0x00, 0x00, 0x00],
    &[0xc7, 0x05, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00],
    &[0x66, 0x89, 0x08],
    &[0xb4, 0x01],
];

fn round_trip(bytes: &[u8], arch: Arch) {
    let inst = decode_one(bytes, arch).unwrap_or_else(|| panic!("{bytes:02x?} not recognized"));
    assert_eq!(inst.len as usize, bytes.len(), "length of {bytes:02x?}");
    let encoded = encode(&inst, arch).unwrap();
    assert_eq!(encoded.bytes, bytes, "re-encoding {inst}");
    let again = decode_one(&encoded.bytes, arch).unwrap();
    assert_eq!(again, inst);
}

#[test]
fn x64_round_trip() {
    for bytes in X64_CORPUS {
        round_trip(bytes, Arch::X64);
    }
}

#[test]
fn x86_round_trip() {
    for bytes in X86_CORPUS {
        round_trip(bytes, Arch::X86);
    }
}

#[test]
fn concatenated_stream_round_trips() {
    let stream: Vec<u8> = X64_CORPUS.iter().flat_map(|b| b.iter().copied()).collect();
    let (insts, marker) = decode_all(&stream, Arch::X64);
    assert!(marker.is_none());
    assert_eq!(insts.len(), X64_CORPUS.len());
    let out = crate::encode::encode_all(insts.iter().map(|(_, i)| i), Arch::X64).unwrap();
    assert_eq!(out, stream);
}

#[test]
fn every_rex_variant_round_trips_or_is_unrecognized() {
    // ret; mov r/m, r; add r/m, imm8 (/0); lea r, [base + index]; mov r, [rip + d]
    let bodies: &[&[u8]] = &[
        &[0xc3],
        &[0x89, 0xc8],
        &[0x83, 0xc0, 0x01],
        &[0x8d, 0x04, 0x08],
        &[0x8b, 0x05, 0x10, 0x00, 0x00, 0x00],
        &[0xff, 0xd0],
        &[0x50],
    ];
    let mut recognized = 0;
    for body in bodies {
        for rex in 0x40u8..=0x4f {
            let mut bytes = vec![rex];
            bytes.extend_from_slice(body);
            let Some(inst) = decode_one(&bytes, Arch::X64) else { continue };
            recognized += 1;
            let encoded = encode(&inst, Arch::X64).unwrap();
            assert_eq!(encoded.bytes, bytes, "re-encoding {inst}");
            assert_eq!(decode_one(&encoded.bytes, Arch::X64), Some(inst));
        }
    }
    assert!(recognized > bodies.len());

    // REX bits that select nothing.
    assert!(decode_one(&[0x41, 0xc3], Arch::X64).is_none());
    assert!(decode_one(&[0x4a, 0x89, 0xc8], Arch::X64).is_none());
    assert!(decode_one(&[0x4c, 0x83, 0xc0, 0x01], Arch::X64).is_none());
    // mov r8, rcx needs REX.B.
    let inst = decode_one(&[0x49, 0x89, 0xc8], Arch::X64).unwrap();
    assert_eq!(inst.operands[0], Operand::Reg(Reg::new(Gpr::R8, OpSize::S64)));
}

#[test]
fn inc_dec_short_forms_are_32_bit_only() {
    let inst = decode_one(&[0x40], Arch::X86).unwrap();
    assert_eq!(inst.op, Op::Inc);
    // In 64-bit mode 0x40 is a REX prefix for the following instruction.
    let inst = decode_one(&[0x40, 0x90], Arch::X64);
    assert!(inst.is_some_and(|i| i.len == 2 && i.op == Op::Nop));
}

#[test]
fn decoder_stops_at_unrecognized() {
    // xor eax, eax; movups xmm0, xmm1; ret
    let bytes = [0x31, 0xc0, 0x0f, 0x10, 0xc1, 0xc3];
    let (insts, marker) = decode_all(&bytes, Arch::X64);
    assert_eq!(insts.len(), 1);
    assert_eq!(marker, Some(Unrecognized { offset: 2 }));

    let mut decoder = Decoder::new(&bytes, Arch::X64);
    assert!(decoder.next().is_some_and(|r| r.is_ok()));
    assert!(decoder.next().is_some_and(|r| r.is_err()));
    assert!(decoder.next().is_none());
    decoder.seek(5);
    let (at, ret) = decoder.next().unwrap().unwrap();
    assert_eq!(at, 5);
    assert_eq!(ret.op, Op::Ret);
}

#[test]
fn truncated_input_is_unrecognized() {
    assert!(decode_one(&[0xe8, 0x00, 0x00], Arch::X64).is_none());
    assert!(decode_one(&[0x48], Arch::X64).is_none());
    assert!(decode_one(&[], Arch::X86).is_none());
}

#[test]
fn decoded_operands() {
    let inst = decode_one(&[0x4c, 0x8d, 0x44, 0x24, 0x08], Arch::X64).unwrap();
    assert_eq!(inst.op, Op::Lea);
    assert_eq!(inst.operands[0], Operand::Reg(Reg::new(Gpr::R8, OpSize::S64)));
    let mem = inst.mem().unwrap();
    assert_eq!(mem.base_reg(), Some(Gpr::Rsp));
    assert_eq!(mem.disp, 8);
    assert!(mem.is_stack_relative());

    let inst = decode_one(&[0x48, 0x8b, 0x05, 0x10, 0x00, 0x00, 0x00], Arch::X64).unwrap();
    assert!(inst.mem().unwrap().is_rip());

    let inst = decode_one(&[0xff, 0x15, 0x00, 0x00, 0x00, 0x00], Arch::X86).unwrap();
    let mem = inst.mem().unwrap();
    assert!(mem.base.is_none() && mem.index.is_none());
    assert_eq!(inst.op, Op::Call);
}

#[test]
fn field_positions() {
    let inst = decode_one(&[0xc7, 0x05, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00], Arch::X86).unwrap();
    let enc = encode(&inst, Arch::X86).unwrap();
    assert_eq!(enc.disp_at, Some(2));
    assert_eq!(enc.imm_at, Some(6));

    let call = decode_one(&[0xe8, 0x00, 0x00, 0x00, 0x00], Arch::X64).unwrap();
    assert_eq!(encode(&call, Arch::X64).unwrap().imm_at, Some(1));
}

#[test]
fn branch_widening() {
    let mut jcc = decode_one(&[0x74, 0x05], Arch::X64).unwrap();
    assert!(jcc.widen_branch());
    assert_eq!(encode(&jcc, Arch::X64).unwrap().bytes, vec![0x0f, 0x84, 0x05, 0, 0, 0]);
    assert!(!jcc.widen_branch());

    let mut jmp = decode_one(&[0xeb, 0xfe], Arch::X64).unwrap();
    assert!(jmp.widen_branch());
    assert_eq!(encode(&jmp, Arch::X64).unwrap().bytes, vec![0xe9, 0xfe, 0xff, 0xff, 0xff]);
}

#[test]
fn short_branch_out_of_range() {
    let jmp = build::jmp_rel(200, true, Arch::X64);
    assert_eq!(
        encode(&jmp, Arch::X64),
        Err(EncodeError::OutOfRange { value: 200, width: 1 })
    );
}

#[test]
fn builder_encodings() {
    let r64 = |g| Reg::new(g, OpSize::S64);
    let r32 = |g| Reg::new(g, OpSize::S32);
    let cases: Vec<(crate::inst::Inst, Arch, Vec<u8>)> = vec![
        (build::mov_ri(r32(Gpr::Rax), 5), Arch::X64, vec![0xb8, 5, 0, 0, 0]),
        (build::mov_ri(r64(Gpr::Rax), -1), Arch::X64, vec![0x48, 0xc7, 0xc0, 0xff, 0xff, 0xff, 0xff]),
        (build::push_r(Gpr::R12, Arch::X64), Arch::X64, vec![0x41, 0x54]),
        (build::pop_r(Gpr::Rbp, Arch::X86), Arch::X86, vec![0x5d]),
        (build::lea(r64(Gpr::Rax), Mem::rip(OpSize::S64, 0)), Arch::X64, vec![0x48, 0x8d, 0x05, 0, 0, 0, 0]),
        (build::lea(r64(Gpr::R8), Mem::base(OpSize::S64, Gpr::R13, 0)), Arch::X64, vec![0x4d, 0x8d, 0x45, 0x00]),
        (build::alu_ri(Op::Sub, Operand::Reg(r64(Gpr::Rsp)), 32), Arch::X64, vec![0x48, 0x83, 0xec, 0x20]),
        (build::alu_ri(Op::And, Operand::Reg(r64(Gpr::Rsp)), -16), Arch::X64, vec![0x48, 0x83, 0xe4, 0xf0]),
        (build::alu_rr(Op::Xor, Operand::Reg(r32(Gpr::Rcx)), r32(Gpr::Rcx)), Arch::X86, vec![0x31, 0xc9]),
        (build::mov_load(r32(Gpr::Rax), Operand::Mem(Mem::base(OpSize::S32, Gpr::Rsp, 8))), Arch::X86, vec![0x8b, 0x44, 0x24, 0x08]),
        (build::movabs(Gpr::Rcx, 0x1122_3344_5566_7788), Arch::X64, vec![0x48, 0xb9, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]),
        (build::push_imm(-1, Arch::X86), Arch::X86, vec![0x6a, 0xff]),
        (build::push_imm32(0x1000, Arch::X86), Arch::X86, vec![0x68, 0x00, 0x10, 0, 0]),
        (build::call_indirect(Operand::Reg(r64(Gpr::Rax)), Arch::X64), Arch::X64, vec![0xff, 0xd0]),
        (build::jcc_rel(Cond::Ne, -2, true, Arch::X64), Arch::X64, vec![0x75, 0xfe]),
        (build::pushf(Arch::X64), Arch::X64, vec![0x9c]),
    ];
    for (inst, arch, bytes) in cases {
        assert_eq!(encode(&inst, arch).unwrap().bytes, bytes, "{inst}");
        // Synthesized encodings decode back to the same semantics.
        let back = decode_one(&bytes, arch).unwrap();
        assert_eq!(back.op, inst.op);
        assert_eq!(back.operands.len(), inst.operands.len());
    }
}

#[test]
fn mode_errors() {
    let push = build::push_r(Gpr::R8, Arch::X86);
    assert!(matches!(encode(&push, Arch::X86), Err(EncodeError::RexIn32Bit(_))));

    let lea = build::lea(Reg::new(Gpr::Rax, OpSize::S32), Mem::rip(OpSize::S32, 0));
    assert_eq!(encode(&lea, Arch::X86), Err(EncodeError::RipIn32Bit));

    let mov = build::mov_rr(Reg::high8(Gpr::Rax), Reg::new(Gpr::Rsi, OpSize::S8));
    assert!(matches!(encode(&mov, Arch::X64), Err(EncodeError::HighByteWithRex(_))));
}

#[test]
fn forced_disp32_survives_small_values() {
    let mut mem = Mem::base(OpSize::S32, Gpr::Rax, 0);
    mem.force_disp32();
    let lea = build::lea(Reg::new(Gpr::Rcx, OpSize::S32), mem);
    let enc = encode(&lea, Arch::X86).unwrap();
    assert_eq!(enc.bytes, vec![0x8d, 0x88, 0, 0, 0, 0]);
    assert_eq!(enc.disp_at, Some(2));
}

#[test]
fn flag_classification() {
    let cmp = decode_one(&[0x3c, 0x0a], Arch::X64).unwrap();
    assert!(cmp.defines_flags());
    let je = decode_one(&[0x74, 0x05], Arch::X64).unwrap();
    assert!(je.reads_flags() && je.is_jump());
    let inc = decode_one(&[0xfe, 0xc0], Arch::X64).unwrap();
    assert!(inc.writes_flags() && !inc.defines_flags());
    let lea = decode_one(&[0x4c, 0x8d, 0x44, 0x24, 0x08], Arch::X64).unwrap();
    assert!(!lea.writes_flags());
}

#[test]
fn intel_display() {
    let show = |bytes: &[u8], arch| decode_one(bytes, arch).unwrap().intel(arch).to_string();
    assert_eq!(show(&[0x48, 0x89, 0xe5], Arch::X64), "mov rbp, rsp");
    assert_eq!(show(&[0x8b, 0x45, 0x08], Arch::X86), "mov eax, [ebp + 0x8]");
    assert_eq!(
        show(&[0xc7, 0x44, 0x24, 0x04, 0x2a, 0x00, 0x00, 0x00], Arch::X64),
        "mov dword ptr [rsp + 0x4], 0x2a"
    );
    assert_eq!(
        show(&[0x65, 0x48, 0x8b, 0x04, 0x25, 0x60, 0x00, 0x00, 0x00], Arch::X64),
        "mov rax, gs:[0x60]"
    );
    assert_eq!(show(&[0xeb, 0xfe], Arch::X64), "jmp $+0x0");
    assert_eq!(show(&[0x0f, 0x94, 0xc0], Arch::X64), "sete al");
}

#[test]
fn rip_relocations_are_refined() {
    let mut m = Module::new("refine.o", Arch::X64, ObjectFormat::Coff);
    let text = m.ensure_section(SectionKind::Code);
    // mov rax, [rip+x]; call y; ret
    let code = [0x48, 0x8b, 0x05, 0, 0, 0, 0, 0xe8, 0, 0, 0, 0, 0xc3];
    m.section_mut(text).append(&code, 16);
    m.symbols.add(Symbol::defined("go", text, 0, Binding::Global, SymbolKind::Function));
    let x = m.symbols.add(Symbol::undefined("x", SymbolKind::Data));
    let y = m.symbols.add(Symbol::undefined("y", SymbolKind::Function));
    for (offset, symbol) in [(3, x), (8, y)] {
        m.relocations.push(Relocation {
            section: text,
            offset,
            symbol,
            kind: RelocKind::Relative32,
            addend: -4,
        });
    }
    assert_eq!(refine_relocations(&mut m), 1);
    assert_eq!(m.relocations[0].kind, RelocKind::RipRelative32);
    assert_eq!(m.relocations[1].kind, RelocKind::Relative32);
}
