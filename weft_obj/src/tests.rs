//! Tests for normalization, merging, resources and verification.

use object::write::{self, SymbolSection};
use object::{
    elf, pe, Architecture, BinaryFormat, Endianness, RelocationFlags, SymbolFlags, SymbolScope,
};

use crate::module::{
    Arch, Binding, Import, Module, ObjectFormat, RelocKind, Relocation, SectionKind, Symbol,
    SymbolDef, SymbolKind,
};
use crate::normalize::{load, normalize, raw};
use crate::verify::validate;
use crate::ObjError;

fn add_func(obj: &mut write::Object, section: write::SectionId, name: &str, code: &[u8]) -> write::SymbolId {
    let offset = obj.append_section_data(section, code, 16);
    obj.add_symbol(write::Symbol {
        name: name.as_bytes().to_vec(),
        value: offset,
        size: code.len() as u64,
        kind: object::SymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(section),
        flags: SymbolFlags::None,
    })
}

/// go: call helper; lea rax, [rip + .LC0]; ret
/// helper (own section): xor eax, eax; ret
fn elf_fixture() -> Vec<u8> {
    let mut obj = write::Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text = obj.add_section(Vec::new(), b".text".to_vec(), object::SectionKind::Text);
    let text_helper = obj.add_section(Vec::new(), b".text.helper".to_vec(), object::SectionKind::Text);
    let rodata = obj.add_section(Vec::new(), b".rodata.str1.1".to_vec(), object::SectionKind::ReadOnlyString);
    let bss = obj.add_section(Vec::new(), b".bss".to_vec(), object::SectionKind::UninitializedData);

    add_func(&mut obj, text, "go", &[0xe8, 0, 0, 0, 0, 0x48, 0x8d, 0x05, 0, 0, 0, 0, 0xc3]);
    let helper = add_func(&mut obj, text_helper, "helper", &[0x31, 0xc0, 0xc3]);
    obj.append_section_data(rodata, b"hi\0", 1);
    let counter_off = obj.append_section_bss(bss, 16, 8);
    obj.add_symbol(write::Symbol {
        name: b"counter".to_vec(),
        value: counter_off,
        size: 16,
        kind: object::SymbolKind::Data,
        scope: SymbolScope::Compilation,
        weak: false,
        section: SymbolSection::Section(bss),
        flags: SymbolFlags::None,
    });

    obj.add_relocation(
        text,
        write::Relocation {
            offset: 1,
            symbol: helper,
            addend: -4,
            flags: RelocationFlags::Elf {
                r_type: elf::R_X86_64_PLT32,
            },
        },
    )
    .unwrap();
    let rodata_sym = obj.section_symbol(rodata);
    obj.add_relocation(
        text,
        write::Relocation {
            offset: 8,
            symbol: rodata_sym,
            addend: -4,
            flags: RelocationFlags::Elf {
                r_type: elf::R_X86_64_PC32,
            },
        },
    )
    .unwrap();
    obj.write().unwrap()
}

/// Two grouped code sections declared out of order plus an import call.
fn coff_fixture() -> Vec<u8> {
    let mut obj = write::Object::new(BinaryFormat::Coff, Architecture::X86_64, Endianness::Little);
    let text_b = obj.add_section(Vec::new(), b".text$b".to_vec(), object::SectionKind::Text);
    let text_a = obj.add_section(Vec::new(), b".text$a".to_vec(), object::SectionKind::Text);
    add_func(&mut obj, text_b, "second", &[0xc3]);
    // call [rip + __imp_KERNEL32$Sleep]; ret
    add_func(&mut obj, text_a, "go", &[0xff, 0x15, 0, 0, 0, 0, 0xc3]);
    let import = obj.add_symbol(write::Symbol {
        name: b"__imp_KERNEL32$Sleep".to_vec(),
        value: 0,
        size: 0,
        kind: object::SymbolKind::Data,
        scope: SymbolScope::Unknown,
        weak: false,
        section: SymbolSection::Undefined,
        flags: SymbolFlags::None,
    });
    obj.add_relocation(
        text_a,
        write::Relocation {
            offset: 2,
            symbol: import,
            addend: -4,
            flags: RelocationFlags::Coff {
                typ: pe::IMAGE_REL_AMD64_REL32,
            },
        },
    )
    .unwrap();
    obj.write().unwrap()
}

#[test]
fn normalize_collapses_sections_by_kind() {
    let module = normalize("fixture.o", &elf_fixture()).unwrap();
    assert_eq!(module.arch, Arch::X64);
    assert_eq!(module.format, ObjectFormat::Elf);
    let kinds: Vec<_> = module.sections.iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![SectionKind::Code, SectionKind::ReadOnly, SectionKind::Bss]
    );
    assert_eq!(module.sections[0].name, ".text");

    let (code, helper_off) = module.symbol_location("helper").unwrap();
    assert_eq!(module.section(code).kind, SectionKind::Code);
    assert_eq!(helper_off, 16);
    assert_eq!(&module.section(code).data[16..19], &[0x31, 0xc0, 0xc3]);

    let bss = module.canonical_section(SectionKind::Bss).unwrap();
    assert_eq!(module.section(bss).virtual_size, 16);
    assert!(module.section(bss).data.is_empty());
}

#[test]
fn normalize_moves_addends_into_table() {
    let module = normalize("fixture.o", &elf_fixture()).unwrap();
    assert_eq!(module.relocations.len(), 2);

    let call = &module.relocations[0];
    assert_eq!(call.offset, 1);
    assert_eq!(call.kind, RelocKind::Relative32);
    assert_eq!(call.addend, -4);
    assert_eq!(module.symbols.get(call.symbol).name, "helper");

    let lea = &module.relocations[1];
    let target = module.symbols.get(lea.symbol);
    assert_eq!(target.kind, SymbolKind::Section);
    assert_eq!(target.name, ".rodata");
    assert_eq!(lea.addend, -4);

    let code = &module.sections[0].data;
    assert_eq!(&code[1..5], &[0, 0, 0, 0]);
    assert!(validate(&module).is_ok());
}

#[test]
fn normalize_coff_groups_and_imports() {
    let module = normalize("fixture.obj", &coff_fixture()).unwrap();
    assert_eq!(module.format, ObjectFormat::Coff);
    assert_eq!(module.sections.len(), 1);
    let (_, go) = module.symbol_location("go").unwrap();
    let (_, second) = module.symbol_location("second").unwrap();
    assert!(go < second, "`.text$a` must precede `.text$b`");

    let reloc = &module.relocations[0];
    assert_eq!(reloc.offset, go + 2);
    assert_eq!(reloc.addend, -4);
    let sym = module.symbols.get(reloc.symbol);
    assert_eq!(sym.kind, SymbolKind::Import);
    assert_eq!(
        Import::parse(&sym.name),
        Some(Import {
            module: "KERNEL32".into(),
            function: "Sleep".into()
        })
    );
}

#[test]
fn normalize_rejects_garbage() {
    let err = normalize("junk.o", b"definitely not an object").unwrap_err();
    assert!(matches!(err, ObjError::MalformedInput { .. }));
}

#[test]
fn load_passes_plain_objects_through() {
    let module = load("fixture.o", &elf_fixture()).unwrap();
    assert!(module.find_symbol("go").is_some());
}

#[test]
fn import_name_forms() {
    let expected = Some(Import {
        module: "USER32".into(),
        function: "MessageBoxA".into(),
    });
    assert_eq!(Import::parse("__imp_USER32$MessageBoxA"), expected);
    assert_eq!(Import::parse("__imp__USER32$MessageBoxA@16"), expected);
    assert_eq!(Import::parse("USER32$MessageBoxA"), expected);
    assert_eq!(Import::parse("memcpy"), None);
    assert_eq!(Import::parse("__imp_$x"), None);

    let import = expected.unwrap();
    assert!(import.matches("user32$MessageBoxA"));
    assert!(import.matches("MessageBoxA"));
    assert!(!import.matches("KERNEL32$MessageBoxA"));
}

fn module_with_function(name: &str, symbol: &str, body: &[u8]) -> Module {
    let mut m = Module::new(name, Arch::X64, ObjectFormat::Elf);
    let text = m.ensure_section(SectionKind::Code);
    let off = m.section_mut(text).append(body, 16);
    let mut sym = Symbol::defined(symbol, text, off, Binding::Global, SymbolKind::Function);
    sym.size = body.len() as u64;
    m.symbols.add(sym);
    m
}

#[test]
fn merge_rejects_conflicting_globals() {
    let a = module_with_function("a.o", "go", &[0x31, 0xc0, 0xc3]);
    let b = module_with_function("b.o", "go", &[0xb8, 1, 0, 0, 0, 0xc3]);
    let err = a.merge(b).unwrap_err();
    match err {
        ObjError::DuplicateSymbol { symbol, first, second } => {
            assert_eq!(symbol, "go");
            assert_eq!(first, "a.o");
            assert_eq!(second, "b.o");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn merge_folds_identical_definitions() {
    let a = module_with_function("a.o", "go", &[0x31, 0xc0, 0xc3]);
    let b = module_with_function("b.o", "go", &[0x31, 0xc0, 0xc3]);
    let merged = a.merge(b).unwrap();
    let go = merged.find_symbol("go").unwrap();
    assert_eq!(merged.symbols.get(go).location().unwrap().1, 0);
}

#[test]
fn merge_binds_undefined_and_weak() {
    let mut a = module_with_function("a.o", "go", &[0xe8, 0, 0, 0, 0, 0xc3]);
    let text = a.canonical_section(SectionKind::Code).unwrap();
    let helper_ref = a.symbols.add(Symbol::undefined("helper", SymbolKind::Unknown));
    a.relocations.push(Relocation {
        section: text,
        offset: 1,
        symbol: helper_ref,
        kind: RelocKind::Relative32,
        addend: -4,
    });
    let mut weak = module_with_function("weak.o", "helper", &[0x90, 0xc3]);
    let weak_id = weak.find_symbol("helper").unwrap();
    weak.symbols.set_binding(weak_id, Binding::Weak);
    let strong = module_with_function("strong.o", "helper", &[0x31, 0xc0, 0xc3]);

    let merged = a.merge(weak).unwrap().merge(strong).unwrap();
    let reloc = merged.relocations[0];
    let helper = merged.symbols.get(reloc.symbol);
    assert_eq!(helper.name, "helper");
    assert_eq!(helper.binding, Binding::Global);
    let (sec, off) = helper.location().unwrap();
    assert_eq!(&merged.section(sec).data[off as usize..off as usize + 3], &[0x31, 0xc0, 0xc3]);
}

#[test]
fn merge_rejects_mixed_architectures() {
    let a = Module::new("a.o", Arch::X64, ObjectFormat::Elf);
    let b = Module::new("b.o", Arch::X86, ObjectFormat::Elf);
    assert!(matches!(a.merge(b), Err(ObjError::ArchMismatch { .. })));
}

#[test]
fn resource_round_trip() {
    let mut m = module_with_function("cap.o", "go", &[0xc3]);
    let payload = b"\x01\x02config\x00\xff".to_vec();
    let names = m.append_resource("config.bin", &payload);
    assert_eq!(names.start, "_binary_config_bin_start");
    assert_eq!(m.read_resource("config.bin"), Some(payload.as_slice()));

    let end = m.symbols.get(m.symbols.lookup(&names.end).unwrap());
    let start = m.symbols.get(m.symbols.lookup(&names.start).unwrap());
    assert_eq!(
        end.location().unwrap().1 - start.location().unwrap().1,
        payload.len() as u64
    );

    // Appending again regenerates the symbols instead of duplicating them.
    let before = m.symbols.len();
    m.append_resource("config.bin", b"v2");
    assert_eq!(m.symbols.len(), before);
    assert_eq!(m.read_resource("config.bin"), Some(&b"v2"[..]));
}

#[test]
fn resource_symbols_are_decorated_for_coff32() {
    let m = Module::new("x.obj", Arch::X86, ObjectFormat::Coff);
    let names = crate::resource::ResourceSymbols::for_resource(&m, "config.bin");
    assert_eq!(names.size, "__binary_config_bin_size");
}

#[test]
fn prune_drops_relocations_into_removed_sections() {
    let mut m = normalize("fixture.o", &elf_fixture()).unwrap();
    let rodata = m.canonical_section(SectionKind::ReadOnly).unwrap();
    let keep_sections: Vec<bool> = m.section_ids().map(|id| id != rodata).collect();
    let keep_symbols = vec![true; m.symbols.len()];
    m.prune(&keep_sections, &keep_symbols);
    assert_eq!(m.sections.len(), 2);
    assert_eq!(m.relocations.len(), 1);
    let result = validate(&m);
    assert!(result.is_ok(), "{result}");
    assert_eq!(result.dangling_relocations, 0);
}

#[test]
fn validate_counts_dangling_relocations() {
    let mut m = module_with_function("a.o", "go", &[0xe8, 0, 0, 0, 0]);
    let text = m.canonical_section(SectionKind::Code).unwrap();
    let go = m.find_symbol("go").unwrap();
    m.relocations.push(Relocation {
        section: text,
        offset: 3,
        symbol: go,
        kind: RelocKind::Relative32,
        addend: -4,
    });
    m.relocations.push(Relocation {
        section: text,
        offset: 1,
        symbol: crate::module::SymbolId(99),
        kind: RelocKind::Relative32,
        addend: -4,
    });
    let result = validate(&m);
    assert_eq!(result.relocation_count, 2);
    assert_eq!(result.dangling_relocations, 2);
    assert!(!result.is_ok());
}

#[test]
fn raw_module_has_single_rodata_section() {
    let m = raw("blob.bin", &[1, 2, 3], Arch::X86);
    assert_eq!(m.sections.len(), 1);
    assert_eq!(m.sections[0].kind, SectionKind::ReadOnly);
    assert_eq!(m.sections[0].data, vec![1, 2, 3]);
    assert!(matches!(
        m.symbols.get(m.section_symbol(crate::module::SectionId(0)).unwrap()).def,
        SymbolDef::Section { .. }
    ));
}
