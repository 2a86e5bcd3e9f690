use std::fs;
use std::process::Command;

use object::write::{Object, StandardSection, Symbol, SymbolSection};
use object::{Architecture, BinaryFormat, Endianness, SymbolFlags, SymbolKind, SymbolScope};

fn weft() -> Command {
    Command::new(env!("CARGO_BIN_EXE_weft"))
}

/// `go: mov eax, 42; ret`
fn payload() -> Vec<u8> {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);
    let offset = obj.append_section_data(text, &[0xb8, 0x2a, 0, 0, 0, 0xc3], 16);
    obj.add_symbol(Symbol {
        name: b"go".to_vec(),
        value: offset,
        size: 6,
        kind: SymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    });
    obj.write().unwrap()
}

#[test]
fn build_writes_outputs_and_log() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("payload.o"), payload()).unwrap();
    let script = dir.path().join("build.json");
    fs::write(
        &script,
        r#"{
            "seed": 1,
            "directives": [
                { "op": "load", "input": "payload.o" },
                { "op": "make", "passes": ["+optimize"] },
                { "op": "link", "output": "payload.bin", "kind": "pic" }
            ]
        }"#,
    )
    .unwrap();
    let out_dir = dir.path().join("out");
    let log = dir.path().join("log.json");

    let status = weft()
        .arg("build")
        .arg(&script)
        .arg("-o")
        .arg(&out_dir)
        .arg("--log")
        .arg(&log)
        .status()
        .unwrap();
    assert!(status.success());
    assert_eq!(fs::read(out_dir.join("payload.bin")).unwrap(), vec![0xb8, 0x2a, 0, 0, 0, 0xc3]);
    let log: serde_json::Value = serde_json::from_str(&fs::read_to_string(log).unwrap()).unwrap();
    assert!(log["entries"].as_array().is_some_and(|e| !e.is_empty()));
}

#[test]
fn input_bindings_override_the_script_directory() {
    let dir = tempfile::tempdir().unwrap();
    let elsewhere = dir.path().join("objs");
    fs::create_dir(&elsewhere).unwrap();
    fs::write(elsewhere.join("x.o"), payload()).unwrap();
    let script = dir.path().join("build.json");
    fs::write(
        &script,
        r#"{ "directives": [
            { "op": "load", "input": "payload" },
            { "op": "make" },
            { "op": "link", "output": "p.o", "kind": "object" }
        ] }"#,
    )
    .unwrap();

    let missing = weft().arg("build").arg(&script).arg("-o").arg(dir.path()).output().unwrap();
    assert!(!missing.status.success());

    let status = weft()
        .arg("build")
        .arg(&script)
        .arg("-i")
        .arg(format!("payload={}", elsewhere.join("x.o").display()))
        .arg("-o")
        .arg(dir.path())
        .status()
        .unwrap();
    assert!(status.success());

    let out = weft()
        .arg("inspect")
        .arg("object")
        .arg(dir.path().join("p.o"))
        .output()
        .unwrap();
    assert!(out.status.success());
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert!(report["symbols"].as_array().unwrap().iter().any(|s| s == "go"));
}

#[test]
fn hash_prints_ror13_values() {
    let out = weft().args(["hash", "--module", "kernel32"]).output().unwrap();
    assert!(out.status.success());
    assert_eq!(String::from_utf8(out.stdout).unwrap(), "0x6e2bca17  kernel32\n");

    let out = weft().args(["hash", "Sleep"]).output().unwrap();
    assert_eq!(String::from_utf8(out.stdout).unwrap(), "0xdb2d49b0  Sleep\n");
}
