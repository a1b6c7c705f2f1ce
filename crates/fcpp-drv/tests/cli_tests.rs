//! End-to-end driver tests: invoke the `fcpp` binary on real files.

use assert_cmd::Command;
use predicates::prelude::*;

fn fcpp() -> Command {
    Command::cargo_bin("fcpp").expect("binary built")
}

#[test]
fn test_compiles_minimal_program_to_elf() {
    let dir = tempfile::tempdir().expect("tempdir");
    let src = dir.path().join("main.cpp");
    let out = dir.path().join("main.o");
    std::fs::write(&src, "int main() { return 42; }").expect("write source");

    fcpp()
        .arg("--target=linux64")
        .arg("-o")
        .arg(&out)
        .arg(&src)
        .assert()
        .success();

    let bytes = std::fs::read(&out).expect("object written");
    assert_eq!(&bytes[..4], b"\x7fELF");
}

#[test]
fn test_compiles_to_coff_for_win64() {
    let dir = tempfile::tempdir().expect("tempdir");
    let src = dir.path().join("main.cpp");
    let out = dir.path().join("main.obj");
    std::fs::write(&src, "int main() { return 0; }").expect("write source");

    fcpp()
        .arg("--target=win64")
        .arg("-o")
        .arg(&out)
        .arg(&src)
        .assert()
        .success();

    let bytes = std::fs::read(&out).expect("object written");
    assert_eq!(&bytes[..2], &[0x64, 0x86]);
}

#[test]
fn test_syntax_error_reports_location_and_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let src = dir.path().join("bad.cpp");
    std::fs::write(&src, "int main( { return 0; }").expect("write source");

    fcpp()
        .arg("--target=linux64")
        .arg(&src)
        .assert()
        .failure()
        .stderr(predicate::str::contains("error:"))
        .stderr(predicate::str::contains("bad.cpp:1:"));
}

#[test]
fn test_missing_input_fails_with_usage() {
    fcpp()
        .assert()
        .failure()
        .stderr(predicate::str::contains("no input files"));
}

#[test]
fn test_exception_scenario_compiles() {
    let dir = tempfile::tempdir().expect("tempdir");
    let src = dir.path().join("eh.cpp");
    let out = dir.path().join("eh.o");
    std::fs::write(
        &src,
        "int f() { throw 7; } int main() { try { f(); } catch (int e) { return e * 6; } return 0; }",
    )
    .expect("write source");

    fcpp()
        .arg("--target=linux64")
        .arg("-o")
        .arg(&out)
        .arg(&src)
        .assert()
        .success();
    assert!(out.exists());
}

#[test]
fn test_warning_does_not_fail() {
    let dir = tempfile::tempdir().expect("tempdir");
    let src = dir.path().join("warn.cpp");
    std::fs::write(
        &src,
        "extern \"FORTRAN\" int f(); int main() { return 0; }",
    )
    .expect("write source");

    fcpp().arg("--target=linux64").arg(&src).assert().success();
}
