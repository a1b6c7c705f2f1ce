//! fcpp-drv - Pipeline orchestration.
//!
//! Each translation unit is compiled end-to-end on one thread with its own
//! registries: source bytes → lexer → parser (AST + type/template tables) →
//! per-function IR lowering → machine emission → object file. A future
//! multi-TU driver simply runs this per unit; nothing is shared.
//!
//! Exit-code contract: 0 only when no fatal or recoverable errors were
//! reported. Diagnostics render as `file:line:column: level: message` on
//! stderr. Warnings never affect the exit code.

pub mod config;

pub use config::CompileOptions;

use std::time::Instant;

use anyhow::{anyhow, Context};
use fcpp_gen::ObjectModule;
use fcpp_ir::Target;
use fcpp_sem::{TemplateRegistry, TypeRegistry};
use fcpp_util::diagnostic::Handler;
use fcpp_util::{SourceMap, StringTable};
use thiserror::Error;

/// A failed compilation with everything already reported.
#[derive(Debug, Error)]
pub enum CompileError {
    /// Diagnostics were printed; the unit failed.
    #[error("{count} error(s) generated")]
    Reported { count: usize },
    /// An internal stage failed (always a front-end bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Compile one translation unit from source text to an object module.
///
/// Diagnostics are rendered to stderr as they are found; the caller maps
/// the result to the process exit code.
pub fn compile_source(
    file_name: &str,
    source: &str,
    target: Target,
    verbose: bool,
) -> Result<ObjectModule, CompileError> {
    let mut sources = SourceMap::new();
    let file = sources.add_file(file_name, source);
    let mut strings = StringTable::new();
    let mut types = TypeRegistry::new(&mut strings);
    let mut templates = TemplateRegistry::new();
    let handler = Handler::new();

    let started = Instant::now();
    let tokens = match fcpp_lex::Lexer::tokenize(source, file, &mut strings) {
        Ok(tokens) => tokens,
        Err(e) => {
            handler.error(e.to_string(), e.span);
            eprintln!("{}", handler.render_all(&sources));
            return Err(CompileError::Reported { count: 1 });
        }
    };
    let lexed = Instant::now();

    let parser = fcpp_par::Parser::new(tokens, &mut strings, &mut types, &mut templates, &handler);
    let output = match parser.parse() {
        Ok(output) => output,
        Err(e) => {
            handler.error(e.message, e.span);
            eprintln!("{}", handler.render_all(&sources));
            return Err(CompileError::Reported { count: handler.error_count() });
        }
    };
    let parsed = Instant::now();
    if handler.has_errors() {
        eprintln!("{}", handler.render_all(&sources));
        return Err(CompileError::Reported { count: handler.error_count() });
    }

    let mut functions = Vec::with_capacity(output.functions.len());
    for func in &output.functions {
        if func.body.is_none() {
            continue;
        }
        let ir = fcpp_ir::lower_function(func, &output.ast, &mut types, &mut strings, target)
            .map_err(|e| CompileError::Internal(e.to_string()))?;
        functions.push(ir);
    }
    if let Some(init) = fcpp_ir::lower_static_initializers(
        &output.globals,
        &output.ast,
        &mut types,
        &mut strings,
        target,
    )
    .map_err(|e| CompileError::Internal(e.to_string()))?
    {
        functions.push(init);
    }
    let lowered = Instant::now();

    let module = fcpp_gen::emit_module(&functions, &output.globals, &types, &strings, target)
        .map_err(|e| CompileError::Internal(e.to_string()))?;
    let emitted = Instant::now();

    // Warnings still print on success.
    if handler.warning_count() > 0 {
        eprintln!("{}", handler.render_all(&sources));
    }
    if verbose {
        let stats = strings.stats();
        eprintln!(
            "{file_name}: lex {:?}, parse {:?}, lower {:?} ({} functions), emit {:?}",
            lexed - started,
            parsed - lexed,
            lowered - parsed,
            functions.len(),
            emitted - lowered,
        );
        eprintln!(
            "{file_name}: {} interned strings ({} bytes, {:.0}% hit rate)",
            stats.count,
            stats.bytes,
            stats.hit_rate() * 100.0
        );
    }
    Ok(module)
}

/// Compile every input of a driver invocation to object files on disk.
pub fn run(options: &CompileOptions) -> anyhow::Result<()> {
    for input in &options.inputs {
        let source = std::fs::read_to_string(input)
            .with_context(|| format!("cannot read '{}'", input.display()))?;
        let name = input.display().to_string();
        let module = compile_source(&name, &source, options.target, options.verbose)
            .map_err(|e| anyhow!("{e}"))?;
        let output = options.output_for(input);
        module
            .finalize(&output)
            .with_context(|| format!("cannot write '{}'", output.display()))?;
        if options.verbose {
            eprintln!("{name}: wrote {}", output.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_minimal_main() {
        let module = compile_source(
            "t.cpp",
            "int main() { return 42; }",
            Target::Linux64,
            false,
        )
        .expect("compiles");
        let bytes = module.to_bytes().expect("serialize");
        assert_eq!(&bytes[..4], b"\x7fELF");
    }

    #[test]
    fn test_lex_error_is_fatal() {
        let err = compile_source("t.cpp", "int $ = 1;", Target::Linux64, false).err().unwrap();
        assert!(matches!(err, CompileError::Reported { .. }));
    }

    #[test]
    fn test_recoverable_errors_fail_the_unit() {
        let err = compile_source(
            "t.cpp",
            "int x = unknown_name; int main() { return 0; }",
            Target::Linux64,
            false,
        )
        .err()
        .unwrap();
        assert!(matches!(err, CompileError::Reported { .. }));
    }

    #[test]
    fn test_scenario_arith_and_compound_assign() {
        // `int main(){ int x = 0; x += 10; int y = 20+12; return x + y; }`
        let module = compile_source(
            "t.cpp",
            "int main() { int x = 0; x += 10; int y = 20 + 12; return x + y; }",
            Target::Linux64,
            false,
        )
        .expect("compiles");
        assert!(module.lookup("main").is_some());
    }

    #[test]
    fn test_scenario_structured_binding_regression() {
        let src = r#"
            struct Point { int x; int y; };
            template <typename T, typename U> struct is_same { static constexpr bool v = false; };
            template <typename T> struct is_same<T, T> { static constexpr bool v = true; };
            int main() {
                Point p{20, 12};
                auto [a, b] = p;
                int r = a + b + 10;
                return is_same<int, int>::v ? r : 1;
            }
        "#;
        let module =
            compile_source("t.cpp", src, Target::Linux64, false).expect("compiles");
        assert!(module.lookup("main").is_some());
    }

    #[test]
    fn test_scenario_namespace_template_single_instantiation() {
        let src = r#"
            namespace n { template <typename T> struct H { T v; T get() const { return v; } }; }
            int main() { n::H<int> w{42}; return w.get(); }
        "#;
        let module =
            compile_source("t.cpp", src, Target::Linux64, false).expect("compiles");
        // Exactly one mangled method symbol for the single instantiation.
        let get_methods = module
            .symbols()
            .filter(|(_, s)| s.name.contains("3get") && s.section.is_some())
            .count();
        assert_eq!(get_methods, 1);
    }

    #[test]
    fn test_scenario_multi_handler_dispatch() {
        let src = "int main() { try { throw 42; } catch (...) { return 0; } catch (int e) { return e; } }";
        let module =
            compile_source("t.cpp", src, Target::Linux64, false).expect("compiles");
        assert!(module.lookup("main").is_some());
    }

    #[test]
    fn test_scenario_cross_function_unwinding() {
        let src = "int f() { throw 7; } int main() { try { f(); } catch (int e) { return e * 6; } return 0; }";
        let module =
            compile_source("t.cpp", src, Target::Linux64, false).expect("compiles");
        // f has no LSDA (no try regions); main has one.
        assert!(module.lookup("_Z1fv").is_some());
        assert!(module.lookup(".LLSDA1").is_some());
    }

    #[test]
    fn test_win64_target_produces_coff() {
        let module = compile_source(
            "t.cpp",
            "int main() { return 0; }",
            Target::Win64,
            false,
        )
        .expect("compiles");
        let bytes = module.to_bytes().expect("serialize");
        assert_eq!(&bytes[..2], &[0x64, 0x86]);
    }
}
