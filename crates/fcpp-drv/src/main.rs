//! The `fcpp` compiler driver.

use std::process::ExitCode;

use fcpp_drv::{run, CompileOptions};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let options = match CompileOptions::parse(&args) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("fcpp: error: {message}");
            eprintln!("usage: fcpp [--target=linux64|win64] [-o out.o] [-O<n>] [-v] file...");
            return ExitCode::FAILURE;
        }
    };
    match run(&options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            // Diagnostics were already rendered; this is the summary line.
            eprintln!("fcpp: {error}");
            ExitCode::FAILURE
        }
    }
}
