//! Compilation options parsed from the command line.

use std::path::PathBuf;

use fcpp_ir::Target;

/// Parsed driver configuration.
#[derive(Clone, Debug)]
pub struct CompileOptions {
    pub inputs: Vec<PathBuf>,
    /// Explicit `-o` path; derived from the input stem otherwise.
    pub output: Option<PathBuf>,
    pub target: Target,
    /// Accepted for compatibility; informational only.
    pub opt_level: u8,
    pub verbose: bool,
}

impl CompileOptions {
    /// Parse `fcpp [flags] file...` arguments (program name excluded).
    pub fn parse(args: &[String]) -> Result<Self, String> {
        let mut options = CompileOptions {
            inputs: Vec::new(),
            output: None,
            target: default_target(),
            opt_level: 0,
            verbose: false,
        };
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-o" => {
                    let path = iter
                        .next()
                        .ok_or_else(|| "'-o' requires an output path".to_string())?;
                    options.output = Some(PathBuf::from(path));
                }
                "-v" | "--verbose" => options.verbose = true,
                "--target=win64" => options.target = Target::Win64,
                "--target=linux64" => options.target = Target::Linux64,
                other if other.starts_with("--target=") => {
                    return Err(format!(
                        "unknown target '{}' (expected win64 or linux64)",
                        &other["--target=".len()..]
                    ));
                }
                other if other.starts_with("-O") => {
                    options.opt_level = other[2..].parse().unwrap_or(0);
                }
                other if other.starts_with('-') => {
                    return Err(format!("unknown option '{other}'"));
                }
                file => options.inputs.push(PathBuf::from(file)),
            }
        }
        if options.inputs.is_empty() {
            return Err("no input files".to_string());
        }
        if options.output.is_some() && options.inputs.len() > 1 {
            return Err("'-o' cannot be used with multiple input files".to_string());
        }
        Ok(options)
    }

    /// Object path for one input.
    pub fn output_for(&self, input: &std::path::Path) -> PathBuf {
        match &self.output {
            Some(path) => path.clone(),
            None => input.with_extension("o"),
        }
    }
}

fn default_target() -> Target {
    if cfg!(windows) {
        Target::Win64
    } else {
        Target::Linux64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CompileOptions, String> {
        CompileOptions::parse(&args.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn test_basic_invocation() {
        let opts = parse(&["main.cpp", "-o", "main.o"]).unwrap();
        assert_eq!(opts.inputs.len(), 1);
        assert_eq!(opts.output_for(&opts.inputs[0]), PathBuf::from("main.o"));
    }

    #[test]
    fn test_target_selection() {
        assert_eq!(parse(&["--target=win64", "a.cpp"]).unwrap().target, Target::Win64);
        assert_eq!(parse(&["--target=linux64", "a.cpp"]).unwrap().target, Target::Linux64);
        assert!(parse(&["--target=mips", "a.cpp"]).is_err());
    }

    #[test]
    fn test_output_derived_from_input() {
        let opts = parse(&["src/thing.cpp"]).unwrap();
        assert_eq!(opts.output_for(&opts.inputs[0]), PathBuf::from("src/thing.o"));
    }

    #[test]
    fn test_no_inputs_is_an_error() {
        assert!(parse(&["-v"]).is_err());
    }

    #[test]
    fn test_multiple_inputs_reject_single_output() {
        assert!(parse(&["a.cpp", "b.cpp", "-o", "out.o"]).is_err());
    }

    #[test]
    fn test_opt_level_accepted() {
        assert_eq!(parse(&["-O2", "a.cpp"]).unwrap().opt_level, 2);
    }
}
