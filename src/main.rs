// zilch - ZIL compiler for the Z-machine
// Compiles ZIL source files to story files playable on any conforming
// interpreter.

use std::env;
use std::path::{Path, PathBuf};
use std::process;

use zilch::Compiler;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage(&args[0]);
        process::exit(1);
    }

    let mut input_file = String::new();
    let mut output_file: Option<PathBuf> = None;
    let mut version: u8 = 3;
    let mut includes: Vec<PathBuf> = Vec::new();
    let mut verbose = false;
    let mut string_dedup = false;
    let mut lax_brackets = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-o" | "--output" => {
                if i + 1 >= args.len() {
                    eprintln!("error: -o requires a filename");
                    process::exit(1);
                }
                output_file = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            "-v" | "--version" => {
                if i + 1 >= args.len() {
                    eprintln!("error: -v requires a version 1..8");
                    process::exit(1);
                }
                version = match args[i + 1].parse::<u8>() {
                    Ok(n) if (1..=8).contains(&n) => n,
                    _ => {
                        eprintln!("error: unsupported version '{}', use 1..8", args[i + 1]);
                        process::exit(1);
                    }
                };
                i += 2;
            }
            "-i" | "--include" => {
                if i + 1 >= args.len() {
                    eprintln!("error: -i requires a filename");
                    process::exit(1);
                }
                includes.push(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            "--verbose" => {
                verbose = true;
                i += 1;
            }
            "--string-dedup" => {
                string_dedup = true;
                i += 1;
            }
            "--lax-brackets" => {
                lax_brackets = true;
                i += 1;
            }
            "-h" | "--help" => {
                print_usage(&args[0]);
                process::exit(0);
            }
            arg if arg.starts_with('-') => {
                eprintln!("error: unknown option '{}'", arg);
                print_usage(&args[0]);
                process::exit(1);
            }
            _ => {
                if input_file.is_empty() {
                    input_file = args[i].clone();
                } else {
                    eprintln!("error: multiple input files specified");
                    process::exit(1);
                }
                i += 1;
            }
        }
    }

    // --verbose raises the log filter so stepwise progress reaches stderr.
    let mut builder = env_logger::Builder::from_default_env();
    if verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();

    if input_file.is_empty() {
        eprintln!("error: no input file specified");
        print_usage(&args[0]);
        process::exit(1);
    }

    let input_path = Path::new(&input_file);
    let mut compiler = Compiler::new(version);
    compiler.set_string_dedup(string_dedup);
    compiler.set_lax_brackets(lax_brackets);
    if let Some(parent) = input_path.parent() {
        compiler.set_include_paths(vec![parent.to_path_buf()]);
    }

    let result = if includes.is_empty() {
        compiler.compile_file(input_path, output_file.as_deref()).map(|path| {
            if verbose {
                eprintln!("[zilch] wrote {}", path.display());
            }
        })
    } else {
        compiler.compile_file_multi(input_path, &includes).and_then(|story| {
            let output = match &output_file {
                Some(path) => path.clone(),
                None => input_path.with_extension(format!("z{}", version)),
            };
            std::fs::write(&output, &story)?;
            if verbose {
                eprintln!("[zilch] wrote {} bytes to {}", story.len(), output.display());
            }
            Ok(())
        })
    };

    if let Err(err) = result {
        eprintln!("{}", err);
        process::exit(1);
    }
}

fn print_usage(program: &str) {
    println!("Usage: {} [options] <input.zil>", program);
    println!();
    println!("Options:");
    println!("  -o, --output <file>    Output story file (default: input basename + .zN)");
    println!("  -v, --version <1-8>    Target Z-machine version (default: 3)");
    println!("  -i, --include <file>   Concatenate an extra source file (repeatable)");
    println!("  --string-dedup         Deduplicated string table + PRINT_PADDR for TELL");
    println!("  --lax-brackets         Repair unbalanced angle brackets in old sources");
    println!("  --verbose              Stepwise progress on standard error");
}
