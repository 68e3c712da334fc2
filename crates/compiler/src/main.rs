//! `scathac` — compile Scatha source to bytecode and optionally run it.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use scathac::{compile_source, CompilerConfig};
use scatha_vm::{VirtualMachine, VmOptions};

#[derive(Parser)]
#[command(name = "scathac", about = "Compiler for the Scatha programming language")]
struct Cli {
    /// Source file to compile.
    input: PathBuf,

    /// Output path for the program image (defaults to `<input>.sbin`).
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Run the compiled program on the VM and use its result as the exit
    /// code.
    #[arg(long)]
    run: bool,

    /// Compiler configuration file (TOML).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Additional native library search directories.
    #[arg(long = "lib", value_name = "DIR")]
    library_paths: Vec<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(message) => {
            eprintln!("{}", message.trim_end());
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, String> {
    let mut config = match &cli.config {
        Some(path) => CompilerConfig::load(path)?,
        None => CompilerConfig::default(),
    };
    config.library_search_paths.extend(cli.library_paths.iter().cloned());

    let source = std::fs::read_to_string(&cli.input)
        .map_err(|e| format!("failed to read '{}': {}", cli.input.display(), e))?;
    let image = compile_source(&source, &config).map_err(|e| e.to_string())?;

    if cli.run {
        let mut vm = VirtualMachine::new(VmOptions {
            register_count: config.vm.register_count,
            stack_size: config.vm.stack_size,
        });
        vm.load_binary(&image).map_err(|e| e.to_string())?;
        let result = vm.execute(&[]).map_err(|e| e.to_string())?;
        return Ok(ExitCode::from(result as u8));
    }

    let output = cli
        .output
        .unwrap_or_else(|| cli.input.with_extension("sbin"));
    std::fs::write(&output, &image)
        .map_err(|e| format!("failed to write '{}': {}", output.display(), e))?;
    Ok(ExitCode::SUCCESS)
}
