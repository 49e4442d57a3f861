use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use picoflash_core::image::{self, encode_binary};
use picoflash_core::protocol::constants::{FLASH_START, RP2040_FAMILY_ID, UF2_BLOCK_SIZE};
use std::path::PathBuf;
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project
    Build,
    /// Run the test suite
    Test,
    /// Run the CLI with the given arguments
    Run {
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Wrap a raw binary into a UF2 image, for local testing
    Bin2uf2 {
        input: PathBuf,
        output: PathBuf,
        /// Load address
        #[arg(long, default_value_t = FLASH_START, value_parser = parse_u32)]
        base: u32,
        /// UF2 family id
        #[arg(long, default_value_t = RP2040_FAMILY_ID, value_parser = parse_u32)]
        family: u32,
    },
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| e.to_string())
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{} failed", what);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building project...");
            cargo(&["build"], "Build")?;
        }
        Commands::Test => {
            println!("Running tests...");
            cargo(&["test", "--workspace"], "Test")?;
        }
        Commands::Run { args } => {
            println!("Running CLI...");
            let mut full = vec!["run", "-p", "picoflash-cli", "--"];
            full.extend(args.iter().map(String::as_str));
            cargo(&full, "Run")?;
        }
        Commands::Bin2uf2 {
            input,
            output,
            base,
            family,
        } => {
            let data = std::fs::read(input)
                .with_context(|| format!("reading {}", input.display()))?;
            let uf2 = encode_binary(*base, &data, Some(*family));
            // Catch an unsupported family before writing
            image::parse(&uf2)?;
            std::fs::write(output, &uf2)?;
            println!(
                "Wrote {} ({} blocks, {})",
                output.display(),
                uf2.len() / UF2_BLOCK_SIZE,
                image::family_name(*family)
            );
        }
    }

    Ok(())
}
