//! CLI entrypoint for the buddymalloc stress harness.

use std::path::PathBuf;

use buddymalloc_core::AllocatorLogLevel;
use buddymalloc_harness::{HarnessError, StressConfig, StressReport, plan_request, run_stress};
use buddymalloc_heap::{Heap, HeapConfig};
use clap::{Parser, Subcommand};

/// Stress and inspection tooling for buddymalloc.
#[derive(Debug, Parser)]
#[command(name = "buddymalloc-harness")]
#[command(about = "Stress and inspection harness for the buddymalloc heap")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a seeded multithreaded workload and print the heap report.
    Stress {
        /// Worker threads, each with its own arena.
        #[arg(long, default_value_t = 4)]
        threads: usize,
        /// Operations per worker.
        #[arg(long, default_value_t = 10_000)]
        ops: usize,
        /// Largest request in bytes.
        #[arg(long, default_value_t = 4096)]
        max_size: usize,
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "0xB0DD_7EE5")]
        seed: String,
        /// Minimum bin size in pages.
        #[arg(long, default_value_t = 128)]
        min_bin_pages: usize,
        /// Lifecycle log level kept in the report (trace|debug|info|warn|error).
        #[arg(long, default_value = "warn")]
        log_level: String,
        /// Output format: `text` (default) or `json`.
        #[arg(long, default_value = "text")]
        format: String,
        /// Output file path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Show the block and bin a single request would get.
    Plan {
        /// Request size in bytes.
        #[arg(long)]
        size: usize,
        /// Alignment in bytes (defaults to the word size).
        #[arg(long)]
        align: Option<usize>,
    },
}

fn main() -> Result<(), HarnessError> {
    let cli = Cli::parse();

    match cli.command {
        Command::Stress {
            threads,
            ops,
            max_size,
            seed,
            min_bin_pages,
            log_level,
            format,
            output,
        } => {
            if format != "text" && format != "json" {
                return Err(HarnessError::UnsupportedFormat(format));
            }
            let level = AllocatorLogLevel::from_str_loose(&log_level)
                .ok_or_else(|| HarnessError::UnknownLogLevel(log_level.clone()))?;
            let heap_config = HeapConfig::builder()
                .min_bin_pages(min_bin_pages)
                .log_level(level)
                .build()?;
            let config = StressConfig {
                threads,
                ops,
                max_size,
                seed: parse_seed(&seed)?,
            };

            eprintln!("Running {threads} workers x {ops} ops (seed {:#x})", config.seed);
            let heap = Heap::new(heap_config);
            let outcome = run_stress(&heap, &config)?;
            let verdict = outcome.check();
            let report = StressReport::capture(&heap, config, outcome);
            let rendered = if format == "json" {
                report.to_json()?
            } else {
                report.to_text(&heap)?
            };
            match output {
                Some(path) => {
                    std::fs::write(&path, rendered)?;
                    eprintln!("Wrote report to {}", path.display());
                }
                None => println!("{rendered}"),
            }
            verdict?;
        }
        Command::Plan { size, align } => {
            let plan = plan_request(&HeapConfig::detect(), size, align)?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
    }

    Ok(())
}

fn parse_seed(raw: &str) -> Result<u64, HarnessError> {
    let s = raw.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(&hex.replace('_', ""), 16)
    } else {
        s.replace('_', "").parse::<u64>()
    };
    parsed.map_err(|_| HarnessError::InvalidSeed(raw.to_string()))
}
