//! Blockspace Inspector
//!
//! Prints the directory summary of a data file and optionally checks or
//! repairs it.

use anyhow::{bail, Context};
use blockspace::{DataSpaceManager, SpaceConfig};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "blockspace-inspect")]
#[command(about = "Inspect, check and repair block space data files")]
struct Args {
    /// Path to the data file
    file: PathBuf,

    /// TOML configuration (tuning values only; geometry comes from the file)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Run the directory consistency checks
    #[arg(long)]
    check: bool,

    /// Rewrite directory counters that disagree with their bitmaps
    #[arg(long)]
    repair: bool,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => SpaceConfig::from_file(path)
            .with_context(|| format!("loading configuration from {:?}", path))?,
        None => SpaceConfig::default(),
    }
    .with_read_only(!args.repair);

    let spaces = DataSpaceManager::open(&args.file, &config)
        .with_context(|| format!("opening {:?}", args.file))?;

    let mut problems = 0;
    if args.check || args.repair {
        for mismatch in spaces.check_directory_spaces()? {
            println!(
                "block {} (space {}): bitmap is misplaced or shared",
                mismatch.block_index, mismatch.space_id
            );
            problems += 1;
        }

        for mismatch in spaces.check_directory_bitmaps()? {
            println!(
                "block {} (space {}): counters {}/{} but bitmap has {}/{} free",
                mismatch.block_index,
                mismatch.space_id,
                mismatch.recorded_free,
                mismatch.recorded_trailing,
                mismatch.live_free,
                mismatch.live_trailing
            );
            problems += 1;
        }
    }

    if args.repair {
        let repaired = spaces.repair_directory_bitmaps()?;
        info!("Repaired {} block(s)", repaired);
    }

    let stats = spaces.stats()?;
    if args.json {
        println!("{}", stats.to_json()?);
    } else {
        println!("file size:       {} bytes", stats.file_size);
        println!(
            "geometry:        {} byte blocks, {} byte units ({} per block)",
            stats.file_block_size, stats.unit_size, stats.units_per_block
        );
        println!("blocks:          {}", stats.provisioned_blocks);
        println!("  directory:     {}", stats.directory_blocks);
        println!("  empty:         {}", stats.empty_blocks);
        println!("  set aside:     {}", stats.set_aside_blocks);
        for (space_id, blocks) in &stats.blocks_per_space {
            println!("  space {:<8} {}", space_id, blocks);
        }
        println!("lost:            {} bytes", stats.lost_bytes);
    }

    spaces.close()?;

    if problems > 0 && !args.repair {
        bail!("{} directory problem(s) found", problems);
    }
    Ok(())
}
