//! Convert a LightGlue release checkpoint.

use anyhow::Result;
use clap::Parser;
use graft::lightglue::{self, DEFAULT_CHECKPOINT_URL};
use graft::pipeline::{ConvertOptions, DEFAULT_ORGANIZATION};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "convert-lightglue")]
#[command(about = "Convert a LightGlue checkpoint into graft format")]
struct Args {
    /// Path to the output model directory.
    #[arg(long, required = true)]
    output_dir: PathBuf,

    /// URL of the original LightGlue checkpoint to convert.
    #[arg(long, default_value = DEFAULT_CHECKPOINT_URL)]
    checkpoint_url: String,

    /// Hub organization the converted model is uploaded under.
    #[arg(long, default_value = DEFAULT_ORGANIZATION)]
    organization: String,

    /// Save the model locally.
    #[arg(long)]
    save_model: bool,

    /// Push the model and image preprocessor to the hub.
    #[arg(long)]
    push_to_hub: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let options = ConvertOptions {
        output_dir: args.output_dir,
        organization: args.organization,
        save_model: args.save_model,
        push_to_hub: args.push_to_hub,
    };
    lightglue::convert(&options, &args.checkpoint_url)?;
    Ok(())
}
