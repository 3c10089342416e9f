//! Convert an EfficientLoFTR release checkpoint.

use anyhow::Result;
use clap::Parser;
use graft::efficientloftr::{self, DEFAULT_FILE, DEFAULT_MODEL_REPO};
use graft::pipeline::{ConvertOptions, DEFAULT_ORGANIZATION};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "convert-efficientloftr")]
#[command(about = "Convert an EfficientLoFTR checkpoint into graft format")]
struct Args {
    /// Path to the output model directory.
    #[arg(long, required = true)]
    output_dir: PathBuf,

    /// Model repo id of the original EfficientLoFTR checkpoint to convert.
    #[arg(long, default_value = DEFAULT_MODEL_REPO)]
    repo_id: String,

    /// File name of the original EfficientLoFTR checkpoint to convert.
    #[arg(long, default_value = DEFAULT_FILE)]
    file_name: String,

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
    efficientloftr::convert(&options, &args.repo_id, &args.file_name)?;
    Ok(())
}
