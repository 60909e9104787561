use std::path::PathBuf;

use clap::Parser;
use gridtrack_convert::{config, ConvertConfig, DirectRenamer, NamingPolicy, NativeToolkit};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(about = "Export GridTrackNet as a deployment package")]
struct Args {
    /// Pretrained core weights
    #[arg(long, default_value = config::DEFAULT_WEIGHTS_PATH)]
    weights: PathBuf,
    /// Destination package directory
    #[arg(long, default_value = config::DEFAULT_OUTPUT_PATH)]
    out: PathBuf,
    /// Log filter, e.g. `info` or `gridtrack_convert=debug`
    #[arg(long, default_value = "info")]
    log: String,
    /// Write the package even if output names cannot be repaired
    #[arg(long)]
    lenient_names: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log))
        .init();

    let config = ConvertConfig {
        weights_path: args.weights,
        output_path: args.out,
        naming_policy: if args.lenient_names {
            NamingPolicy::Lenient
        } else {
            NamingPolicy::Strict
        },
        ..ConvertConfig::default()
    };
    let report = gridtrack_convert::run(&config, &NativeToolkit::new(), &DirectRenamer)?;
    println!("Output names: {:?}", report.output_names);
    println!("Saved: {}", report.path.display());
    Ok(())
}
