use clap::Parser;
use clap::builder::Styles;
use clap::builder::styling::AnsiColor;
use mb2osm::MbtilesConverter;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Defines the styles used for the CLI help output.
const HELP_STYLES: Styles = Styles::styled()
    .header(AnsiColor::Blue.on_default().bold())
    .usage(AnsiColor::Blue.on_default().bold())
    .literal(AnsiColor::White.on_default())
    .placeholder(AnsiColor::Green.on_default());

#[derive(Parser, PartialEq, Debug)]
#[command(
    version,
    name = "mb2osm",
    about = "Convert an MBTiles raster tile file into an OSMAnd .sqlitedb tile file",
    after_help = "Use RUST_LOG environment variable to control logging level, e.g. RUST_LOG=debug or RUST_LOG=mb2osm=debug.",
    styles = HELP_STYLES
)]
pub struct Args {
    /// Display detailed information
    #[arg(short, long)]
    verbose: bool,
    /// Print the conversion summary as YAML
    #[arg(long)]
    summary_yaml: bool,
    #[command(flatten)]
    converter: MbtilesConverter,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    if let Err(err) = main_int(args).await {
        error!("{err:#}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "mb2osm=debug" } else { "mb2osm=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

async fn main_int(args: Args) -> anyhow::Result<()> {
    let summary = args.converter.run().await?;
    if args.summary_yaml {
        print!("{}", serde_yaml::to_string(&summary)?);
    } else {
        println!("{summary}");
    }
    Ok(())
}
