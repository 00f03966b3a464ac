use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

mod commands;

#[derive(Parser)]
#[command(name = "dazzle")]
#[command(about = "Dazzle is a very experimental Docker image builder with independent layers", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Project context directory
    #[arg(long, global = true, default_value = ".")]
    context: PathBuf,

    /// Address of the build daemon
    #[arg(long, global = true, default_value = "unix:///run/buildkit/buildkitd.sock")]
    addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build all chunk images of the project
    Build {
        /// Target image repository, e.g. "eu.gcr.io/some/repo"
        target_ref: String,

        /// Disable the build cache
        #[arg(long)]
        no_cache: bool,

        /// Disable the build-time tests
        #[arg(long)]
        no_tests: bool,

        /// Force plain (non-colored) build output
        #[arg(long)]
        plain_output: bool,

        /// Tag chunked images without the fingerprint component
        #[arg(long)]
        chunked_without_hash: bool,

        /// Use a different cache ref than the target ref
        #[arg(long)]
        build_ref: Option<String>,
    },

    /// Combine previously built chunks into a single image
    Combine {
        /// Target image reference
        target_ref: String,

        /// Build all combinations of the project config
        #[arg(long)]
        all: bool,

        /// Build a specific combination
        #[arg(long)]
        combination: Option<String>,

        /// Combine a set of chunks - format is name=chk1,chk2,chkN
        #[arg(long)]
        chunks: Option<String>,

        /// Disable the tests
        #[arg(long)]
        no_test: bool,

        /// Use a different build-ref than the target-ref
        #[arg(long)]
        build_ref: Option<String>,
    },

    /// Combine previously built chunks without a dazzle.yaml file
    CombineFromRef {
        /// Target image reference
        target_ref: String,

        /// Chunk references to combine
        #[arg(required = true)]
        chunk_refs: Vec<String>,

        /// Disable the tests
        #[arg(long)]
        no_test: bool,

        /// Demote differing base images to a warning
        #[arg(long)]
        ignore_differing_base_refs: bool,
    },

    /// Run a test suite against an already-built image
    Test {
        /// Path to the test suite YAML file
        suite: PathBuf,

        /// Image reference to test
        image: String,

        /// Save the results as a JUnit XML file
        #[arg(long)]
        output_xml: Option<PathBuf>,
    },

    /// Project scaffolding and debugging helpers
    #[command(subcommand)]
    Project(ProjectCommands),
}

#[derive(Subcommand)]
enum ProjectCommands {
    /// Initialize a dazzle project, or a single chunk when a name is given
    Init {
        /// Chunk name to scaffold instead of a whole project
        chunk: Option<String>,
    },

    /// Add a combination to the project config
    AddCombination {
        name: String,
        #[arg(required = true)]
        chunks: Vec<String>,
    },

    /// Add ignore patterns for the chunks directory
    Ignore {
        #[arg(required = true)]
        patterns: Vec<String>,
    },

    /// Print a chunk's fingerprints
    Hash { chunk: String },

    /// Print a chunk's canonical hash manifest
    PrintManifest { chunk: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_directive = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::builder()
        .with_default_directive(default_directive.parse().expect("static directive"))
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    if let Err(e) = run(cli).await {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Build {
            target_ref,
            no_cache,
            no_tests,
            plain_output,
            chunked_without_hash,
            build_ref,
        } => {
            commands::build::run(
                &cli.context,
                &cli.addr,
                commands::build::Args {
                    target_ref,
                    no_cache,
                    no_tests,
                    plain_output,
                    chunked_without_hash,
                    build_ref,
                },
            )
            .await
        }
        Commands::Combine {
            target_ref,
            all,
            combination,
            chunks,
            no_test,
            build_ref,
        } => {
            commands::combine::run(
                &cli.context,
                &cli.addr,
                commands::combine::Args {
                    target_ref,
                    all,
                    combination,
                    chunks,
                    no_test,
                    build_ref,
                },
            )
            .await
        }
        Commands::CombineFromRef {
            target_ref,
            chunk_refs,
            no_test,
            ignore_differing_base_refs,
        } => {
            commands::combine_from_ref::run(
                &cli.addr,
                target_ref,
                chunk_refs,
                no_test,
                ignore_differing_base_refs,
            )
            .await
        }
        Commands::Test {
            suite,
            image,
            output_xml,
        } => commands::test::run(&cli.addr, &suite, &image, output_xml.as_deref()).await,
        Commands::Project(project) => match project {
            ProjectCommands::Init { chunk } => commands::project::init(&cli.context, chunk),
            ProjectCommands::AddCombination { name, chunks } => {
                commands::project::add_combination(&cli.context, &name, &chunks)
            }
            ProjectCommands::Ignore { patterns } => {
                commands::project::ignore(&cli.context, &patterns)
            }
            ProjectCommands::Hash { chunk } => commands::project::hash(&cli.context, &chunk),
            ProjectCommands::PrintManifest { chunk } => {
                commands::project::print_manifest(&cli.context, &chunk)
            }
        },
    }
}
