use clap::{Parser, Subcommand};
use site_inspector::{logging, session, Config, LLMClient, Pipeline, Session};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "site-inspector")]
#[command(about = "Check construction-site photos against DIN 18202 with a vision LLM")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a single photo and print the assessment
    Analyze {
        /// Photo to analyze
        image: PathBuf,

        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },
    /// Interactive session: pick photos and analyze them one at a time
    Session {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },
    /// Generate a default configuration file
    Config {
        /// Output path for the config file (defaults to ~/.site-inspector.toml)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze {
            image,
            config,
            debug,
        } => {
            let config = load_config(config.as_ref(), debug)?;
            analyze_image(image, config).await?;
        }
        Commands::Session { config, debug } => {
            let config = load_config(config.as_ref(), debug)?;
            run_session(config).await?;
        }
        Commands::Config { output } => {
            generate_config(output)?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>, debug: bool) -> anyhow::Result<Config> {
    let config = Config::load_from(path)?;
    logging::init(debug, Some(&config.logging.level));
    let source = path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "default".to_string());
    tracing::debug!(%source, model = %config.llm.model, "Configuration loaded");
    if config.llm.api_key.is_none() {
        tracing::warn!("No API key configured; set OPENAI_API_KEY or llm.api_key");
    }
    Ok(config)
}

async fn analyze_image(image: PathBuf, config: Config) -> anyhow::Result<()> {
    let start_time = Instant::now();
    let client = LLMClient::new(config.llm.clone())?;
    let mut pipeline = Pipeline::new(config);

    session::analyze_once(&mut pipeline, &client, image, &mut std::io::stdout()).await?;
    tracing::info!(
        elapsed_ms = start_time.elapsed().as_millis() as u64,
        "Analysis finished"
    );

    if pipeline.result().map_or(true, |r| r.is_error()) {
        anyhow::bail!("Analysis did not produce an assessment");
    }
    Ok(())
}

async fn run_session(config: Config) -> anyhow::Result<()> {
    let client = LLMClient::new(config.llm.clone())?;
    let mut session = Session::new(Pipeline::new(config), &client);
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut out = std::io::stdout();

    session.run(stdin, &mut out).await
}

fn generate_config(output_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config_path = output_path.unwrap_or_else(|| {
        Config::default_config_path().unwrap_or_else(|_| PathBuf::from("site-inspector.toml"))
    });

    println!("📝 Generating configuration file: {}", config_path.display());

    Config::write_documented(&config_path)?;

    println!("✅ Configuration file created successfully!");
    println!("💡 Edit the [prompts] section to change what the inspection looks for.");
    println!("🔑 Leave api_key unset to read OPENAI_API_KEY from the environment.");

    Ok(())
}
