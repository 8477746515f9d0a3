//! modelplane CLI
//!
//! Command-line client for the modelplane REST API.

use clap::{Parser, Subcommand, ValueEnum};
use modelplane_core::{FunctionCategory, ModelFormat, DEFAULT_CHUNK_SIZE};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

mod commands;

/// modelplane - cluster-wide model hosting
#[derive(Parser)]
#[command(name = "modelplane")]
#[command(version, about, long_about = None)]
struct Cli {
    /// API server address
    #[arg(long, default_value = "http://localhost:9200", global = true)]
    api: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CategoryArg {
    Remote,
    LocalBinary,
    BuiltIn,
}

impl From<CategoryArg> for FunctionCategory {
    fn from(arg: CategoryArg) -> Self {
        match arg {
            CategoryArg::Remote => FunctionCategory::Remote,
            CategoryArg::LocalBinary => FunctionCategory::LocalBinary,
            CategoryArg::BuiltIn => FunctionCategory::BuiltIn,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FormatArg {
    Onnx,
    TorchScript,
    Gguf,
}

impl From<FormatArg> for ModelFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Onnx => ModelFormat::Onnx,
            FormatArg::TorchScript => ModelFormat::TorchScript,
            FormatArg::Gguf => ModelFormat::Gguf,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Register a model, fetching its content on the server
    Register {
        /// Model name
        name: String,

        /// Model category
        #[arg(long, value_enum, default_value = "local-binary")]
        category: CategoryArg,

        /// Artifact format (local binaries)
        #[arg(long, value_enum)]
        format: Option<FormatArg>,

        /// Content URL
        #[arg(long, conflicts_with = "file")]
        url: Option<String>,

        /// Content file path on the server
        #[arg(long)]
        file: Option<PathBuf>,

        /// Remote endpoint as host:port
        #[arg(long)]
        endpoint: Option<String>,

        /// Built-in parameters as JSON
        #[arg(long)]
        params: Option<String>,

        /// Existing model group to add a version to
        #[arg(long)]
        group: Option<String>,

        /// Deploy once registered
        #[arg(long)]
        deploy: bool,
    },

    /// Upload a local artifact in chunks
    Upload {
        /// Path to the artifact
        path: PathBuf,

        /// Model name
        #[arg(long)]
        name: String,

        /// Artifact format
        #[arg(long, value_enum)]
        format: Option<FormatArg>,

        /// Existing model group to add a version to
        #[arg(long)]
        group: Option<String>,

        /// Chunk size in bytes
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },

    /// Show a model's meta document
    Get {
        /// Model id
        model_id: String,
    },

    /// Deploy a model
    Deploy {
        /// Model id
        model_id: String,

        /// Target nodes (default: every eligible node)
        #[arg(long, value_delimiter = ',')]
        nodes: Vec<String>,

        /// Return the task id without waiting
        #[arg(long)]
        no_wait: bool,
    },

    /// Undeploy models from every hosting node
    Undeploy {
        /// Model ids
        #[arg(required = true)]
        model_ids: Vec<String>,
    },

    /// Run a prediction
    Predict {
        /// Model id
        model_id: String,

        /// Input as JSON
        input: String,

        /// Caller identity for per-user rate limits
        #[arg(long)]
        user: Option<String>,
    },

    /// Show latency profiles
    Profile {
        /// Model id (default: all models)
        model_id: Option<String>,
    },

    /// Show which nodes host which models
    Routing,

    /// Show a task
    Task {
        /// Task id
        task_id: String,
    },

    /// Show node status
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let client = commands::ApiClient::new(&cli.api);

    match cli.command {
        Commands::Register {
            name,
            category,
            format,
            url,
            file,
            endpoint,
            params,
            group,
            deploy,
        } => {
            let input = commands::RegisterArgs {
                name,
                category: category.into(),
                format: format.map(Into::into),
                url,
                file,
                endpoint,
                params,
                group,
                deploy,
            }
            .into_input()?;
            commands::register(&client, input).await?;
        }
        Commands::Upload {
            path,
            name,
            format,
            group,
            chunk_size,
        } => {
            commands::upload(&client, &path, name, format.map(Into::into), group, chunk_size)
                .await?;
        }
        Commands::Get { model_id } => {
            commands::get_model(&client, &model_id).await?;
        }
        Commands::Deploy {
            model_id,
            nodes,
            no_wait,
        } => {
            commands::deploy(&client, &model_id, nodes, !no_wait).await?;
        }
        Commands::Undeploy { model_ids } => {
            commands::undeploy(&client, model_ids).await?;
        }
        Commands::Predict {
            model_id,
            input,
            user,
        } => {
            commands::predict(&client, &model_id, &input, user).await?;
        }
        Commands::Profile { model_id } => {
            commands::profile(&client, model_id.as_deref()).await?;
        }
        Commands::Routing => {
            commands::routing(&client).await?;
        }
        Commands::Task { task_id } => {
            commands::task(&client, &task_id).await?;
        }
        Commands::Status => {
            commands::status(&client).await?;
        }
    }

    Ok(())
}
