use anyhow::Result;
use clap::{Parser, Subcommand};
use conductor_config::ConductorConfig;
use conductor_core::{ChatMessage, ChatRequest, SessionEvent};
use conductor_engine::{ChannelSink, Engine, EngineConfig};
use conductor_mcp::{parse_quick_add, EndpointsConfig, HttpRpc, SessionRegistry};
use conductor_model::OpenAiCompatClient;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Bridge chat models to remote MCP tool servers", long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "FILE", default_value = "conductor.yaml")]
    config: PathBuf,

    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single turn
    Ask {
        /// The user message
        #[arg(short, long)]
        prompt: String,

        /// Endpoint ids to make available this turn (default: all)
        #[arg(short, long)]
        endpoint: Vec<String>,

        /// Override the configured model
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Interactive conversation mode
    Chat {
        /// Endpoint ids to make available (default: all)
        #[arg(short, long)]
        endpoint: Vec<String>,
    },

    /// Discover and list tools across registered endpoints
    Tools,

    /// List registered endpoints
    Endpoints,

    /// Parse a raw endpoint URL into a config entry
    Add {
        /// Endpoint URL, optionally carrying a token= credential
        input: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;

    let config = if cli.config.exists() {
        info!("Loading configuration from: {:?}", cli.config);
        ConductorConfig::from_yaml(&cli.config)?
    } else {
        info!("Using default configuration");
        ConductorConfig::default()
    };

    let registry = build_registry(&config).await?;

    match cli.command {
        Commands::Ask {
            prompt,
            endpoint,
            model,
        } => {
            let engine = build_engine(&config, registry.clone())?;
            let endpoints = resolve_endpoint_ids(&registry, endpoint).await;
            let request = ChatRequest {
                message: prompt,
                endpoints,
                model: model.unwrap_or_else(|| config.chat.model.clone()),
            };
            run_turn(&engine, &request, initial_history(&config)).await?;
        }
        Commands::Chat { endpoint } => {
            let engine = build_engine(&config, registry.clone())?;
            let endpoints = resolve_endpoint_ids(&registry, endpoint).await;
            interactive_chat(&config, &engine, endpoints).await?;
        }
        Commands::Tools => {
            list_tools(&registry).await;
        }
        Commands::Endpoints => {
            list_endpoints(&registry).await;
        }
        Commands::Add { input } => {
            quick_add(&input)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) -> Result<()> {
    let default_filter = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;

    Ok(())
}

async fn build_registry(config: &ConductorConfig) -> Result<Arc<SessionRegistry>> {
    let mut endpoints = EndpointsConfig::new();
    for file in &config.endpoints.config_files {
        match EndpointsConfig::load_from_file(file).await {
            Ok(loaded) => endpoints.merge(loaded),
            Err(e) => warn!("skipping endpoints file {:?}: {e}", file),
        }
    }
    for dir in &config.endpoints.config_dirs {
        for loaded in EndpointsConfig::load_from_directory(dir).await? {
            endpoints.merge(loaded);
        }
    }

    let transport = Arc::new(HttpRpc::new()?);
    let registry = Arc::new(SessionRegistry::new(transport));
    for (id, endpoint_config) in endpoints.enabled_endpoints() {
        registry
            .register(endpoint_config.clone().into_endpoint(id))
            .await;
    }
    Ok(registry)
}

fn build_engine(config: &ConductorConfig, registry: Arc<SessionRegistry>) -> Result<Engine> {
    let api_key = config
        .chat
        .api_key
        .clone()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok());
    let backend = Arc::new(
        OpenAiCompatClient::new(config.chat.provider_url.clone(), api_key)?
            .with_max_tokens(config.chat.max_tokens),
    );
    let engine_config = EngineConfig {
        max_rounds: config.limits.max_rounds,
        max_tools: config.limits.max_tools,
        completion_retries: config.limits.completion_retries,
        retry_initial_delay_ms: config.limits.retry_initial_delay_ms,
        retry_max_delay_ms: config.limits.retry_max_delay_ms,
    };
    Ok(Engine::new(registry, backend, engine_config))
}

async fn resolve_endpoint_ids(registry: &SessionRegistry, selected: Vec<String>) -> Vec<String> {
    if selected.is_empty() {
        registry.list().await.iter().map(|e| e.id.clone()).collect()
    } else {
        selected
    }
}

fn initial_history(config: &ConductorConfig) -> Vec<ChatMessage> {
    match &config.chat.system_prompt {
        Some(prompt) => vec![ChatMessage::system(prompt.as_str())],
        None => Vec::new(),
    }
}

async fn run_turn(
    engine: &Engine,
    request: &ChatRequest,
    history: Vec<ChatMessage>,
) -> Result<Vec<ChatMessage>> {
    let (sink, mut rx) = ChannelSink::new(64);

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                SessionEvent::Status { message } => println!("· {message}"),
                SessionEvent::ToolCall {
                    server,
                    tool,
                    arguments,
                } => println!("→ [{server}] {tool} {arguments}"),
                SessionEvent::ToolResult {
                    server,
                    tool,
                    result,
                } => println!("← [{server}] {tool} {}", truncate(&result.to_string(), 200)),
                SessionEvent::Message { content, .. } => println!("\n{content}\n"),
                SessionEvent::Error { message } => eprintln!("⚠ {message}"),
            }
        }
    });

    let conversation = engine.run_turn(request, history, &sink).await;
    drop(sink);
    printer.await.ok();

    Ok(conversation?)
}

async fn interactive_chat(
    config: &ConductorConfig,
    engine: &Engine,
    endpoints: Vec<String>,
) -> Result<()> {
    println!("Interactive chat. Type 'exit' to quit.\n");
    let mut history = initial_history(config);

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if io::stdin().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }

        let request = ChatRequest {
            message: line.to_string(),
            endpoints: endpoints.clone(),
            model: config.chat.model.clone(),
        };

        match run_turn(engine, &request, history.clone()).await {
            Ok(conversation) => history = conversation,
            Err(e) => eprintln!("⚠ turn failed: {e}"),
        }
    }

    Ok(())
}

async fn list_tools(registry: &SessionRegistry) {
    let endpoints = registry.list().await;
    if endpoints.is_empty() {
        println!("No endpoints registered.");
        return;
    }

    for endpoint in endpoints {
        match registry.catalog(&endpoint.id).await {
            Ok(catalog) => {
                println!("{} ({} tools)", endpoint.id, catalog.len());
                for tool in catalog.iter() {
                    println!("  {} — {}", tool.name, truncate(&tool.description, 80));
                }
            }
            Err(e) => println!("{} (unavailable: {e})", endpoint.id),
        }
    }
}

async fn list_endpoints(registry: &SessionRegistry) {
    let endpoints = registry.list().await;
    if endpoints.is_empty() {
        println!("No endpoints registered.");
        return;
    }
    for endpoint in endpoints {
        let marker = if endpoint.quirks.connector {
            " [connector]"
        } else {
            ""
        };
        println!("{}{marker}  {}", endpoint.id, endpoint.url);
    }
}

fn quick_add(input: &str) -> Result<()> {
    let (name, endpoint_config) = parse_quick_add(input)?;
    let mut config = EndpointsConfig::new();
    config.endpoints.insert(name.clone(), endpoint_config);
    println!("# add to your endpoints file:");
    print!("{}", serde_yaml::to_string(&config)?);
    info!("parsed endpoint '{name}'");
    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let head: String = text.chars().take(max).collect();
        format!("{head}...")
    }
}
