use cdcsink_app::config::AppConfig;
use config::Config;
use std::env;
use std::process;
use tracing::error;

/// Default worker thread count for the runtime.
const DEFAULT_WORKER_THREADS: usize = 8;

fn main() {
    // Install global log collector.
    tracing_subscriber::fmt::init();

    // Setup environment variables.
    if let Ok(app_home) = env::var("APP_HOME") {
        env::set_current_dir(&app_home).unwrap_or_else(|err| {
            error!(
                "Failed to change working directory to {}: {}",
                app_home, err
            );
            process::exit(1);
        });
    }

    let app_config = match env::var("CONFIG_PATH") {
        Ok(config_path) => load_app_config(&config_path).unwrap_or_else(|err| {
            error!("Failed to load configuration {}: {}", config_path, err);
            process::exit(1);
        }),
        Err(_) => AppConfig::default(),
    };

    let worker_threads = env::var("WORKER_THREADS")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(DEFAULT_WORKER_THREADS);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
        .unwrap_or_else(|err| {
            error!("Failed to build runtime: {}", err);
            process::exit(1);
        });

    // Run cdcsink service with a provided config.
    runtime.block_on(async {
        let app = cdcsink_app::app::App { config: app_config };
        if let Err(err) = app.run().await {
            error!("{:?}", err);
            process::exit(1);
        }
    });
}

/// Loads the application configuration from a YAML or JSON file.
fn load_app_config(config_path: &str) -> Result<AppConfig, Box<dyn std::error::Error>> {
    let path = std::path::Path::new(config_path);
    let contents = std::fs::read_to_string(path)?;

    let file_format = match path.extension().and_then(|s| s.to_str()) {
        Some("yaml") | Some("yml") => config::FileFormat::Yaml,
        Some("json") => config::FileFormat::Json,
        _ => config::FileFormat::Json,
    };

    let app_config = Config::builder()
        .add_source(config::File::from_str(&contents, file_format))
        .build()?
        .try_deserialize::<AppConfig>()?;

    Ok(app_config)
}
