use anyhow::Context;
use creditsync::{app, cli::args_from_env, config::Config, logging::init_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = args_from_env()?;
    let config = Config::load(&args.config_path)
        .with_context(|| format!("failed to load config from {}", args.config_path.display()))?;
    let logging = init_tracing(&config.logging)?;
    tracing::debug!(
        target: "creditsync",
        run_id = logging.run_id(),
        log_dir = %logging.log_dir().display(),
        command = ?args.command,
        "creditsync_starting"
    );

    app::run(config, args.command).await
}
