use slog::Drain;

mod cipher;
mod config;
mod socks;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| config::DEFAULT_PATH.to_owned());
    let loaded = config::load(&path)?;
    let settings = loaded.settings;

    let logger = setup_logger(settings.log_level);
    if loaded.generated_password {
        slog::info!(logger, "generated new password"; "config" => &path);
    }
    let server = socks::Server::bind(logger.clone(), &settings).await?;
    server.serve().await
}

fn setup_logger(level: slog::Level) -> slog::Logger {
    let decorator = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let drain = slog_term::FullFormat::new(decorator)
        .build()
        .filter_level(level)
        .fuse();
    slog::Logger::root(drain, slog::o!())
}
