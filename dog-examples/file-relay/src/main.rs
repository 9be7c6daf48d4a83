use anyhow::Result;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = file_relay::config::load();
    let config = file_relay::ServiceConfig::from_snapshot(&config.snapshot())?;

    let runtime = config.runtime.build()?;
    runtime.block_on(serve(config))
}

async fn serve(config: file_relay::ServiceConfig) -> Result<()> {
    let ax = file_relay::build(&config).await?;

    let addr = config.addr();

    println!("[file-relay] {} store listening on http://{addr}", config.store.kind());

    ax.listen(addr).await?;

    Ok(())
}
