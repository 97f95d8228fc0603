mod app;
mod notifier;
mod safety;
mod scheduler;
mod store;
mod telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    app::run().await
}
