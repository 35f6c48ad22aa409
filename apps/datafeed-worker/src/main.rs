#[tokio::main]
async fn main() -> eyre::Result<()> {
    datafeed_worker::run().await
}
