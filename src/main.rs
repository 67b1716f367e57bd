use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    wraith::cli::run().await
}
