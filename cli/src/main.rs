use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    engram::run().await
}
