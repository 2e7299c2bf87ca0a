mod application;
mod presentation;

use ovi_core::error::Result;

#[tokio::main]
async fn main() -> Result<()> {
    application::run().await
}
