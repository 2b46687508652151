// src/main.rs

use anyhow::Result;

use depmake::{cli, logging};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::parse();
    logging::init_logging(args.log_level)?;
    depmake::run(args).await
}
