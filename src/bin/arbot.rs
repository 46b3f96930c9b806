//! Cross-exchange arbitrage bot entry point.

use anyhow::Result;
use cross_arb_bot::bin_common::{cli::CliOptions, runner};
use crossarb::infrastructure::logging::init_tracing_with_level;

#[tokio::main]
async fn main() -> Result<()> {
    let options = CliOptions::from_env()?;
    init_tracing_with_level(&options.log_level);

    let app = runner::build(options.settings);
    app.start().await?;
    app.run_until_ctrl_c().await;
    app.shutdown().await;
    Ok(())
}
