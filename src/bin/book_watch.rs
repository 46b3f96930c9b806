//! Diagnostic: connect the configured venues and print top-of-book lines.

use anyhow::Result;
use cross_arb_bot::bin_common::{cli::CliOptions, runner};
use crossarb::infrastructure::logging::init_tracing_with_level;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    let options = CliOptions::from_env()?;
    init_tracing_with_level(&options.log_level);

    let app = runner::build(options.settings);
    app.start().await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for &pair in &app.settings.pairs {
                    for &venue in &app.settings.venues {
                        if let Some(best) = app.books.best_prices(venue, pair) {
                            println!(
                                "{pair} {venue}: bid {} ({}) / ask {} ({})",
                                best.best_bid, best.best_bid_qty, best.best_ask, best.best_ask_qty
                            );
                        }
                    }
                }
                println!("---");
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    app.shutdown().await;
    Ok(())
}
