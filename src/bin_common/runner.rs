//! Wires the components together and drives the process lifecycle.

use anyhow::Result;
use crossarb::infrastructure::venue::VenueDeps;
use crossarb::{
    order_update_channel, AnomalyCounters, ArbStrategy, BalanceBook, ExecutionManager,
    OrderBookManager, Settings, TimerKind, TimerService, VenueGateway, VenueRegistry,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct App {
    pub settings: Arc<Settings>,
    pub timers: Arc<TimerService>,
    pub counters: Arc<AnomalyCounters>,
    pub books: Arc<OrderBookManager>,
    pub registry: Arc<VenueRegistry>,
    pub execution: Arc<ExecutionManager>,
    pub strategies: Vec<Arc<ArbStrategy>>,
    pub balances: Arc<BalanceBook>,
    timer_thread: Option<std::thread::JoinHandle<()>>,
}

/// Build the full component graph. Nothing talks to the network until
/// [`App::start`].
pub fn build(settings: Settings) -> App {
    let settings = Arc::new(settings);
    let timers = TimerService::with_thresholds(
        Duration::from_millis(settings.timer_fire_delay_warn_ms),
        Duration::from_millis(settings.timer_callback_warn_ms),
    );
    let timer_thread = timers.spawn();
    let counters = AnomalyCounters::new();
    {
        let counters = Arc::clone(&counters);
        timers.add(
            Duration::from_millis(settings.counter_dump_interval_ms),
            TimerKind::CounterDump,
            true,
            move |_| counters.dump(),
        );
    }

    let books = OrderBookManager::new(&settings.venues, &settings.pairs, settings.max_book_depth);
    let deps = VenueDeps {
        books: Arc::clone(&books),
        timers: Arc::clone(&timers),
        counters: Arc::clone(&counters),
        settings: Arc::clone(&settings),
    };
    let registry = VenueRegistry::new(
        &settings.venues,
        &settings.pairs,
        deps,
        settings.test_mode,
    );

    let (order_update_tx, order_update_rx) = order_update_channel();
    let gateway = VenueGateway::spawn(Arc::clone(&registry), order_update_tx);
    let execution = ExecutionManager::new(
        Arc::clone(&timers),
        Arc::clone(&settings),
        Arc::clone(&counters),
        gateway,
    );
    execution.spawn_order_update_worker(order_update_rx);

    let strategies: Vec<Arc<ArbStrategy>> = settings
        .pairs
        .iter()
        .map(|&pair| {
            let strategy = ArbStrategy::new(
                pair,
                settings.venues.clone(),
                Arc::clone(&books),
                Arc::clone(&execution),
                Arc::clone(&counters),
                Arc::clone(&settings),
            );
            strategy.arm_timers(&timers);
            strategy
        })
        .collect();
    {
        let strategies = strategies.clone();
        books.set_change_callback(move |venue, pair| {
            for strategy in &strategies {
                strategy.on_book_change(venue, pair);
            }
        });
    }

    App {
        settings,
        timers,
        counters,
        books,
        registry,
        execution,
        strategies,
        balances: Arc::new(BalanceBook::new()),
        timer_thread: Some(timer_thread),
    }
}

impl App {
    /// Connect all venues, subscribe the books, and bootstrap snapshots and
    /// balances.
    pub async fn start(&self) -> Result<()> {
        self.registry.connect_all().await?;
        self.registry.subscribe_all()?;
        self.registry.fetch_snapshots(&self.settings.pairs).await;
        self.refresh_balances().await;
        info!(
            venues = self.settings.venues.len(),
            pairs = self.settings.pairs.len(),
            test_mode = self.settings.test_mode,
            "started"
        );
        Ok(())
    }

    /// Pull the tradable assets' balances into the in-memory book.
    pub async fn refresh_balances(&self) {
        let assets: BTreeSet<&str> = self
            .settings
            .pairs
            .iter()
            .flat_map(|p| [p.base(), p.quote()])
            .collect();
        for venue in self.registry.venues() {
            let Some(client) = self.registry.client(venue) else {
                continue;
            };
            for &asset in &assets {
                match client.fetch_balance(asset).await {
                    Ok(amount) => self.balances.set_balance(venue, asset, amount),
                    Err(e) => tracing::warn!(%venue, asset, "balance fetch failed: {e}"),
                }
            }
        }
    }

    pub async fn run_until_ctrl_c(&self) {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    }

    pub async fn shutdown(mut self) {
        self.registry.disconnect_all().await;
        self.timers.shutdown();
        if let Some(handle) = self.timer_thread.take() {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
        self.counters.dump();
        info!("stopped");
    }
}
