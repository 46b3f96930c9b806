//! Venue registry: creates and owns every venue client, fans out lifecycle
//! operations.

use crate::domain::pair::TradingPair;
use crate::domain::venue::VenueId;
use crate::error::VenueError;
use crate::infrastructure::venue::{create_venue_client, VenueClient, VenueDeps};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

pub struct VenueRegistry {
    clients: HashMap<VenueId, Arc<dyn VenueClient>>,
}

impl VenueRegistry {
    pub fn new(
        venues: &[VenueId],
        pairs: &[TradingPair],
        deps: VenueDeps,
        test_mode: bool,
    ) -> Arc<Self> {
        let mut clients = HashMap::new();
        for &venue in venues {
            info!(%venue, "creating venue client");
            clients.insert(
                venue,
                create_venue_client(venue, deps.clone(), pairs.to_vec(), test_mode),
            );
        }
        Arc::new(Self { clients })
    }

    pub fn client(&self, venue: VenueId) -> Option<Arc<dyn VenueClient>> {
        self.clients.get(&venue).cloned()
    }

    pub fn venues(&self) -> Vec<VenueId> {
        let mut venues: Vec<VenueId> = self.clients.keys().copied().collect();
        venues.sort();
        venues
    }

    /// Connect every venue; the first failure is returned after attempting
    /// the rest.
    pub async fn connect_all(&self) -> Result<(), VenueError> {
        let mut first_error = None;
        for (venue, client) in &self.clients {
            info!(%venue, "connecting");
            if let Err(e) = client.connect().await {
                error!(%venue, "connect failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Send subscribe frames on every connected venue.
    pub fn subscribe_all(&self) -> Result<(), VenueError> {
        let mut first_error = None;
        for (venue, client) in &self.clients {
            info!(%venue, "subscribing order books");
            if let Err(e) = client.subscribe_order_book() {
                error!(%venue, "subscribe failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// REST snapshot bootstrap for the venues that need one.
    pub async fn fetch_snapshots(&self, pairs: &[TradingPair]) {
        for (venue, client) in &self.clients {
            for &pair in pairs {
                if let Err(e) = client.fetch_order_book_snapshot(pair).await {
                    error!(%venue, %pair, "snapshot bootstrap failed: {e}");
                }
            }
        }
    }

    pub async fn disconnect_all(&self) {
        for (venue, client) in &self.clients {
            info!(%venue, "disconnecting");
            client.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::books::OrderBookManager;
    use crate::infrastructure::config::Settings;
    use crate::infrastructure::counters::AnomalyCounters;
    use crate::infrastructure::timers::TimerService;

    fn deps() -> VenueDeps {
        VenueDeps {
            books: OrderBookManager::new(&VenueId::ALL, &[TradingPair::BtcUsdt], 100),
            timers: TimerService::new(),
            counters: AnomalyCounters::new(),
            settings: Arc::new(Settings::default()),
        }
    }

    #[test]
    fn registry_builds_all_requested_clients() {
        let registry = VenueRegistry::new(
            &[VenueId::Binance, VenueId::Okx],
            &[TradingPair::BtcUsdt],
            deps(),
            true,
        );
        assert!(registry.client(VenueId::Binance).is_some());
        assert!(registry.client(VenueId::Okx).is_some());
        assert!(registry.client(VenueId::Kraken).is_none());
        assert_eq!(registry.venues(), vec![VenueId::Binance, VenueId::Okx]);
    }

    #[test]
    fn clients_report_their_venue() {
        let registry = VenueRegistry::new(&VenueId::ALL, &[TradingPair::BtcUsdt], deps(), true);
        for venue in VenueId::ALL {
            assert_eq!(registry.client(venue).unwrap().venue(), venue);
        }
    }
}
