//! Routing table maintenance logic.

use std::time::{Duration, Instant};

use crate::common::{Contact, Id, RouteTable};

pub const PING_TABLE_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const REFRESH_TABLE_INTERVAL: Duration = Duration::from_secs(15 * 60);
pub const PRUNE_TABLE_INTERVAL: Duration = Duration::from_secs(30 * 60);
pub const EXPIRE_VALUES_INTERVAL: Duration = Duration::from_secs(60);
/// Wait this long before bootstrapping an empty table again.
pub const POPULATE_RETRY_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
/// Maintenance schedule
pub struct MaintenanceConfig {
    /// How often to ping stale contacts.
    ///
    /// Defaults to [PING_TABLE_INTERVAL]
    pub ping_interval: Duration,
    /// Contacts not heard from for this long get pinged.
    ///
    /// Defaults to [REFRESH_TABLE_INTERVAL]
    pub contact_stale_after: Duration,
    /// How often to refresh stale buckets.
    ///
    /// Defaults to [REFRESH_TABLE_INTERVAL]
    pub refresh_interval: Duration,
    /// Buckets not looked up for this long get refreshed.
    ///
    /// Defaults to [REFRESH_TABLE_INTERVAL]
    pub bucket_stale_after: Duration,
    /// How often to rebuild the table dropping dead contacts.
    ///
    /// Defaults to [PRUNE_TABLE_INTERVAL]
    pub prune_interval: Duration,
    /// How often to drop expired stored values.
    ///
    /// Defaults to [EXPIRE_VALUES_INTERVAL]
    pub expire_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        MaintenanceConfig {
            ping_interval: PING_TABLE_INTERVAL,
            contact_stale_after: REFRESH_TABLE_INTERVAL,
            refresh_interval: REFRESH_TABLE_INTERVAL,
            bucket_stale_after: REFRESH_TABLE_INTERVAL,
            prune_interval: PRUNE_TABLE_INTERVAL,
            expire_interval: EXPIRE_VALUES_INTERVAL,
        }
    }
}

/// Routing table maintenance state
#[derive(Debug)]
pub struct RoutingMaintenance {
    config: MaintenanceConfig,
    last_table_ping: Instant,
    last_table_refresh: Instant,
    last_table_prune: Instant,
    last_values_expiry: Instant,
    last_table_populate: Option<Instant>,
}

/// Decisions about routing table maintenance
#[derive(Debug, Default)]
pub struct MaintenanceDecisions {
    /// The table is empty, bootstrap again.
    pub should_populate: bool,

    /// Contacts to ping.
    pub contacts_to_ping: Vec<Contact>,

    /// Targets of refresh lookups, one inside each stale bucket.
    pub refresh_targets: Vec<Id>,

    /// Whether to rebuild the table.
    pub should_prune: bool,

    /// Whether to drop expired values.
    pub should_expire_values: bool,
}

impl RoutingMaintenance {
    /// Create new routing maintenance tracker
    pub fn new(config: MaintenanceConfig) -> Self {
        let now = Instant::now();

        RoutingMaintenance {
            config,
            last_table_ping: now,
            last_table_refresh: now,
            last_table_prune: now,
            last_values_expiry: now,
            last_table_populate: None,
        }
    }

    /// Determine what maintenance operations should be performed.
    ///
    /// Computes decisions and resets internal timers when intervals elapse.
    pub fn periodic_maintenance_decisions(
        &mut self,
        routing_table: &RouteTable,
    ) -> MaintenanceDecisions {
        self.periodic_maintenance_decisions_at(Instant::now(), routing_table)
    }

    fn periodic_maintenance_decisions_at(
        &mut self,
        now: Instant,
        routing_table: &RouteTable,
    ) -> MaintenanceDecisions {
        let mut decisions = MaintenanceDecisions::default();

        if now.saturating_duration_since(self.last_values_expiry) >= self.config.expire_interval
        {
            self.last_values_expiry = now;
            decisions.should_expire_values = true;
        }

        if routing_table.is_empty() {
            let retry_due = self.last_table_populate.map_or(true, |last| {
                now.saturating_duration_since(last) >= POPULATE_RETRY_INTERVAL
            });

            if retry_due {
                self.last_table_populate = Some(now);
                decisions.should_populate = true;
            }

            // Nothing else to maintain, and timers keep running until there is.
            return decisions;
        }

        if now.saturating_duration_since(self.last_table_ping) >= self.config.ping_interval {
            self.last_table_ping = now;
            decisions.contacts_to_ping =
                routing_table.stale_contacts(now, self.config.contact_stale_after);
        }

        if now.saturating_duration_since(self.last_table_refresh) >= self.config.refresh_interval
        {
            self.last_table_refresh = now;
            decisions.refresh_targets =
                routing_table.stale_buckets(now, self.config.bucket_stale_after);
        }

        if now.saturating_duration_since(self.last_table_prune) >= self.config.prune_interval {
            self.last_table_prune = now;
            decisions.should_prune = true;
        }

        decisions
    }
}

impl Default for RoutingMaintenance {
    fn default() -> Self {
        Self::new(MaintenanceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::{Duration, Instant};

    use crate::common::{Contact, Id, RouteTable, RouteTableConfig};

    use super::*;

    fn table(contacts: u8) -> RouteTable {
        let localhost = Contact::localhost(Id::random(), "127.0.0.1:6881".parse().unwrap());
        let mut table = RouteTable::new(localhost, RouteTableConfig::default());

        for i in 0..contacts {
            let address = SocketAddr::from(([10, 2, i, 1], 6881));
            table.add(Contact::unsolicited(Id::random(), address));
        }

        table
    }

    #[test]
    fn empty_table_does_not_reset_refresh_timer() {
        let mut maintenance = RoutingMaintenance::default();
        let routing_table = table(0);
        let before = maintenance.last_table_refresh;

        let future = Instant::now() + REFRESH_TABLE_INTERVAL + Duration::from_secs(1);
        let decisions = maintenance.periodic_maintenance_decisions_at(future, &routing_table);

        assert!(decisions.should_populate);
        assert!(decisions.should_expire_values);
        assert_eq!(maintenance.last_table_refresh, before);
    }

    #[test]
    fn populate_is_retried_after_an_interval() {
        let mut maintenance = RoutingMaintenance::default();
        let routing_table = table(0);
        let now = Instant::now();

        assert!(maintenance.periodic_maintenance_decisions_at(now, &routing_table).should_populate);
        assert!(!maintenance.periodic_maintenance_decisions_at(now, &routing_table).should_populate);

        let later = now + POPULATE_RETRY_INTERVAL;
        assert!(maintenance.periodic_maintenance_decisions_at(later, &routing_table).should_populate);
    }

    #[test]
    fn refresh_due_updates_refresh_timer() {
        let mut maintenance = RoutingMaintenance::default();
        let routing_table = table(10);
        let before = maintenance.last_table_refresh;

        // Advance time forward past the refresh interval.
        // We add to Instant::now() instead of subtracting, because on Windows
        // Instant can be close to its internal epoch and subtraction overflows.
        let future = Instant::now() + REFRESH_TABLE_INTERVAL + Duration::from_secs(1);

        let decisions = maintenance.periodic_maintenance_decisions_at(future, &routing_table);

        assert!(!decisions.should_populate);
        assert!(!decisions.refresh_targets.is_empty());
        assert_eq!(decisions.contacts_to_ping.len(), 10);
        assert!(decisions.should_expire_values);
        assert!(!decisions.should_prune);
        assert!(maintenance.last_table_refresh > before);
        assert_eq!(maintenance.last_table_refresh, future);

        // Nothing is due again right away.
        let decisions = maintenance.periodic_maintenance_decisions_at(future, &routing_table);
        assert!(decisions.refresh_targets.is_empty());
        assert!(decisions.contacts_to_ping.is_empty());
        assert!(!decisions.should_expire_values);
    }

    #[test]
    fn fresh_contacts_are_not_pinged() {
        let mut maintenance = RoutingMaintenance::default();
        let routing_table = table(5);

        let future = Instant::now() + PING_TABLE_INTERVAL;
        let decisions = maintenance.periodic_maintenance_decisions_at(future, &routing_table);

        assert!(decisions.contacts_to_ping.is_empty());
        assert!(decisions.refresh_targets.is_empty());
    }
}
