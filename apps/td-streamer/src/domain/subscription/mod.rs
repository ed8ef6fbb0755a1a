//! Subscription Registry
//!
//! Tracks which services and symbols the caller currently wants, so that a
//! fresh connection can replay them.
//!
//! # Design
//!
//! The registry keeps at most one [`Subscription`] per service, in the
//! order services were first requested. Mutations return the delta that has
//! to go on the wire:
//!
//! - Adding symbols with the same requested fields yields an `ADD` carrying
//!   only the new symbols.
//! - Changing the requested fields yields a `SUBS` carrying every symbol,
//!   since the server replaces the field set for the whole service.
//! - Removing symbols yields an `UNSUBS` for the ones that were active; a
//!   subscription left without symbols is dropped.
//!
//! The registry is owned by the session task and never shared.

use std::fmt;

use crate::domain::schema::Service;

/// A symbol string (ticker, option symbol, futures root, subscription key).
pub type Symbol = String;

// =============================================================================
// Types
// =============================================================================

/// Subscription command sent to the streamer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionCommand {
    /// Replace the subscription for a service.
    Subs,
    /// Add symbols to an existing subscription.
    Add,
    /// Remove symbols.
    Unsubs,
}

impl SubscriptionCommand {
    /// Wire command name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Subs => "SUBS",
            Self::Add => "ADD",
            Self::Unsubs => "UNSUBS",
        }
    }
}

impl fmt::Display for SubscriptionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Desired subscription for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Service subscribed to.
    pub service: Service,
    /// Symbols, insertion-ordered and unique.
    pub symbols: Vec<Symbol>,
    /// Requested schema indices, ordered and unique.
    pub requested_fields: Vec<usize>,
    /// Command that produced this state or delta.
    pub command: SubscriptionCommand,
}

impl Subscription {
    /// Create a `SUBS` subscription, normalizing symbols.
    #[must_use]
    pub fn new<S: AsRef<str>>(service: Service, symbols: &[S], requested_fields: Vec<usize>) -> Self {
        Self {
            service,
            symbols: normalize_symbols(service, symbols),
            requested_fields,
            command: SubscriptionCommand::Subs,
        }
    }

    const fn with_command(mut self, command: SubscriptionCommand) -> Self {
        self.command = command;
        self
    }
}

/// Trim, upper-case (unless the service has case-sensitive keys) and
/// de-duplicate symbols, preserving first-seen order. Blank entries are
/// dropped.
#[must_use]
pub fn normalize_symbols<S: AsRef<str>>(service: Service, symbols: &[S]) -> Vec<Symbol> {
    let mut normalized: Vec<Symbol> = Vec::with_capacity(symbols.len());
    for symbol in symbols {
        let trimmed = symbol.as_ref().trim();
        if trimmed.is_empty() {
            continue;
        }
        let symbol = if service.has_case_sensitive_keys() {
            trimmed.to_string()
        } else {
            trimmed.to_uppercase()
        };
        if !normalized.contains(&symbol) {
            normalized.push(symbol);
        }
    }
    normalized
}

// =============================================================================
// Registry
// =============================================================================

/// Insertion-ordered set of active subscriptions.
#[derive(Debug, Default, Clone)]
pub struct SubscriptionRegistry {
    entries: Vec<Subscription>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Insert or merge a subscription.
    ///
    /// Returns the delta to transmit. A subscription with no symbols is
    /// ignored and returned unchanged with nothing recorded.
    pub fn upsert(&mut self, subscription: Subscription) -> Subscription {
        if subscription.symbols.is_empty() {
            return subscription;
        }

        let Some(existing) = self
            .entries
            .iter_mut()
            .find(|s| s.service == subscription.service)
        else {
            let recorded = subscription.with_command(SubscriptionCommand::Subs);
            self.entries.push(recorded.clone());
            return recorded;
        };

        let new_symbols: Vec<Symbol> = subscription
            .symbols
            .iter()
            .filter(|s| !existing.symbols.contains(s))
            .cloned()
            .collect();
        existing.symbols.extend(new_symbols.iter().cloned());

        if existing.requested_fields == subscription.requested_fields {
            existing.command = SubscriptionCommand::Add;
            Subscription {
                service: subscription.service,
                symbols: if new_symbols.is_empty() {
                    subscription.symbols
                } else {
                    new_symbols
                },
                requested_fields: subscription.requested_fields,
                command: SubscriptionCommand::Add,
            }
        } else {
            existing.requested_fields = subscription.requested_fields;
            existing.command = SubscriptionCommand::Subs;
            existing.clone()
        }
    }

    /// Remove symbols from a service. Empty `symbols` removes the service.
    ///
    /// Returns the `UNSUBS` delta, or `None` if nothing was active.
    pub fn remove<S: AsRef<str>>(&mut self, service: Service, symbols: &[S]) -> Option<Subscription> {
        let position = self.entries.iter().position(|s| s.service == service)?;
        let symbols = normalize_symbols(service, symbols);

        let removed: Vec<Symbol> = if symbols.is_empty() {
            self.entries[position].symbols.clone()
        } else {
            symbols
                .into_iter()
                .filter(|s| self.entries[position].symbols.contains(s))
                .collect()
        };

        if removed.is_empty() {
            return None;
        }

        let entry = &mut self.entries[position];
        entry.symbols.retain(|s| !removed.contains(s));
        let requested_fields = entry.requested_fields.clone();

        if entry.symbols.is_empty() {
            self.entries.remove(position);
        }

        Some(Subscription {
            service,
            symbols: removed,
            requested_fields,
            command: SubscriptionCommand::Unsubs,
        })
    }

    /// Active subscriptions in first-requested order, as `SUBS` for replay.
    pub fn active_subscriptions(&self) -> impl Iterator<Item = Subscription> + '_ {
        self.entries
            .iter()
            .map(|s| s.clone().with_command(SubscriptionCommand::Subs))
    }

    /// Requested field indices for a service, if subscribed.
    #[must_use]
    pub fn requested_fields(&self, service: Service) -> Option<&[usize]> {
        self.entries
            .iter()
            .find(|s| s.service == service)
            .map(|s| s.requested_fields.as_slice())
    }

    /// Get the subscription for a service.
    #[must_use]
    pub fn get(&self, service: Service) -> Option<&Subscription> {
        self.entries.iter().find(|s| s.service == service)
    }

    /// Number of subscribed services.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is subscribed.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total symbols across all services.
    #[must_use]
    pub fn symbol_count(&self) -> usize {
        self.entries.iter().map(|s| s.symbols.len()).sum()
    }

    /// Drop every subscription.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(symbols: &[&str], fields: Vec<usize>) -> Subscription {
        Subscription::new(Service::Quote, symbols, fields)
    }

    #[test]
    fn normalize_trims_uppercases_and_dedups() {
        let symbols = normalize_symbols(Service::Quote, &[" aapl", "MSFT", "AAPL ", "", "msft"]);
        assert_eq!(symbols, vec!["AAPL", "MSFT"]);
    }

    #[test]
    fn normalize_keeps_case_for_account_activity() {
        let symbols = normalize_symbols(Service::AccountActivity, &[" abcDEF "]);
        assert_eq!(symbols, vec!["abcDEF"]);
    }

    #[test]
    fn first_upsert_is_subs() {
        let mut registry = SubscriptionRegistry::new();
        let delta = registry.upsert(quote(&["AAPL", "MSFT"], vec![1, 2]));

        assert_eq!(delta.command, SubscriptionCommand::Subs);
        assert_eq!(delta.symbols, vec!["AAPL", "MSFT"]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.requested_fields(Service::Quote), Some(&[1, 2][..]));
    }

    #[test]
    fn upsert_same_fields_adds_only_new_symbols() {
        let mut registry = SubscriptionRegistry::new();
        registry.upsert(quote(&["AAPL"], vec![1, 2]));
        let delta = registry.upsert(quote(&["AAPL", "TSLA"], vec![1, 2]));

        assert_eq!(delta.command, SubscriptionCommand::Add);
        assert_eq!(delta.symbols, vec!["TSLA"]);
        assert_eq!(registry.get(Service::Quote).unwrap().symbols, vec!["AAPL", "TSLA"]);
    }

    #[test]
    fn upsert_changed_fields_resubscribes_everything() {
        let mut registry = SubscriptionRegistry::new();
        registry.upsert(quote(&["AAPL"], vec![1, 2]));
        let delta = registry.upsert(quote(&["MSFT"], vec![0, 3]));

        assert_eq!(delta.command, SubscriptionCommand::Subs);
        assert_eq!(delta.symbols, vec!["AAPL", "MSFT"]);
        assert_eq!(delta.requested_fields, vec![0, 3]);
    }

    #[test]
    fn upsert_without_symbols_records_nothing() {
        let mut registry = SubscriptionRegistry::new();
        registry.upsert(quote(&["  "], vec![1]));
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_returns_only_active_symbols() {
        let mut registry = SubscriptionRegistry::new();
        registry.upsert(quote(&["AAPL", "MSFT"], vec![1]));

        let delta = registry.remove(Service::Quote, &["msft", "GOOG"]).unwrap();
        assert_eq!(delta.command, SubscriptionCommand::Unsubs);
        assert_eq!(delta.symbols, vec!["MSFT"]);
        assert_eq!(registry.get(Service::Quote).unwrap().symbols, vec!["AAPL"]);
    }

    #[test]
    fn remove_last_symbol_drops_subscription() {
        let mut registry = SubscriptionRegistry::new();
        registry.upsert(quote(&["AAPL"], vec![1]));

        registry.remove(Service::Quote, &["AAPL"]).unwrap();
        assert!(registry.is_empty());
        assert!(registry.requested_fields(Service::Quote).is_none());
    }

    #[test]
    fn remove_empty_symbols_drops_service() {
        let mut registry = SubscriptionRegistry::new();
        registry.upsert(quote(&["AAPL", "MSFT"], vec![1]));

        let delta = registry.remove::<&str>(Service::Quote, &[]).unwrap();
        assert_eq!(delta.symbols, vec!["AAPL", "MSFT"]);
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_unknown_service_is_none() {
        let mut registry = SubscriptionRegistry::new();
        assert!(registry.remove(Service::NewsHeadline, &["AAPL"]).is_none());
    }

    #[test]
    fn replay_preserves_first_requested_order_and_skips_removed() {
        let mut registry = SubscriptionRegistry::new();
        registry.upsert(Subscription::new(Service::ChartEquity, &["MSFT"], vec![0, 1]));
        registry.upsert(quote(&["AAPL"], vec![1]));
        registry.upsert(Subscription::new(Service::NewsHeadline, &["AAPL"], vec![0]));
        registry.remove(Service::Quote, &["AAPL"]);
        registry.upsert(Subscription::new(Service::ChartEquity, &["IBM"], vec![0, 1]));

        let replay: Vec<_> = registry.active_subscriptions().collect();
        let services: Vec<_> = replay.iter().map(|s| s.service).collect();
        assert_eq!(services, vec![Service::ChartEquity, Service::NewsHeadline]);
        assert!(replay.iter().all(|s| s.command == SubscriptionCommand::Subs));
        assert_eq!(replay[0].symbols, vec!["MSFT", "IBM"]);
    }

    #[test]
    fn clear_empties_registry() {
        let mut registry = SubscriptionRegistry::new();
        registry.upsert(quote(&["AAPL", "MSFT"], vec![1]));
        assert_eq!(registry.symbol_count(), 2);
        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(registry.symbol_count(), 0);
    }
}
