use crate::market::types::{Bar, Quote, SubscriptionId, SubscriptionKey};
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Live bar tagged with the activation it was received under.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveUpdate {
    pub subscription: SubscriptionId,
    pub bar: Bar,
    pub quote: Option<Quote>,
}

/// How a live bar lands in the series. Decided once per update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Replace(usize),
    Append,
}

impl UpdateKind {
    /// `None` means the bar is at or before an already superseded bar.
    pub fn classify(series: &VecDeque<Bar>, timestamp: i64) -> Option<Self> {
        match series.back() {
            None => Some(Self::Append),
            Some(last) if timestamp == last.timestamp => Some(Self::Replace(series.len() - 1)),
            Some(last) if timestamp > last.timestamp => Some(Self::Append),
            Some(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ApplyOutcome {
    Replaced { index: usize },
    Appended { evicted: usize },
    Stale { timestamp: i64, last: i64 },
    /// Held until the series is primed.
    Buffered,
    Superseded {
        update: SubscriptionId,
        active: SubscriptionId,
    },
}

impl ApplyOutcome {
    pub fn changed_series(&self) -> bool {
        matches!(self, Self::Replaced { .. } | Self::Appended { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded {
        len: usize,
        dropped_duplicates: usize,
        applied_pending: bool,
    },
    Superseded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub loads: u64,
    pub replaced: u64,
    pub appended: u64,
    pub evicted: u64,
    pub stale_dropped: u64,
    pub superseded_dropped: u64,
    pub buffered: u64,
    pub duplicates_dropped_on_load: u64,
}

/// Sole writer of the bounded, strictly increasing bar series.
#[derive(Debug)]
pub struct CandleSynchronizer {
    max_bars: usize,
    key: Option<SubscriptionKey>,
    subscription: SubscriptionId,
    series: VecDeque<Bar>,
    primed: bool,
    pending: Option<LiveUpdate>,
    quote: Option<Quote>,
    stats: SyncStats,
}

impl CandleSynchronizer {
    pub fn new(max_bars: usize) -> Self {
        let max_bars = max_bars.max(1);
        Self {
            max_bars,
            key: None,
            subscription: SubscriptionId(0),
            series: VecDeque::with_capacity(max_bars + 1),
            primed: false,
            pending: None,
            quote: None,
            stats: SyncStats::default(),
        }
    }

    pub fn key(&self) -> Option<&SubscriptionKey> {
        self.key.as_ref()
    }

    pub fn subscription(&self) -> SubscriptionId {
        self.subscription
    }

    pub fn is_primed(&self) -> bool {
        self.primed
    }

    pub fn quote(&self) -> Option<Quote> {
        self.quote
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Copy of the series; never a partially applied view.
    pub fn snapshot(&self) -> Vec<Bar> {
        self.series.iter().copied().collect()
    }

    /// Starts a new activation. Series, quote and any pending update of the
    /// previous key are discarded.
    pub fn change_subscription(&mut self, key: SubscriptionKey) -> SubscriptionId {
        self.subscription = self.subscription.next();
        debug!(%key, subscription = %self.subscription, "synchronizer reset for new subscription");
        self.key = Some(key);
        self.series.clear();
        self.primed = false;
        self.pending = None;
        self.quote = None;
        self.subscription
    }

    pub fn load_initial(&mut self, subscription: SubscriptionId, mut bars: Vec<Bar>) -> LoadOutcome {
        if subscription != self.subscription {
            self.stats.superseded_dropped += 1;
            return LoadOutcome::Superseded;
        }

        bars.sort_by_key(|bar| bar.timestamp);
        let received = bars.len();
        bars.dedup_by_key(|bar| bar.timestamp);
        let dropped_duplicates = received - bars.len();
        let skip = bars.len().saturating_sub(self.max_bars);

        self.series.clear();
        self.series.extend(bars.into_iter().skip(skip));
        self.primed = true;
        self.stats.loads += 1;
        self.stats.duplicates_dropped_on_load += dropped_duplicates as u64;

        let applied_pending = match self.pending.take() {
            Some(update) => self.apply_live_update(update).changed_series(),
            None => false,
        };

        debug!(
            subscription = %self.subscription,
            len = self.series.len(),
            dropped_duplicates,
            applied_pending,
            "initial series loaded"
        );
        LoadOutcome::Loaded {
            len: self.series.len(),
            dropped_duplicates,
            applied_pending,
        }
    }

    pub fn apply_live_update(&mut self, update: LiveUpdate) -> ApplyOutcome {
        if update.subscription != self.subscription {
            self.stats.superseded_dropped += 1;
            return ApplyOutcome::Superseded {
                update: update.subscription,
                active: self.subscription,
            };
        }

        if !self.primed {
            self.pending = Some(update);
            self.stats.buffered += 1;
            return ApplyOutcome::Buffered;
        }

        let Some(kind) = UpdateKind::classify(&self.series, update.bar.timestamp) else {
            let last = self.series.back().map_or(i64::MIN, |bar| bar.timestamp);
            self.stats.stale_dropped += 1;
            trace!(timestamp = update.bar.timestamp, last, "stale bar dropped");
            return ApplyOutcome::Stale {
                timestamp: update.bar.timestamp,
                last,
            };
        };

        if let Some(quote) = update.quote {
            self.quote = Some(quote);
        }

        match kind {
            UpdateKind::Replace(index) => {
                self.series[index] = update.bar;
                self.stats.replaced += 1;
                ApplyOutcome::Replaced { index }
            }
            UpdateKind::Append => {
                self.series.push_back(update.bar);
                let mut evicted = 0;
                while self.series.len() > self.max_bars {
                    self.series.pop_front();
                    evicted += 1;
                }
                self.stats.appended += 1;
                self.stats.evicted += evicted as u64;
                ApplyOutcome::Appended { evicted }
            }
        }
    }

    /// Last write wins by arrival order.
    pub fn set_quote(&mut self, quote: Quote) {
        self.quote = Some(quote);
    }
}
