use chrono::{DateTime, Utc};

use crate::store::{DispatchStore, StoreError};
use crate::types::Inbox;
use crate::utils::{day_start, month_start};

/// Remaining capacity for one inbox at a point in time.
#[derive(Debug, Clone, Copy)]
pub struct InboxHeadroom {
    pub remaining: i64,
    pub pace_seconds: u32,
    pub eligible: bool,
}

/// Derives remaining headroom from the event log on every call. Counting is
/// never cached; the log is the single source of truth, so a crashed worker
/// cannot leave a counter out of step with actual sends.
pub struct CapacityLedger<'a> {
    store: &'a dyn DispatchStore,
    global_daily_cap: i64,
}

impl<'a> CapacityLedger<'a> {
    pub fn new(store: &'a dyn DispatchStore, global_daily_cap: i64) -> Self {
        Self {
            store,
            global_daily_cap,
        }
    }

    /// Daily headroom for one inbox, floored by the monthly cap when present.
    /// Disabled inboxes have no headroom and are never eligible.
    pub fn headroom(
        &self,
        inbox: &Inbox,
        now: DateTime<Utc>,
    ) -> Result<InboxHeadroom, StoreError> {
        if inbox.disabled {
            return Ok(InboxHeadroom {
                remaining: 0,
                pace_seconds: inbox.pace_seconds,
                eligible: false,
            });
        }
        let sent_today = self
            .store
            .sent_count_since(Some(inbox.id), day_start(now))?;
        let mut remaining = inbox.daily_cap - sent_today;
        if let Some(monthly_cap) = inbox.monthly_cap {
            let sent_this_month = self
                .store
                .sent_count_since(Some(inbox.id), month_start(now))?;
            remaining = remaining.min(monthly_cap - sent_this_month);
        }
        let remaining = remaining.max(0);
        Ok(InboxHeadroom {
            remaining,
            pace_seconds: inbox.pace_seconds,
            eligible: remaining > 0,
        })
    }

    /// Remaining sends for the whole pool today, floored at zero.
    pub fn global_headroom(&self, now: DateTime<Utc>) -> Result<i64, StoreError> {
        let sent_today = self.store.sent_count_since(None, day_start(now))?;
        Ok((self.global_daily_cap - sent_today).max(0))
    }
}
