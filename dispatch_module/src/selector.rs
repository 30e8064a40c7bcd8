use chrono::{DateTime, Utc};
use std::cmp::Ordering;

use crate::ledger::{CapacityLedger, InboxHeadroom};
use crate::store::StoreError;
use crate::types::Inbox;

/// Pick the sending identity for the next job: filter disabled inboxes, rank
/// by health_score descending with id ascending as the deterministic
/// tie-break, and return the first with positive headroom. `None` means every
/// inbox is out of capacity and the caller should defer the job.
pub fn select_inbox(
    ledger: &CapacityLedger<'_>,
    candidates: &[Inbox],
    now: DateTime<Utc>,
) -> Result<Option<(Inbox, InboxHeadroom)>, StoreError> {
    let mut ranked: Vec<&Inbox> = candidates.iter().filter(|inbox| !inbox.disabled).collect();
    ranked.sort_by(|a, b| {
        b.health_score
            .partial_cmp(&a.health_score)
            .unwrap_or(Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });
    for inbox in ranked {
        let headroom = ledger.headroom(inbox, now)?;
        if headroom.eligible {
            return Ok(Some(((*inbox).clone(), headroom)));
        }
    }
    Ok(None)
}
