use crate::store::{DispatchStore, StoreError};
use crate::types::SendJob;

/// Gate checked immediately before delivery, not only at enqueue time:
/// suppression can be added after a job was queued and must still win. A
/// recipient is blocked when suppressed, unsubscribed, or when the contact
/// has ever replied within the job's campaign.
pub fn is_blocked(store: &dyn DispatchStore, job: &SendJob) -> Result<bool, StoreError> {
    if store.is_suppressed(&job.recipient_email)? {
        return Ok(true);
    }
    if store.is_unsubscribed(&job.recipient_email)? {
        return Ok(true);
    }
    store.has_reply_event(job.campaign_id, job.contact_id)
}
