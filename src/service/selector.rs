use crate::db::{DbCredential, DbHandle};
use ahash::AHashSet;
use tracing::warn;

/// Outcome of one selection attempt within a dispatch sequence.
#[derive(Debug)]
pub enum Selection {
    /// A credential not yet tried by this request.
    Fresh(DbCredential),
    /// The store handed back an id this request already burned; the caller
    /// should spend a retry and ask again.
    Duplicate,
    /// No credential exists for the model (or the store is unavailable).
    Exhausted,
}

/// Ask the store for one credential, discarding ids already used by this
/// request. The used set lives and dies with a single inbound request; the
/// store's random ordering provides cross-request diversity on its own.
pub async fn next_credential(db: &DbHandle, model: &str, used: &AHashSet<i64>) -> Selection {
    match db.pick_credential(model).await {
        Ok(Some(credential)) => {
            if used.contains(&credential.id) {
                Selection::Duplicate
            } else {
                Selection::Fresh(credential)
            }
        }
        Ok(None) => Selection::Exhausted,
        Err(e) => {
            // Store trouble is never fatal to the request; treat as a miss.
            warn!(model, error = %e, "credential pick failed");
            Selection::Exhausted
        }
    }
}
