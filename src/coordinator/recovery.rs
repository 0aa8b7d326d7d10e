//! Recovery polling for deactivated instances

use std::sync::Arc;

use tokio::time::Instant;

use super::{CoordinatorInner, CoordinatorNotice, CoordinatorState};
use crate::model::InstanceId;

impl CoordinatorInner {
    /// Start polling `id` for health, replacing any poll already running
    pub(super) fn schedule_recovery(self: &Arc<Self>, state: &mut CoordinatorState, id: InstanceId) {
        state.abort_recovery(&id);
        let handle = tokio::spawn(self.clone().recover(id.clone()));
        state.recoveries.insert(id, handle);
    }

    async fn recover(self: Arc<Self>, id: InstanceId) {
        let mut delay = self.config.recovery_delay();

        loop {
            tokio::time::sleep(delay).await;

            let mut state = self.state.lock().await;
            let Some(instance) = state.instances.get_mut(&id) else {
                tracing::debug!(%id, "Instance gone, stopping recovery");
                state.recoveries.remove(&id);
                return;
            };
            if instance.is_active {
                state.recoveries.remove(&id);
                return;
            }

            if instance.snapshot.is_healthy() {
                instance.is_active = true;
                instance.recovery_attempts = 0;
                instance.last_activity = Instant::now();
                tracing::info!(%id, "Store recovered, reactivating");
                state.recoveries.remove(&id);
                self.notify(CoordinatorNotice::InstanceRecovered { id: id.clone() });
                self.elect(&mut state);
                return;
            }

            instance.recovery_attempts += 1;
            let attempts = instance.recovery_attempts;
            let exhausted = self
                .config
                .max_recovery_attempts
                .is_some_and(|max| attempts >= max);
            if exhausted {
                instance.recovery_exhausted = true;
                tracing::warn!(%id, attempts, "Giving up on store recovery");
                state.recoveries.remove(&id);
                self.notify(CoordinatorNotice::RecoveryExhausted { id, attempts });
                return;
            }

            delay = self.config.recovery_backoff(attempts);
            tracing::debug!(%id, attempts, retry_in_ms = delay.as_millis() as u64, "Store still unhealthy");
        }
    }
}
