//! Participant side of the registry: join after the supervisor, leave on exit.

use crate::error::CoreError;

use dronegrid_env::{discover, GridContext, Pid, Registry, Role};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A participant's registration, withdrawn on clean exit.
pub struct Membership {
    registry: Arc<dyn Registry>,
    role: Role,
    identity: Pid,
    supervisor: Pid,
}

impl Membership {
    /// Waits for the supervisor to appear, then publishes `role`.
    pub async fn join<Ctx: GridContext + ?Sized>(
        registry: Arc<dyn Registry>,
        role: Role,
        identity: Pid,
        backoff: Duration,
        ctx: &Ctx,
    ) -> Result<Self, CoreError> {
        let supervisor = discover(registry.as_ref(), Role::Supervisor, backoff, ctx).await;
        registry.publish(role, identity)?;
        info!(%role, pid = %identity, supervisor = %supervisor, "Joined");
        Ok(Self {
            registry,
            role,
            identity,
            supervisor,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn supervisor(&self) -> Pid {
        self.supervisor
    }

    /// Removes this participant's registry line.
    pub fn leave(self) -> Result<bool, CoreError> {
        let removed = self.registry.withdraw(self.role, self.identity)?;
        if removed {
            info!(role = %self.role, pid = %self.identity, "Withdrew from registry");
        } else {
            warn!(role = %self.role, pid = %self.identity, "Registry line already gone");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dronegrid_env::{MemoryRegistry, TokioContext};

    #[tokio::test(start_paused = true)]
    async fn test_join_waits_for_supervisor_then_leaves() {
        let registry = Arc::new(MemoryRegistry::new());
        let ctx = TokioContext::new(9);

        let publisher = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                registry.publish(Role::Supervisor, Pid(2)).unwrap();
            })
        };

        let membership = Membership::join(
            registry.clone(),
            Role::Physics,
            Pid(30),
            Duration::from_millis(200),
            &ctx,
        )
        .await
        .unwrap();
        publisher.await.unwrap();

        assert_eq!(membership.supervisor(), Pid(2));
        assert_eq!(registry.lookup(Role::Physics).unwrap(), Some(Pid(30)));
        assert!(membership.leave().unwrap());
        assert_eq!(registry.lookup(Role::Physics).unwrap(), None);
    }
}
