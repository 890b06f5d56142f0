//! Placeholder units withdrawn from an actor before background work starts.

use std::sync::Arc;

use metrics::counter;
use tracing::{error, info};

use crate::{
    application::{collaborators::PlaceholderInventory, error::ValidationError},
    domain::{entities::CreationRequest, types::ActorId},
};

/// Units taken from an actor. Either consumed on success or refunded on failure, once.
#[derive(Debug)]
#[must_use = "a reservation must be consumed or refunded"]
pub struct Reservation {
    actor: ActorId,
    units: u64,
}

impl Reservation {
    pub fn units(&self) -> u64 {
        self.units
    }

    /// The units were spent on a delivered map.
    pub fn consume(self) {}
}

#[derive(Clone)]
pub struct UnitReserver {
    inventory: Arc<dyn PlaceholderInventory>,
    require_units: bool,
}

impl UnitReserver {
    pub fn new(inventory: Arc<dyn PlaceholderInventory>, require_units: bool) -> Self {
        Self {
            inventory,
            require_units,
        }
    }

    /// Withdraw `width * height` units when units are required and an actor is present.
    pub async fn reserve(
        &self,
        request: &CreationRequest,
    ) -> Result<Option<Reservation>, ValidationError> {
        if !self.require_units {
            return Ok(None);
        }
        let Some(actor) = request.actor else {
            return Ok(None);
        };

        let units = self
            .inventory
            .withdraw(actor, request.required_units())
            .await?;

        Ok(Some(Reservation { actor, units }))
    }

    /// Give the units back. Failures are logged and never replace the caller's error.
    pub async fn refund(&self, reservation: Reservation) {
        let Reservation { actor, units } = reservation;
        if units == 0 {
            return;
        }

        match self.inventory.restore(actor, units).await {
            Ok(()) => {
                counter!("mapforge_units_refunded_total").increment(units);
                info!(
                    target = "application::reservation",
                    actor = %actor,
                    units,
                    "refunded placeholder units"
                );
            }
            Err(err) => {
                error!(
                    target = "application::reservation",
                    actor = %actor,
                    units,
                    error = %err,
                    "failed to refund placeholder units"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use uuid::Uuid;

    use crate::application::collaborators::InventoryError;

    struct CountingInventory {
        held: Mutex<u64>,
        restores: Mutex<Vec<u64>>,
    }

    impl CountingInventory {
        fn holding(units: u64) -> Self {
            Self {
                held: Mutex::new(units),
                restores: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PlaceholderInventory for CountingInventory {
        async fn withdraw(&self, _actor: ActorId, count: u64) -> Result<u64, InventoryError> {
            let mut held = self.held.lock().unwrap();
            if *held < count {
                return Err(InventoryError::InsufficientUnits {
                    required: count,
                    available: *held,
                });
            }
            *held -= count;
            Ok(count)
        }

        async fn restore(&self, _actor: ActorId, count: u64) -> Result<(), InventoryError> {
            *self.held.lock().unwrap() += count;
            self.restores.lock().unwrap().push(count);
            Ok(())
        }
    }

    fn request(actor: Option<ActorId>) -> CreationRequest {
        let owner = crate::domain::types::OwnerId::new(Uuid::new_v4());
        let request = CreationRequest::new("http://x/img.png", 3, 2, "a", owner);
        match actor {
            Some(actor) => request.with_actor(actor),
            None => request,
        }
    }

    #[tokio::test]
    async fn withdraws_area_and_refunds_exactly() {
        let inventory = Arc::new(CountingInventory::holding(10));
        let reserver = UnitReserver::new(inventory.clone(), true);
        let actor = ActorId::new(Uuid::new_v4());

        let reservation = reserver
            .reserve(&request(Some(actor)))
            .await
            .unwrap()
            .expect("reservation taken");
        assert_eq!(reservation.units(), 6);
        assert_eq!(*inventory.held.lock().unwrap(), 4);

        reserver.refund(reservation).await;
        assert_eq!(*inventory.held.lock().unwrap(), 10);
        assert_eq!(inventory.restores.lock().unwrap().as_slice(), &[6]);
    }

    #[tokio::test]
    async fn insufficient_units_takes_nothing() {
        let inventory = Arc::new(CountingInventory::holding(5));
        let reserver = UnitReserver::new(inventory.clone(), true);

        let err = reserver
            .reserve(&request(Some(ActorId::new(Uuid::new_v4()))))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InsufficientUnits {
                required: 6,
                available: 5
            }
        ));
        assert_eq!(*inventory.held.lock().unwrap(), 5);
    }

    #[tokio::test]
    async fn nothing_reserved_without_actor_or_requirement() {
        let inventory = Arc::new(CountingInventory::holding(0));

        let reserver = UnitReserver::new(inventory.clone(), true);
        assert!(reserver.reserve(&request(None)).await.unwrap().is_none());

        let reserver = UnitReserver::new(inventory, false);
        let actor = ActorId::new(Uuid::new_v4());
        assert!(reserver.reserve(&request(Some(actor))).await.unwrap().is_none());
    }
}
