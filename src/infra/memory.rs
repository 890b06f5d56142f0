//! In-process registry and actor inventories used by the CLI and tests.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use serde::Serialize;

use crate::{
    application::collaborators::{
        DeliveryError, InventoryError, MapDelivery, MapRegistry, PlaceholderInventory,
        RegistryError,
    },
    domain::{
        entities::ImageMap,
        types::{ActorId, MapId, OwnerId, TileId},
    },
};

#[derive(Default)]
pub struct InMemoryMapRegistry {
    maps: DashMap<MapId, ImageMap>,
    next_tile: AtomicU32,
}

impl InMemoryMapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: MapId) -> Option<ImageMap> {
        self.maps.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

#[async_trait]
impl MapRegistry for InMemoryMapRegistry {
    async fn count_by_owner(&self, owner: OwnerId) -> Result<u64, RegistryError> {
        Ok(self
            .maps
            .iter()
            .filter(|entry| entry.owner == owner)
            .count() as u64)
    }

    async fn list_by_owner(&self, owner: OwnerId) -> Result<Vec<ImageMap>, RegistryError> {
        let mut maps: Vec<ImageMap> = self
            .maps
            .iter()
            .filter(|entry| entry.owner == owner)
            .map(|entry| entry.value().clone())
            .collect();
        maps.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(maps)
    }

    async fn add(&self, map: ImageMap) -> Result<(), RegistryError> {
        match self.maps.entry(map.id) {
            Entry::Occupied(_) => Err(RegistryError::Duplicate {
                id: map.id.to_string(),
            }),
            Entry::Vacant(vacant) => {
                vacant.insert(map);
                Ok(())
            }
        }
    }

    async fn allocate_tiles(&self, count: u64) -> Result<Vec<TileId>, RegistryError> {
        let count = u32::try_from(count).map_err(|_| RegistryError::TilesExhausted)?;
        let first = self
            .next_tile
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |next| {
                next.checked_add(count)
            })
            .map_err(|_| RegistryError::TilesExhausted)?;
        Ok((first..first + count).map(TileId).collect())
    }
}

/// Items handed to an actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveredItem {
    CombinedMap { map: MapId },
    MapTile { map: MapId, tile: TileId },
}

#[derive(Debug, Default)]
struct Holdings {
    units: u64,
    items: Vec<DeliveredItem>,
}

/// Placeholder units and delivered items per actor.
#[derive(Default)]
pub struct InMemoryInventory {
    holdings: DashMap<ActorId, Holdings>,
    item_capacity: Option<usize>,
}

impl InMemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse deliveries that would leave an actor holding more than `capacity` items.
    pub fn with_item_capacity(capacity: usize) -> Self {
        Self {
            holdings: DashMap::new(),
            item_capacity: Some(capacity),
        }
    }

    pub fn grant_units(&self, actor: ActorId, count: u64) {
        let mut holdings = self.holdings.entry(actor).or_default();
        holdings.units = holdings.units.saturating_add(count);
    }

    pub fn units(&self, actor: ActorId) -> u64 {
        self.holdings.get(&actor).map_or(0, |holdings| holdings.units)
    }

    pub fn items(&self, actor: ActorId) -> Vec<DeliveredItem> {
        self.holdings
            .get(&actor)
            .map(|holdings| holdings.items.clone())
            .unwrap_or_default()
    }

    fn deliver(&self, actor: ActorId, items: Vec<DeliveredItem>) -> Result<(), DeliveryError> {
        let mut holdings = self.holdings.entry(actor).or_default();
        if let Some(capacity) = self.item_capacity {
            if holdings.items.len() + items.len() > capacity {
                return Err(DeliveryError::Rejected {
                    actor,
                    reason: format!("inventory holds at most {capacity} items"),
                });
            }
        }
        holdings.items.extend(items);
        Ok(())
    }
}

#[async_trait]
impl PlaceholderInventory for InMemoryInventory {
    async fn withdraw(&self, actor: ActorId, count: u64) -> Result<u64, InventoryError> {
        let mut holdings = self.holdings.entry(actor).or_default();
        if holdings.units < count {
            return Err(InventoryError::InsufficientUnits {
                required: count,
                available: holdings.units,
            });
        }
        holdings.units -= count;
        Ok(count)
    }

    async fn restore(&self, actor: ActorId, count: u64) -> Result<(), InventoryError> {
        self.grant_units(actor, count);
        Ok(())
    }
}

#[async_trait]
impl MapDelivery for InMemoryInventory {
    async fn deliver_combined(&self, map: &ImageMap, actor: ActorId) -> Result<(), DeliveryError> {
        self.deliver(actor, vec![DeliveredItem::CombinedMap { map: map.id }])
    }

    async fn deliver_individual(
        &self,
        map: &ImageMap,
        actor: ActorId,
    ) -> Result<(), DeliveryError> {
        let items = map
            .tiles
            .iter()
            .map(|tile| DeliveredItem::MapTile {
                map: map.id,
                tile: *tile,
            })
            .collect();
        self.deliver(actor, items)
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::domain::types::{Dimensions, DitheringType, MapKind};

    fn map(owner: OwnerId, tiles: Vec<TileId>) -> ImageMap {
        ImageMap::new(
            "m".to_string(),
            owner,
            Dimensions::new(tiles.len() as u32, 1),
            tiles,
            MapKind::Static,
            "http://x/m.png".to_string(),
            DitheringType::NearestColor,
        )
        .expect("map")
    }

    #[tokio::test]
    async fn tile_allocation_is_contiguous_and_unique() {
        let registry = InMemoryMapRegistry::new();
        let first = registry.allocate_tiles(3).await.unwrap();
        let second = registry.allocate_tiles(2).await.unwrap();
        assert_eq!(first, vec![TileId(0), TileId(1), TileId(2)]);
        assert_eq!(second, vec![TileId(3), TileId(4)]);
    }

    #[tokio::test]
    async fn registry_counts_and_rejects_duplicates() {
        let registry = InMemoryMapRegistry::new();
        let owner = OwnerId::new(Uuid::new_v4());
        let tiles = registry.allocate_tiles(1).await.unwrap();
        let map = map(owner, tiles);

        registry.add(map.clone()).await.unwrap();
        assert_eq!(registry.count_by_owner(owner).await.unwrap(), 1);
        assert!(matches!(
            registry.add(map).await,
            Err(RegistryError::Duplicate { .. })
        ));
    }

    #[tokio::test]
    async fn withdraw_is_all_or_nothing() {
        let inventory = InMemoryInventory::new();
        let actor = ActorId::new(Uuid::new_v4());
        inventory.grant_units(actor, 3);

        assert!(matches!(
            inventory.withdraw(actor, 4).await,
            Err(InventoryError::InsufficientUnits {
                required: 4,
                available: 3
            })
        ));
        assert_eq!(inventory.units(actor), 3);
        assert_eq!(inventory.withdraw(actor, 3).await.unwrap(), 3);
        assert_eq!(inventory.units(actor), 0);
    }

    #[tokio::test]
    async fn individual_delivery_hands_out_every_tile() {
        let inventory = InMemoryInventory::with_item_capacity(2);
        let actor = ActorId::new(Uuid::new_v4());
        let wide = map(actor.as_owner(), vec![TileId(7), TileId(8), TileId(9)]);

        assert!(matches!(
            inventory.deliver_individual(&wide, actor).await,
            Err(DeliveryError::Rejected { .. })
        ));
        inventory.deliver_combined(&wide, actor).await.unwrap();
        assert_eq!(
            inventory.items(actor),
            vec![DeliveredItem::CombinedMap { map: wide.id }]
        );
    }
}
