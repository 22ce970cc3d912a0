use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::clock::Clock;
use crate::entities::{location, ZoneType};
use crate::errors::ServiceError;
use crate::store::{LedgerStore, UnitOfWork};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct RegisterLocationCommand {
    pub warehouse_id: Uuid,
    pub zone_id: Uuid,
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    pub zone_type: ZoneType,
}

/// Bins that stock rows live in.
pub struct LocationService {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl LocationService {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    #[instrument(skip(self), fields(code = %command.code))]
    pub async fn register_location(
        &self,
        command: RegisterLocationCommand,
    ) -> Result<location::Model, ServiceError> {
        command.validate()?;
        let mut uow = self.store.begin().await?;
        let saved = uow
            .insert_location(location::Model {
                id: Uuid::new_v4(),
                warehouse_id: command.warehouse_id,
                zone_id: command.zone_id,
                code: command.code.trim().to_string(),
                zone_type: command.zone_type,
                is_active: true,
                created_at: self.clock.now(),
            })
            .await?;
        uow.commit().await?;

        info!(location_id = %saved.id, zone_type = %saved.zone_type, "Location registered");
        Ok(saved)
    }

    pub async fn get_location(&self, id: Uuid) -> Result<location::Model, ServiceError> {
        let mut uow = self.store.begin().await?;
        let found = Self::load_in(uow.as_mut(), id).await?;
        uow.commit().await?;
        Ok(found)
    }

    pub async fn default_location(
        &self,
        warehouse_id: Uuid,
        zone_type: ZoneType,
    ) -> Result<location::Model, ServiceError> {
        let mut uow = self.store.begin().await?;
        let found = Self::default_location_in(uow.as_mut(), warehouse_id, zone_type).await?;
        uow.commit().await?;
        Ok(found)
    }

    pub(crate) async fn load_in(
        uow: &mut dyn UnitOfWork,
        id: Uuid,
    ) -> Result<location::Model, ServiceError> {
        uow.find_location(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Location {} not found", id)))
    }

    /// First active location of the zone type in the warehouse, by code.
    pub(crate) async fn default_location_in(
        uow: &mut dyn UnitOfWork,
        warehouse_id: Uuid,
        zone_type: ZoneType,
    ) -> Result<location::Model, ServiceError> {
        uow.list_locations(warehouse_id, Some(zone_type))
            .await?
            .into_iter()
            .filter(|l| l.is_active)
            .min_by(|a, b| a.code.cmp(&b.code))
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "No active {} location in warehouse {}",
                    zone_type, warehouse_id
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::store::MemoryStore;

    fn service() -> LocationService {
        LocationService::new(Arc::new(MemoryStore::new()), Arc::new(SystemClock))
    }

    fn command(warehouse_id: Uuid, code: &str, zone_type: ZoneType) -> RegisterLocationCommand {
        RegisterLocationCommand {
            warehouse_id,
            zone_id: Uuid::new_v4(),
            code: code.into(),
            zone_type,
        }
    }

    #[tokio::test]
    async fn default_location_picks_lowest_code() {
        let locations = service();
        let warehouse = Uuid::new_v4();
        locations
            .register_location(command(warehouse, "QA-02", ZoneType::Quarantine))
            .await
            .unwrap();
        let first = locations
            .register_location(command(warehouse, "QA-01", ZoneType::Quarantine))
            .await
            .unwrap();
        locations
            .register_location(command(warehouse, "A-01", ZoneType::Storage))
            .await
            .unwrap();

        let picked = locations
            .default_location(warehouse, ZoneType::Quarantine)
            .await
            .unwrap();
        assert_eq!(picked.id, first.id);

        let missing = locations
            .default_location(warehouse, ZoneType::Cold)
            .await
            .unwrap_err();
        assert!(matches!(missing, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn empty_code_is_rejected() {
        let err = service()
            .register_location(command(Uuid::new_v4(), "", ZoneType::Storage))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::ValidationError(_)));
    }
}
