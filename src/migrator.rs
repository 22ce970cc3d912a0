use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20261001_000001_create_document_tables::Migration),
            Box::new(m20261001_000002_create_ledger_tables::Migration),
            Box::new(m20261017_000003_create_inventory_count_tables::Migration),
        ]
    }
}

// Migration implementations

mod m20261017_000003_create_inventory_count_tables {
    use sea_orm::Schema;
    use sea_orm_migration::prelude::*;

    use crate::entities::{inventory_count, inventory_count_line};

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20261017_000003_create_inventory_count_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            let schema = Schema::new(manager.get_database_backend());

            manager
                .create_table(
                    schema
                        .create_table_from_entity(inventory_count::Entity)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;
            manager
                .create_table(
                    schema
                        .create_table_from_entity(inventory_count_line::Entity)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_inventory_count_lines_count")
                        .table(inventory_count_line::Entity)
                        .col(inventory_count_line::Column::CountId)
                        .if_not_exists()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(inventory_count_line::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(inventory_count::Entity).to_owned())
                .await
        }
    }
}

mod m20261001_000002_create_ledger_tables {
    use sea_orm::{EntityTrait, Schema};
    use sea_orm_migration::prelude::*;

    use crate::entities::{
        document_sequence, location, lot, reservation_allocation, stock, stock_movement,
        stock_reservation,
    };

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20261001_000002_create_ledger_tables"
        }
    }

    async fn create_from_entity<E: EntityTrait>(
        manager: &SchemaManager<'_>,
        entity: E,
    ) -> Result<(), DbErr> {
        let schema = Schema::new(manager.get_database_backend());
        manager
            .create_table(
                schema
                    .create_table_from_entity(entity)
                    .if_not_exists()
                    .to_owned(),
            )
            .await
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            create_from_entity(manager, location::Entity).await?;
            create_from_entity(manager, lot::Entity).await?;
            create_from_entity(manager, stock::Entity).await?;
            create_from_entity(manager, stock_movement::Entity).await?;
            create_from_entity(manager, stock_reservation::Entity).await?;
            create_from_entity(manager, reservation_allocation::Entity).await?;
            create_from_entity(manager, document_sequence::Entity).await?;

            // One row per (location, material, lot)
            manager
                .create_index(
                    Index::create()
                        .name("uq_stock_location_material_lot")
                        .table(stock::Entity)
                        .col(stock::Column::LocationId)
                        .col(stock::Column::MaterialId)
                        .col(stock::Column::LotId)
                        .unique()
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_stock_material")
                        .table(stock::Entity)
                        .col(stock::Column::MaterialId)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_lots_material_expiry")
                        .table(lot::Entity)
                        .col(lot::Column::MaterialId)
                        .col(lot::Column::ExpiryDate)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_movements_material_created")
                        .table(stock_movement::Entity)
                        .col(stock_movement::Column::MaterialId)
                        .col(stock_movement::Column::CreatedAt)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_movements_lot")
                        .table(stock_movement::Entity)
                        .col(stock_movement::Column::LotId)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_reservations_material_status")
                        .table(stock_reservation::Entity)
                        .col(stock_reservation::Column::MaterialId)
                        .col(stock_reservation::Column::Status)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_reservation_allocations_reservation")
                        .table(reservation_allocation::Entity)
                        .col(reservation_allocation::Column::ReservationId)
                        .if_not_exists()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(document_sequence::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(reservation_allocation::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(stock_reservation::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(stock_movement::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(stock::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(lot::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(location::Entity).to_owned())
                .await
        }
    }
}

mod m20261001_000001_create_document_tables {
    use sea_orm::Schema;
    use sea_orm_migration::prelude::*;

    use crate::entities::{goods_issue, goods_issue_line, grn, grn_line_item};

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20261001_000001_create_document_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            let schema = Schema::new(manager.get_database_backend());

            manager
                .create_table(schema.create_table_from_entity(grn::Entity).if_not_exists().to_owned())
                .await?;
            manager
                .create_table(
                    schema
                        .create_table_from_entity(grn_line_item::Entity)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;
            manager
                .create_table(
                    schema
                        .create_table_from_entity(goods_issue::Entity)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;
            manager
                .create_table(
                    schema
                        .create_table_from_entity(goods_issue_line::Entity)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_grn_line_items_grn")
                        .table(grn_line_item::Entity)
                        .col(grn_line_item::Column::GrnId)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_goods_issue_lines_issue")
                        .table(goods_issue_line::Entity)
                        .col(goods_issue_line::Column::GoodsIssueId)
                        .if_not_exists()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(goods_issue_line::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(goods_issue::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(grn_line_item::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(grn::Entity).to_owned())
                .await
        }
    }
}
