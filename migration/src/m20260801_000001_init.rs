use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[derive(DeriveIden)]
enum Subjects {
    Table,
    Id,
    Doc,
}

#[derive(DeriveIden)]
enum Resources {
    Table,
    Id,
    Doc,
}

#[derive(DeriveIden)]
enum Groups {
    Table,
    Id,
    Name,
    Membership,
    Created,
    Expiry,
}

#[derive(DeriveIden)]
enum Grants {
    Table,
    Id,
    SubjectId,
    ResourceId,
    Permission,
    Negated,
    Extra,
    Created,
    Expiry,
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Subjects::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Subjects::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Subjects::Doc).json_binary().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_subjects_doc")
                    .table(Subjects::Table)
                    .col(Subjects::Doc)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Resources::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Resources::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Resources::Doc).json_binary().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_resources_doc")
                    .table(Resources::Table)
                    .col(Resources::Doc)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Groups::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Groups::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Groups::Name)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Groups::Membership).json_binary().not_null())
                    .col(
                        ColumnDef::new(Groups::Created)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::cust("now()")),
                    )
                    .col(ColumnDef::new(Groups::Expiry).timestamp_with_time_zone())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Grants::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Grants::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Grants::SubjectId).big_integer().not_null())
                    .col(ColumnDef::new(Grants::ResourceId).big_integer().not_null())
                    .col(ColumnDef::new(Grants::Permission).string().not_null())
                    .col(
                        ColumnDef::new(Grants::Negated)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Grants::Extra).json_binary().not_null())
                    .col(
                        ColumnDef::new(Grants::Created)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::cust("now()")),
                    )
                    .col(ColumnDef::new(Grants::Expiry).timestamp_with_time_zone())
                    .to_owned(),
            )
            .await?;

        manager
            .create_foreign_key(
                ForeignKey::create()
                    .name("fk_grants_subject")
                    .from(Grants::Table, Grants::SubjectId)
                    .to(Subjects::Table, Subjects::Id)
                    .to_owned(),
            )
            .await?;

        manager
            .create_foreign_key(
                ForeignKey::create()
                    .name("fk_grants_resource")
                    .from(Grants::Table, Grants::ResourceId)
                    .to(Resources::Table, Resources::Id)
                    .to_owned(),
            )
            .await?;

        // NULLS NOT DISTINCT so two open-ended duplicates still collide while
        // a grant can be re-issued with a different expiry.
        manager
            .create_index(
                Index::create()
                    .name("idx_grants_unique")
                    .table(Grants::Table)
                    .col(Grants::SubjectId)
                    .col(Grants::ResourceId)
                    .col(Grants::Permission)
                    .col(Grants::Expiry)
                    .unique()
                    .nulls_not_distinct()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_foreign_key(
                ForeignKey::drop()
                    .name("fk_grants_subject")
                    .table(Grants::Table)
                    .to_owned(),
            )
            .await?;
        manager
            .drop_foreign_key(
                ForeignKey::drop()
                    .name("fk_grants_resource")
                    .table(Grants::Table)
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(Grants::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Groups::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Resources::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Subjects::Table).to_owned())
            .await?;
        Ok(())
    }
}
