//! Consolidated initial schema migration

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ============================================================
        // 1. organizations
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Organization::Table)
                    .if_not_exists()
                    .col(uuid(Organization::Id).primary_key())
                    .col(string_len(Organization::Name, 255).not_null())
                    .col(
                        string_len(Organization::Subdomain, 63)
                            .not_null()
                            .unique_key(),
                    )
                    .col(boolean(Organization::IsActive).not_null().default(true))
                    .col(
                        timestamp_with_time_zone(Organization::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Organization::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 2. users
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(User::Table)
                    .if_not_exists()
                    .col(uuid(User::Id).primary_key())
                    .col(string_len(User::Email, 255).not_null().unique_key())
                    .col(string_len(User::PasswordHash, 255).not_null())
                    .col(string_len(User::Name, 255).not_null())
                    .col(string_len(User::Role, 32).not_null().default("org_user"))
                    .col(ColumnDef::new(User::OrganizationId).uuid().null())
                    .col(
                        boolean(User::TwoFactorEnabled)
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(User::TwoFactorSecret).string_len(64).null())
                    .col(boolean(User::IsActive).not_null().default(true))
                    .col(
                        timestamp_with_time_zone(User::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(User::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_users_organization_id")
                            .from(User::Table, User::OrganizationId)
                            .to(Organization::Table, Organization::Id)
                            .on_delete(ForeignKeyAction::SetNull)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_users_organization_id")
                    .table(User::Table)
                    .col(User::OrganizationId)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 3. auth_tokens
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(AuthToken::Table)
                    .if_not_exists()
                    .col(uuid(AuthToken::Id).primary_key())
                    .col(ColumnDef::new(AuthToken::UserId).uuid().not_null())
                    .col(
                        string_len(AuthToken::TokenHash, 64)
                            .not_null()
                            .unique_key(),
                    )
                    .col(string_len(AuthToken::Name, 255).not_null())
                    .col(string_len(AuthToken::Scopes, 255).not_null().default(""))
                    .col(
                        ColumnDef::new(AuthToken::ExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(boolean(AuthToken::IsActive).not_null().default(true))
                    .col(
                        ColumnDef::new(AuthToken::LastUsedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        timestamp_with_time_zone(AuthToken::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_auth_tokens_user_id")
                            .from(AuthToken::Table, AuthToken::UserId)
                            .to(User::Table, User::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_auth_tokens_user_id")
                    .table(AuthToken::Table)
                    .col(AuthToken::UserId)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 4. domains (persistent subdomain reservations)
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Domain::Table)
                    .if_not_exists()
                    .col(uuid(Domain::Id).primary_key())
                    .col(ColumnDef::new(Domain::UserId).uuid().not_null())
                    .col(ColumnDef::new(Domain::OrganizationId).uuid().null())
                    .col(
                        string_len(Domain::Subdomain, 255)
                            .not_null()
                            .unique_key(),
                    )
                    .col(boolean(Domain::IsReserved).not_null().default(true))
                    .col(
                        timestamp_with_time_zone(Domain::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_domains_user_id")
                            .from(Domain::Table, Domain::UserId)
                            .to(User::Table, User::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 5. tunnels
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Tunnel::Table)
                    .if_not_exists()
                    .col(uuid(Tunnel::Id).primary_key())
                    .col(ColumnDef::new(Tunnel::UserId).uuid().not_null())
                    .col(ColumnDef::new(Tunnel::TokenId).uuid().not_null())
                    .col(ColumnDef::new(Tunnel::OrganizationId).uuid().null())
                    .col(string_len(Tunnel::TunnelType, 16).not_null())
                    .col(string_len(Tunnel::Subdomain, 255).not_null().default(""))
                    .col(ColumnDef::new(Tunnel::RemotePort).integer().null())
                    .col(string_len(Tunnel::LocalAddr, 255).not_null())
                    .col(string_len(Tunnel::PublicUrl, 512).not_null())
                    .col(
                        string_len(Tunnel::ClientId, 128)
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Tunnel::SavedName).string_len(255).null())
                    .col(boolean(Tunnel::IsPersistent).not_null().default(false))
                    .col(string_len(Tunnel::Status, 16).not_null().default("active"))
                    .col(big_integer(Tunnel::BytesIn).not_null().default(0))
                    .col(big_integer(Tunnel::BytesOut).not_null().default(0))
                    .col(big_integer(Tunnel::RequestsCount).not_null().default(0))
                    .col(
                        timestamp_with_time_zone(Tunnel::ConnectedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Tunnel::DisconnectedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        timestamp_with_time_zone(Tunnel::LastActivityAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_tunnels_user_id")
                            .from(Tunnel::Table, Tunnel::UserId)
                            .to(User::Table, User::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_tunnels_token_id")
                            .from(Tunnel::Table, Tunnel::TokenId)
                            .to(AuthToken::Table, AuthToken::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_tunnels_subdomain")
                    .table(Tunnel::Table)
                    .col(Tunnel::Subdomain)
                    .to_owned(),
            )
            .await?;

        // NULL saved_name rows never collide, so this enforces
        // "(user_id, saved_name) unique when set" on both backends.
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_tunnels_user_saved_name")
                    .table(Tunnel::Table)
                    .col(Tunnel::UserId)
                    .col(Tunnel::SavedName)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_tunnels_status")
                    .table(Tunnel::Table)
                    .col(Tunnel::Status)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 6. request_logs
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(RequestLog::Table)
                    .if_not_exists()
                    .col(uuid(RequestLog::Id).primary_key())
                    .col(ColumnDef::new(RequestLog::TunnelId).uuid().not_null())
                    .col(string_len(RequestLog::Method, 16).not_null())
                    .col(string_len(RequestLog::Path, 2048).not_null())
                    .col(integer(RequestLog::StatusCode).not_null())
                    .col(big_integer(RequestLog::DurationMs).not_null())
                    .col(big_integer(RequestLog::BytesIn).not_null().default(0))
                    .col(big_integer(RequestLog::BytesOut).not_null().default(0))
                    .col(string_len(RequestLog::ClientIp, 64).not_null())
                    .col(
                        timestamp_with_time_zone(RequestLog::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_request_logs_tunnel_id")
                            .from(RequestLog::Table, RequestLog::TunnelId)
                            .to(Tunnel::Table, Tunnel::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_request_logs_tunnel_created")
                    .table(RequestLog::Table)
                    .col(RequestLog::TunnelId)
                    .col((RequestLog::CreatedAt, IndexOrder::Asc))
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 7. webhook_apps
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(WebhookApp::Table)
                    .if_not_exists()
                    .col(uuid(WebhookApp::Id).primary_key())
                    .col(ColumnDef::new(WebhookApp::OrganizationId).uuid().not_null())
                    .col(ColumnDef::new(WebhookApp::UserId).uuid().not_null())
                    .col(string_len(WebhookApp::Name, 63).not_null())
                    .col(boolean(WebhookApp::IsActive).not_null().default(true))
                    .col(
                        timestamp_with_time_zone(WebhookApp::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_webhook_apps_organization_id")
                            .from(WebhookApp::Table, WebhookApp::OrganizationId)
                            .to(Organization::Table, Organization::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_webhook_apps_user_id")
                            .from(WebhookApp::Table, WebhookApp::UserId)
                            .to(User::Table, User::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_webhook_apps_org_name")
                    .table(WebhookApp::Table)
                    .col(WebhookApp::OrganizationId)
                    .col(WebhookApp::Name)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 8. webhook_routes
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(WebhookRoute::Table)
                    .if_not_exists()
                    .col(uuid(WebhookRoute::Id).primary_key())
                    .col(
                        ColumnDef::new(WebhookRoute::WebhookAppId)
                            .uuid()
                            .not_null(),
                    )
                    .col(ColumnDef::new(WebhookRoute::TunnelId).uuid().not_null())
                    .col(integer(WebhookRoute::Priority).not_null().default(100))
                    .col(boolean(WebhookRoute::IsEnabled).not_null().default(true))
                    .col(
                        string_len(WebhookRoute::HealthStatus, 16)
                            .not_null()
                            .default("unknown"),
                    )
                    .col(integer(WebhookRoute::FailureCount).not_null().default(0))
                    .col(
                        ColumnDef::new(WebhookRoute::LastHealthCheck)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        timestamp_with_time_zone(WebhookRoute::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_webhook_routes_app_id")
                            .from(WebhookRoute::Table, WebhookRoute::WebhookAppId)
                            .to(WebhookApp::Table, WebhookApp::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_webhook_routes_tunnel_id")
                            .from(WebhookRoute::Table, WebhookRoute::TunnelId)
                            .to(Tunnel::Table, Tunnel::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_webhook_routes_app_tunnel")
                    .table(WebhookRoute::Table)
                    .col(WebhookRoute::WebhookAppId)
                    .col(WebhookRoute::TunnelId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 9. webhook_events
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(WebhookEvent::Table)
                    .if_not_exists()
                    .col(uuid(WebhookEvent::Id).primary_key())
                    .col(
                        ColumnDef::new(WebhookEvent::WebhookAppId)
                            .uuid()
                            .not_null(),
                    )
                    .col(string_len(WebhookEvent::RequestPath, 2048).not_null())
                    .col(string_len(WebhookEvent::Method, 16).not_null())
                    .col(integer(WebhookEvent::StatusCode).not_null())
                    .col(big_integer(WebhookEvent::DurationMs).not_null())
                    .col(big_integer(WebhookEvent::BytesIn).not_null().default(0))
                    .col(big_integer(WebhookEvent::BytesOut).not_null().default(0))
                    .col(string_len(WebhookEvent::ClientIp, 64).not_null())
                    .col(string_len(WebhookEvent::RoutingStatus, 16).not_null())
                    .col(integer(WebhookEvent::TunnelCount).not_null())
                    .col(integer(WebhookEvent::SuccessCount).not_null())
                    .col(ColumnDef::new(WebhookEvent::ErrorMessage).text().null())
                    .col(ColumnDef::new(WebhookEvent::RequestHeaders).text().not_null())
                    .col(ColumnDef::new(WebhookEvent::RequestBody).text().null())
                    .col(
                        boolean(WebhookEvent::BodyTruncated)
                            .not_null()
                            .default(false),
                    )
                    .col(
                        timestamp_with_time_zone(WebhookEvent::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_webhook_events_app_id")
                            .from(WebhookEvent::Table, WebhookEvent::WebhookAppId)
                            .to(WebhookApp::Table, WebhookApp::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_webhook_events_app_created")
                    .table(WebhookEvent::Table)
                    .col(WebhookEvent::WebhookAppId)
                    .col((WebhookEvent::CreatedAt, IndexOrder::Desc))
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 10. webhook_tunnel_responses
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(WebhookTunnelResponse::Table)
                    .if_not_exists()
                    .col(uuid(WebhookTunnelResponse::Id).primary_key())
                    .col(
                        ColumnDef::new(WebhookTunnelResponse::WebhookEventId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WebhookTunnelResponse::TunnelId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        string_len(WebhookTunnelResponse::TunnelSubdomain, 255)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WebhookTunnelResponse::StatusCode)
                            .integer()
                            .null(),
                    )
                    .col(big_integer(WebhookTunnelResponse::DurationMs).not_null())
                    .col(boolean(WebhookTunnelResponse::Success).not_null())
                    .col(
                        ColumnDef::new(WebhookTunnelResponse::ErrorMessage)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(WebhookTunnelResponse::Headers)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(WebhookTunnelResponse::Body).text().null())
                    .col(
                        timestamp_with_time_zone(WebhookTunnelResponse::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_webhook_tunnel_responses_event_id")
                            .from(
                                WebhookTunnelResponse::Table,
                                WebhookTunnelResponse::WebhookEventId,
                            )
                            .to(WebhookEvent::Table, WebhookEvent::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_webhook_tunnel_responses_event")
                    .table(WebhookTunnelResponse::Table)
                    .col(WebhookTunnelResponse::WebhookEventId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(
                Table::drop()
                    .table(WebhookTunnelResponse::Table)
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(WebhookEvent::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(WebhookRoute::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(WebhookApp::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(RequestLog::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Tunnel::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Domain::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(AuthToken::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(User::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Organization::Table).to_owned())
            .await?;

        Ok(())
    }
}

// ============================================================
// Table identifiers
// ============================================================

#[derive(DeriveIden)]
enum Organization {
    #[sea_orm(iden = "organizations")]
    Table,
    Id,
    Name,
    Subdomain,
    IsActive,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum User {
    #[sea_orm(iden = "users")]
    Table,
    Id,
    Email,
    PasswordHash,
    Name,
    Role,
    OrganizationId,
    TwoFactorEnabled,
    TwoFactorSecret,
    IsActive,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum AuthToken {
    #[sea_orm(iden = "auth_tokens")]
    Table,
    Id,
    UserId,
    TokenHash,
    Name,
    Scopes,
    ExpiresAt,
    IsActive,
    LastUsedAt,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Domain {
    #[sea_orm(iden = "domains")]
    Table,
    Id,
    UserId,
    OrganizationId,
    Subdomain,
    IsReserved,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Tunnel {
    #[sea_orm(iden = "tunnels")]
    Table,
    Id,
    UserId,
    TokenId,
    OrganizationId,
    TunnelType,
    Subdomain,
    RemotePort,
    LocalAddr,
    PublicUrl,
    ClientId,
    SavedName,
    IsPersistent,
    Status,
    BytesIn,
    BytesOut,
    RequestsCount,
    ConnectedAt,
    DisconnectedAt,
    LastActivityAt,
}

#[derive(DeriveIden)]
enum RequestLog {
    #[sea_orm(iden = "request_logs")]
    Table,
    Id,
    TunnelId,
    Method,
    Path,
    StatusCode,
    DurationMs,
    BytesIn,
    BytesOut,
    ClientIp,
    CreatedAt,
}

#[derive(DeriveIden)]
enum WebhookApp {
    #[sea_orm(iden = "webhook_apps")]
    Table,
    Id,
    OrganizationId,
    UserId,
    Name,
    IsActive,
    CreatedAt,
}

#[derive(DeriveIden)]
enum WebhookRoute {
    #[sea_orm(iden = "webhook_routes")]
    Table,
    Id,
    WebhookAppId,
    TunnelId,
    Priority,
    IsEnabled,
    HealthStatus,
    FailureCount,
    LastHealthCheck,
    CreatedAt,
}

#[derive(DeriveIden)]
enum WebhookEvent {
    #[sea_orm(iden = "webhook_events")]
    Table,
    Id,
    WebhookAppId,
    RequestPath,
    Method,
    StatusCode,
    DurationMs,
    BytesIn,
    BytesOut,
    ClientIp,
    RoutingStatus,
    TunnelCount,
    SuccessCount,
    ErrorMessage,
    RequestHeaders,
    RequestBody,
    BodyTruncated,
    CreatedAt,
}

#[derive(DeriveIden)]
enum WebhookTunnelResponse {
    #[sea_orm(iden = "webhook_tunnel_responses")]
    Table,
    Id,
    WebhookEventId,
    TunnelId,
    TunnelSubdomain,
    StatusCode,
    DurationMs,
    Success,
    ErrorMessage,
    Headers,
    Body,
    CreatedAt,
}
