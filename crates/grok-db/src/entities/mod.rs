//! Database entities

pub mod auth_token;
pub mod domain;
pub mod organization;
pub mod request_log;
pub mod tunnel;
pub mod user;
pub mod webhook_app;
pub mod webhook_event;
pub mod webhook_route;
pub mod webhook_tunnel_response;

pub use auth_token::Entity as AuthToken;
pub use domain::Entity as Domain;
pub use organization::Entity as Organization;
pub use request_log::Entity as RequestLog;
pub use tunnel::Entity as Tunnel;
pub use user::Entity as User;
pub use webhook_app::Entity as WebhookApp;
pub use webhook_event::Entity as WebhookEvent;
pub use webhook_route::Entity as WebhookRoute;
pub use webhook_tunnel_response::Entity as WebhookTunnelResponse;

pub mod prelude {
    pub use super::auth_token::Entity as AuthToken;
    pub use super::domain::Entity as Domain;
    pub use super::organization::Entity as Organization;
    pub use super::request_log::Entity as RequestLog;
    pub use super::tunnel::Entity as Tunnel;
    pub use super::user::Entity as User;
    pub use super::webhook_app::Entity as WebhookApp;
    pub use super::webhook_event::Entity as WebhookEvent;
    pub use super::webhook_route::Entity as WebhookRoute;
    pub use super::webhook_tunnel_response::Entity as WebhookTunnelResponse;
}
