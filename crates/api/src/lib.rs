pub mod attachments;
pub mod auth;
pub mod batch;
pub mod bus;
pub mod cache;
pub mod context;
pub mod engine;
pub mod error;
pub mod methods;
pub mod password;
pub mod registry;
pub mod result;
pub mod runner;
pub mod services;
pub mod users;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::{authenticate, sign_sso_cookie, verify_sso_cookie, AuthSource, TrustedApps};
pub use bus::{Bus, Notification, TcpFanout, TestTransport, Topic, Transport};
pub use cache::UserCache;
pub use context::{MethodContext, SYSTEM_ACTOR};
pub use error::{map_store_error, StoreResultExt};
pub use registry::{step, Api, Params, Step, StepFuture};
pub use result::MethodResult;
pub use services::{ApiSettings, Services, WebhookDefaults};

/// Build the fully wired method registry.
#[must_use]
pub fn build_api() -> Api {
    let mut api = Api::new();
    methods::register_all(&mut api);
    api
}
