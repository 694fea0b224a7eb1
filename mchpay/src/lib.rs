//! Client and simulation server for a signed key-value payment API.
//!
//! Requests and responses are flat string maps ([`fields::FieldMap`]) carried as a one-level
//! XML document and signed with MD5, SHA1 or HMAC-SHA256 over a canonical form of the map.
//!
//! - [`signing`], [`codec`]: the protocol core shared by every operation
//! - [`client`]: defaulting, signing and posting requests, decoding and verifying responses
//! - [`pay`], [`customs`]: typed operations on top of the client
//! - [`mockserver`]: an axum server simulating the order endpoint, including the delayed
//!   payment-result callback
//!
//! ```ignore
//! let client = Client::new(
//!     ClientConfig::builder()
//!         .app_id("wx2421b1c4370ec43b")
//!         .mch_id("10000100")
//!         .api_key(api_key)
//!         .build(),
//! )?;
//! let order = pay::unified_order(&client, &request).await?;
//! if order.result_code == "SUCCESS" { /* hand prepay_id to the payer */ }
//! ```
//!
//! The simulation server binary is `mchpay-mock`; see [`config`] for its settings.

pub mod client;
pub mod codec;
pub mod config;
pub mod customs;
pub mod errors;
pub mod fields;
pub mod mockserver;
pub mod pay;
pub mod signing;
pub mod telemetry;

#[cfg(test)]
mod test;

use std::future::Future;

use axum::Router;
use tokio::net::TcpListener;
use tracing::{debug, info};

pub use client::{Client, ClientConfig, Environment, Response};
pub use config::Config;
pub use errors::{CallbackError, Error};
pub use fields::FieldMap;
pub use signing::SignType;

use mockserver::AppState;
use mockserver::notify::NotificationDispatcher;

/// The simulation server: router, configuration and the notification dispatcher it feeds.
pub struct Application {
    router: Router,
    config: Config,
    dispatcher: NotificationDispatcher,
}

impl Application {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        debug!(
            addr = %config.addr,
            notify_delay_secs = config.notify_delay_secs,
            notify_timeout_secs = ?config.notify_timeout_secs,
            "Starting mock server"
        );

        let dispatcher = NotificationDispatcher::with_timeout(config.notify_timeout())?;
        let state = AppState::builder()
            .api_key(config.api_key())
            .notify_delay(config.notify_delay())
            .dispatcher(dispatcher.clone())
            .build();
        let router = mockserver::build_router(state);

        Ok(Self {
            router,
            config,
            dispatcher,
        })
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(&self.config.addr).await?;
        self.serve_on(listener, shutdown).await
    }

    /// Serve on an already bound listener.
    pub async fn serve_on<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Mock server listening on http://{}", listener.local_addr()?);

        // Pending notifications would otherwise fire after the server is gone, including when
        // serving fails or this future is dropped
        let _pending = self.dispatcher.shutdown_on_drop();

        axum::serve(listener, self.router).with_graceful_shutdown(shutdown).await?;
        info!("Mock server stopped");
        Ok(())
    }
}
