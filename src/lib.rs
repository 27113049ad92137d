//! The Rust SDK for VWO Feature Management and Experimentation (FME).
//!
//! # Overview
//!
//! The SDK revolves around a [`VwoClient`] that decides feature flags for users. Each user is
//! described by a [`UserContext`]: a unique id plus optional user agent, IP address and custom
//! variables used for targeting. A decision results in a [`GetFlag`] telling whether the feature
//! is enabled for the user and which variables they get.
//!
//! Decisions are made locally from a settings document fetched from VWO and refreshed in the
//! background. Bucketing is deterministic: the same user gets the same answer from every process
//! using the same settings. Provide a [`Storage`] to keep decisions sticky across settings
//! changes.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Only configuration problems surface as errors from [`ClientConfig::init`]. Evaluation APIs
//! never fail: problems are logged and a safe default (a disabled flag, `false` for a tracked
//! event) is returned, so feature flagging can never crash the application.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages,
//! under the `vwo` target. Consider integrating a `log`-compatible logger implementation for
//! better visibility into SDK operations.
//!
//! # Example
//!
//! ```no_run
//! use vwo_fme::{ClientConfig, UserContext};
//!
//! let client = ClientConfig::new("sdk-key", 123456).init()?;
//!
//! let context = UserContext::new("user-1").with_custom_variable("plan", "premium");
//! let flag = client.get_flag("new_checkout", &context);
//! if flag.is_enabled() {
//!     println!("button color: {}", flag.get_variable("color", "blue"));
//! }
//!
//! client.track_event("purchase", &context, &Default::default());
//! # Ok::<(), vwo_fme::Error>(())
//! ```

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod allocation;
mod bucketer;
mod client;
mod config;
mod context;
mod error;
mod events;
mod gateway;
mod get_flag;
mod integrations;
mod meg;
mod network;
mod poller;
mod rule_eval;
mod segmentation;
mod settings;
mod settings_fetcher;
mod settings_store;
mod storage;

pub use client::VwoClient;
pub use config::ClientConfig;
pub use context::{AttributeValue, Attributes, UserContext};
pub use error::{Error, Result};
pub use events::{BatchEventData, FlushCallback};
pub use gateway::{GatewayService, GatewayUserData};
pub use get_flag::{FlagVariable, GetFlag};
pub use integrations::{Decision, IntegrationCallback};
pub use network::RetryConfig;
pub use poller::PollerThreadConfig;
pub use storage::{InMemoryStorage, Storage, StoredDecision};
