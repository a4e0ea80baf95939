//! Observable in-memory cache and synchronization layer for RESTful resources
//!
//! A [`Service`] hands out one canonical [`Resource`] per URL. Each resource
//! tracks its latest data, latest error and in-flight requests, notifies its
//! observers when any of those change, and runs every server response through
//! a configurable transformer [`Pipeline`](pipeline::Pipeline) exactly once.
//!
//! All state lives on a single thread: build the service and drive it from
//! inside a [`tokio::task::LocalSet`]. Network I/O and response parsing run
//! elsewhere, and their results are marshaled back before touching any
//! resource.
//!
//! ```no_run
//! use reposo::{Owner, ResourceEvent, Service};
//!
//! # async fn demo() -> reposo::Result<()> {
//! let service = Service::builder()
//!     .base_url("https://api.example.com/v1")
//!     .build()?;
//!
//! service.configure("/users/*", "user pages", |config| {
//!     config.expiration_time = std::time::Duration::from_secs(300);
//! });
//!
//! let user = service.resource("/users/42");
//! let owner = Owner::new();
//! user.add_observer_fn(&owner, |resource, event| {
//!     if let ResourceEvent::NewData(_) = event {
//!         println!("{:?}", resource.json());
//!     }
//! });
//! user.load_if_needed();
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]

pub use body::Body;
pub use config::{Configuration, ConfigurationPattern};
pub use entity::{Content, ContentKind, ContentType, Entity, Json, Model, RawBytes, Text};
pub use error::{Cause, Error, RequestError, Result};
pub use request::{
    Request, RequestChainAction, RequestCompletionHandler, RequestDelegate, RequestState,
    ResponseInfo,
};
pub use resource::{NewDataSource, Owner, Resource, ResourceEvent, ResourceObserver};
pub use service::{Service, ServiceBuilder};

pub mod config;
pub mod pipeline;
pub mod transport;

mod body;
mod charset;
mod entity;
mod error;
mod registry;
mod request;
mod resource;
mod service;
