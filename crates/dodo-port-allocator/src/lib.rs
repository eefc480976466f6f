//! Ingress port allocator
//!
//! Apps that expose raw TCP/UDP services get an ingress port through this
//! service. It edits the ingress HelmRelease in the configuration
//! repository and answers over a small JSON API:
//!
//! - `POST /api/reserve` - hold a port for a while, returns `{port, secret}`
//! - `POST /api/allocate` - map a port to `service:port`
//! - `POST /api/remove` - drop a mapping, given its secret

#![deny(missing_docs)]

pub mod allocator;
pub mod api;
pub mod error;
pub mod server;

pub use allocator::{AllocatorConfig, AllocatorState, PortAllocator};
pub use api::{AllocateRequest, PortResponse, Protocol, RemoveRequest, ReserveRequest};
pub use error::{Error, Result};
pub use server::{router, serve};
