//! Handler module - role dispatch.
//!
//! Provides:
//! - [`Handler`] - the contract a request handler implements
//! - [`RoleRegistry`] - maps role slots to handler factories
//! - [`RequestContext`], [`ResponderContext`], [`FilterContext`] - what
//!   each role gets to see
//!
//! # Example
//!
//! ```
//! use std::io::{Read, Write};
//! use fcgi_mux::handler::{Handler, HandlerResult, ResponderContext, RoleRegistry};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     type Context = ResponderContext;
//!
//!     fn run(&mut self, ctx: &mut ResponderContext) -> HandlerResult {
//!         let mut body = Vec::new();
//!         ctx.stdin().read_to_end(&mut body)?;
//!         ctx.stdout().write_all(b"Content-Type: application/octet-stream\r\n\r\n")?;
//!         ctx.stdout().write_all(&body)?;
//!         Ok(0)
//!     }
//! }
//!
//! let mut registry = RoleRegistry::new();
//! registry.register(|| Echo).unwrap();
//! ```

mod context;
mod registry;

#[doc(hidden)]
pub use context::RequestParts;
pub use context::{
    AuthorizerContext, CancellationToken, FilterContext, HasData, HasInput, RequestContext,
    ResponderContext, RoleContext,
};
pub(crate) use registry::ErasedHandler;
pub use registry::{
    authorizer_fn, filter_fn, responder_fn, FnHandler, Handler, HandlerResult, RoleRegistry,
    FAILURE_STATUS,
};
