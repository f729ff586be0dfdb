//! Handler registry for dispatching requests by role.
//!
//! The registry holds one handler factory per role slot. Each request gets
//! a fresh handler from its role's factory. A handler type picks its role
//! through its context type, so one type can never serve two roles.
//!
//! # Example
//!
//! ```
//! use std::io::Write;
//! use fcgi_mux::handler::{HandlerResult, ResponderContext, RoleRegistry};
//!
//! let mut registry = RoleRegistry::new();
//!
//! registry
//!     .register_fn(|ctx: &mut ResponderContext| -> HandlerResult {
//!         ctx.stdout().write_all(b"Content-Type: text/plain\r\n\r\nhi")?;
//!         Ok(0)
//!     })
//!     .unwrap();
//!
//! assert!(registry.is_registered(fcgi_mux::protocol::Role::Responder));
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use super::context::{RequestContext, RequestParts, RoleContext};
use crate::error::{FcgiError, Result};
use crate::protocol::Role;

/// Result type for handler functions: the application status code.
pub type HandlerResult = Result<i32>;

/// Status reported when a handler fails or panics.
pub const FAILURE_STATUS: i32 = -1;

/// A request handler for exactly one role.
///
/// The role is chosen by `Context`: [`RequestContext`] (authorizer),
/// [`ResponderContext`](super::ResponderContext) or
/// [`FilterContext`](super::FilterContext).
pub trait Handler: Send + 'static {
    /// Context type, which fixes the role.
    type Context: RoleContext;

    /// Serve one request and return its application status.
    fn run(&mut self, ctx: &mut Self::Context) -> HandlerResult;
}

/// Wrapper turning a closure into a [`Handler`] for the role of `C`.
pub struct FnHandler<F, C> {
    handler: Arc<F>,
    _role: PhantomData<fn(&mut C)>,
}

impl<F, C> FnHandler<F, C>
where
    F: Fn(&mut C) -> HandlerResult + Send + Sync + 'static,
    C: RoleContext,
{
    /// Create a new closure handler.
    pub fn new(handler: F) -> Self {
        Self::from_shared(Arc::new(handler))
    }

    fn from_shared(handler: Arc<F>) -> Self {
        Self {
            handler,
            _role: PhantomData,
        }
    }
}

impl<F, C> Handler for FnHandler<F, C>
where
    F: Fn(&mut C) -> HandlerResult + Send + Sync + 'static,
    C: RoleContext,
{
    type Context = C;

    fn run(&mut self, ctx: &mut C) -> HandlerResult {
        (self.handler)(ctx)
    }
}

/// Closure handler for the responder role.
pub fn responder_fn<F>(f: F) -> FnHandler<F, super::ResponderContext>
where
    F: Fn(&mut super::ResponderContext) -> HandlerResult + Send + Sync + 'static,
{
    FnHandler::new(f)
}

/// Closure handler for the authorizer role.
pub fn authorizer_fn<F>(f: F) -> FnHandler<F, RequestContext>
where
    F: Fn(&mut RequestContext) -> HandlerResult + Send + Sync + 'static,
{
    FnHandler::new(f)
}

/// Closure handler for the filter role.
pub fn filter_fn<F>(f: F) -> FnHandler<F, super::FilterContext>
where
    F: Fn(&mut super::FilterContext) -> HandlerResult + Send + Sync + 'static,
{
    FnHandler::new(f)
}

/// A handler with its context type erased.
pub(crate) trait ErasedHandler: Send {
    /// Build the context, run the handler, finish the output streams.
    ///
    /// Faults become [`FAILURE_STATUS`]. Returns the status to report.
    fn serve(self: Box<Self>, parts: RequestParts) -> i32;
}

struct Erased<H>(H);

impl<H: Handler> ErasedHandler for Erased<H> {
    fn serve(mut self: Box<Self>, parts: RequestParts) -> i32 {
        let request_id = parts.request_id;
        let mut ctx = H::Context::from_parts(parts);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.0.run(&mut ctx)));
        let status = match outcome {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                tracing::error!("request {} handler failed: {}", request_id, e);
                FAILURE_STATUS
            }
            Err(payload) => {
                let fault = FcgiError::HandlerFault(panic_message(payload.as_ref()));
                tracing::error!("request {} handler panicked: {}", request_id, fault);
                FAILURE_STATUS
            }
        };

        ctx.base_mut().finish_streams();
        status
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

type Factory = Arc<dyn Fn() -> Box<dyn ErasedHandler> + Send + Sync>;

/// Registry mapping role slots to handler factories.
#[derive(Clone, Default)]
pub struct RoleRegistry {
    slots: [Option<Factory>; 3],
}

impl RoleRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler factory for the role of `H`.
    ///
    /// Fails with [`FcgiError::RoleAlreadyRegistered`] if the slot is taken.
    pub fn register<H, F>(&mut self, factory: F) -> Result<()>
    where
        H: Handler,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let role = <H::Context as RoleContext>::ROLE;
        let slot = &mut self.slots[role.slot()];
        if slot.is_some() {
            return Err(FcgiError::RoleAlreadyRegistered(role));
        }
        *slot = Some(Arc::new(move || Box::new(Erased(factory())) as Box<dyn ErasedHandler>));
        tracing::debug!("registered {:?} handler", role);
        Ok(())
    }

    /// Register a closure; the closure's context type picks the role.
    pub fn register_fn<C, F>(&mut self, f: F) -> Result<()>
    where
        C: RoleContext,
        F: Fn(&mut C) -> HandlerResult + Send + Sync + 'static,
    {
        let shared = Arc::new(f);
        self.register(move || FnHandler::<F, C>::from_shared(shared.clone()))
    }

    /// Check whether a role has a handler.
    pub fn is_registered(&self, role: Role) -> bool {
        self.slots[role.slot()].is_some()
    }

    /// Roles with a registered handler.
    pub fn roles(&self) -> impl Iterator<Item = Role> + '_ {
        Role::ALL.into_iter().filter(|role| self.is_registered(*role))
    }

    /// Fresh handler for one request, if the role is registered.
    pub(crate) fn create(&self, role: Role) -> Option<Box<dyn ErasedHandler>> {
        self.slots[role.slot()].as_ref().map(|factory| factory())
    }
}

impl fmt::Debug for RoleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleRegistry")
            .field("roles", &self.roles().collect::<Vec<_>>())
            .finish()
    }
}
