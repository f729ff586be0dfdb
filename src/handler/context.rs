//! Request contexts handed to handlers.
//!
//! Each role sees a different context:
//! - authorizer: [`RequestContext`] - params, stdout, stderr, cancellation
//! - responder: [`ResponderContext`] - adds the STDIN stream
//! - filter: [`FilterContext`] - adds the DATA stream; STDIN is fully
//!   buffered before the handler runs
//!
//! Richer contexts deref to poorer ones, so code written against
//! `&mut RequestContext` works for every role.
//!
//! # Example
//!
//! ```ignore
//! fn respond(ctx: &mut ResponderContext) -> HandlerResult {
//!     let mut body = Vec::new();
//!     ctx.stdin().read_to_end(&mut body)?;
//!     write!(ctx.stdout(), "Content-Type: text/plain\r\n\r\n{} bytes", body.len())?;
//!     Ok(0)
//! }
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::io::{InputStream, OutputStream};
use crate::mux::Params;
use crate::protocol::Role;

/// Cooperative cancellation flag, set when the peer aborts the request.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Every clone observes it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Everything a request context is built from.
#[doc(hidden)]
pub struct RequestParts {
    pub(crate) request_id: u16,
    pub(crate) role: Role,
    pub(crate) params: Params,
    pub(crate) stdout: OutputStream,
    pub(crate) stderr: OutputStream,
    pub(crate) stdin: InputStream,
    pub(crate) data: InputStream,
    pub(crate) cancel: CancellationToken,
}

/// Context shared by every role; all an authorizer gets.
#[derive(Debug)]
pub struct RequestContext {
    request_id: u16,
    role: Role,
    params: Params,
    stdout: OutputStream,
    stderr: OutputStream,
    cancel: CancellationToken,
}

/// Context of the authorizer role.
pub type AuthorizerContext = RequestContext;

impl RequestContext {
    /// Request id on the connection.
    #[inline]
    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    /// Role the peer asked for.
    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Request parameters.
    #[inline]
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Shortcut for `params().get_str(name)`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get_str(name)
    }

    /// STDOUT stream.
    #[inline]
    pub fn stdout(&mut self) -> &mut OutputStream {
        &mut self.stdout
    }

    /// STDERR stream.
    #[inline]
    pub fn stderr(&mut self) -> &mut OutputStream {
        &mut self.stderr
    }

    /// Token set when the peer aborts this request.
    #[inline]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Flush both output streams and send their closing empty records.
    pub(crate) fn finish_streams(&mut self) {
        self.stdout.finish();
        self.stderr.finish();
    }

    fn split(parts: RequestParts) -> (Self, InputStream, InputStream) {
        let base = Self {
            request_id: parts.request_id,
            role: parts.role,
            params: parts.params,
            stdout: parts.stdout,
            stderr: parts.stderr,
            cancel: parts.cancel,
        };
        (base, parts.stdin, parts.data)
    }
}

/// Context of the responder role.
#[derive(Debug)]
pub struct ResponderContext {
    base: RequestContext,
    stdin: InputStream,
}

impl ResponderContext {
    /// STDIN stream, bounded by CONTENT_LENGTH.
    #[inline]
    pub fn stdin(&mut self) -> &mut InputStream {
        &mut self.stdin
    }
}

impl Deref for ResponderContext {
    type Target = RequestContext;

    fn deref(&self) -> &RequestContext {
        &self.base
    }
}

impl DerefMut for ResponderContext {
    fn deref_mut(&mut self) -> &mut RequestContext {
        &mut self.base
    }
}

/// Context of the filter role.
#[derive(Debug)]
pub struct FilterContext {
    responder: ResponderContext,
    data: InputStream,
}

impl FilterContext {
    /// DATA stream (the file to filter), bounded by FCGI_DATA_LENGTH.
    #[inline]
    pub fn data(&mut self) -> &mut InputStream {
        &mut self.data
    }
}

impl Deref for FilterContext {
    type Target = ResponderContext;

    fn deref(&self) -> &ResponderContext {
        &self.responder
    }
}

impl DerefMut for FilterContext {
    fn deref_mut(&mut self) -> &mut ResponderContext {
        &mut self.responder
    }
}

/// Contexts that carry an input stream.
pub trait HasInput {
    fn input(&mut self) -> &mut InputStream;
}

/// Contexts that carry a data stream.
pub trait HasData: HasInput {
    fn data_stream(&mut self) -> &mut InputStream;
}

impl HasInput for ResponderContext {
    fn input(&mut self) -> &mut InputStream {
        &mut self.stdin
    }
}

impl HasInput for FilterContext {
    fn input(&mut self) -> &mut InputStream {
        &mut self.responder.stdin
    }
}

impl HasData for FilterContext {
    fn data_stream(&mut self) -> &mut InputStream {
        &mut self.data
    }
}

mod sealed {
    pub trait Sealed {}

    impl Sealed for super::RequestContext {}
    impl Sealed for super::ResponderContext {}
    impl Sealed for super::FilterContext {}
}

/// One of the three role contexts. Sealed; the role is fixed per type.
pub trait RoleContext: sealed::Sealed + Send + Sized + 'static {
    /// Role slot this context belongs to.
    const ROLE: Role;

    #[doc(hidden)]
    fn from_parts(parts: RequestParts) -> Self;

    /// The shared part of the context.
    fn base_mut(&mut self) -> &mut RequestContext;
}

impl RoleContext for RequestContext {
    const ROLE: Role = Role::Authorizer;

    fn from_parts(parts: RequestParts) -> Self {
        // an authorizer has no input streams
        RequestContext::split(parts).0
    }

    fn base_mut(&mut self) -> &mut RequestContext {
        self
    }
}

impl RoleContext for ResponderContext {
    const ROLE: Role = Role::Responder;

    fn from_parts(parts: RequestParts) -> Self {
        let (base, stdin, _data) = RequestContext::split(parts);
        Self { base, stdin }
    }

    fn base_mut(&mut self) -> &mut RequestContext {
        &mut self.base
    }
}

impl RoleContext for FilterContext {
    const ROLE: Role = Role::Filter;

    fn from_parts(parts: RequestParts) -> Self {
        let (base, stdin, data) = RequestContext::split(parts);
        Self {
            responder: ResponderContext { base, stdin },
            data,
        }
    }

    fn base_mut(&mut self) -> &mut RequestContext {
        &mut self.responder.base
    }
}
