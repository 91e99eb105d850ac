//! Per-request data (client address and request headers) made available to the client-info
//! and correlation-id enrichers of events emitted while the request is being handled.

use std::{cell::RefCell, collections::HashMap, marker::PhantomData, net::IpAddr, rc::Rc};

thread_local! {
    static CURRENT: RefCell<Vec<RequestContext>> = const { RefCell::new(Vec::new()) };
}

/// The request an event is emitted on behalf of.
///
/// A context is made current for the calling thread with [`RequestContext::enter`] or
/// [`RequestContext::scope`]; contexts nest, the innermost one being current.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    client_ip: Option<IpAddr>,
    headers: HashMap<String, String>,
}

impl RequestContext {
    /// Creates a context with no client address and no headers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the address of the client that issued the request.
    #[must_use]
    pub fn with_client_ip(mut self, client_ip: IpAddr) -> Self {
        self.client_ip = Some(client_ip);
        self
    }

    /// Adds a request header. Header names are case-insensitive.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Address of the client, if known.
    pub fn client_ip(&self) -> Option<IpAddr> {
        self.client_ip
    }

    /// Value of the header `name`, if the request carried it.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Makes this context current for the calling thread until the guard is dropped.
    pub fn enter(self) -> RequestContextGuard {
        CURRENT.with(|stack| stack.borrow_mut().push(self));
        RequestContextGuard {
            _not_send: PhantomData,
        }
    }

    /// Runs `f` with this context current for the calling thread.
    pub fn scope<R>(self, f: impl FnOnce() -> R) -> R {
        let _guard = self.enter();
        f()
    }

    /// Runs `f` with the current context of the calling thread, if any.
    pub(crate) fn with_current<R>(f: impl FnOnce(Option<&Self>) -> R) -> R {
        CURRENT.with(|stack| f(stack.borrow().last()))
    }
}

/// Keeps a [`RequestContext`] current; restores the previous one when dropped.
#[derive(Debug)]
pub struct RequestContextGuard {
    // The context lives in a thread-local, so the guard must stay on the entering thread.
    _not_send: PhantomData<Rc<()>>,
}

impl Drop for RequestContextGuard {
    fn drop(&mut self) {
        CURRENT.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}
