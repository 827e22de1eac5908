//! Service traits, table-driven adapters and interceptors.

use crate::context::CallContext;
use crate::error::Error;
use arf_rpc::{BadStatus, Status};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future used by the dyn-safe service and interceptor traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A registered service: a stable id plus a set of invokable methods.
pub trait Service: Send + Sync + 'static {
    fn service_id(&self) -> &str;

    fn responds_to(&self, method: &str) -> bool;

    /// Runs one method. The context is owned: implementations clone out of
    /// it freely and the returned future must not borrow `self`.
    fn invoke(&self, method: &str, ctx: CallContext) -> BoxFuture<'static, Result<(), Error>>;
}

/// A method handler: owned context in, boxed future out.
pub type MethodHandler =
    Arc<dyn Fn(CallContext) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// Table-driven [`Service`] built from closures.
pub struct ServiceAdapter {
    service_id: String,
    methods: HashMap<String, MethodHandler>,
}

impl ServiceAdapter {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            methods: HashMap::new(),
        }
    }

    pub fn with_method<H>(mut self, name: impl Into<String>, handler: H) -> Self
    where
        H: Fn(CallContext) -> BoxFuture<'static, Result<(), Error>> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Arc::new(handler));
        self
    }
}

impl Service for ServiceAdapter {
    fn service_id(&self) -> &str {
        &self.service_id
    }

    fn responds_to(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    fn invoke(&self, method: &str, ctx: CallContext) -> BoxFuture<'static, Result<(), Error>> {
        match self.methods.get(method) {
            Some(handler) => handler(ctx),
            None => Box::pin(async {
                Err(BadStatus::new(Status::Unimplemented, "Unimplemented").into())
            }),
        }
    }
}

/// Intercepts calls around method dispatch.
///
/// Interceptors run in registration order; the innermost `next` is the
/// method dispatch itself. An interceptor short-circuits by not calling
/// [`Next::run`].
pub trait Interceptor: Send + Sync + 'static {
    fn call(&self, ctx: CallContext, next: Next) -> BoxFuture<'static, Result<(), Error>>;
}

/// The remainder of the interceptor chain.
pub struct Next {
    interceptors: Arc<[Arc<dyn Interceptor>]>,
    index: usize,
    service: Arc<dyn Service>,
    method: String,
}

impl Next {
    pub(crate) fn new(
        interceptors: Arc<[Arc<dyn Interceptor>]>,
        service: Arc<dyn Service>,
        method: impl Into<String>,
    ) -> Next {
        Next {
            interceptors,
            index: 0,
            service,
            method: method.into(),
        }
    }

    /// Runs the rest of the chain, ending at the method dispatch.
    pub fn run(mut self, ctx: CallContext) -> BoxFuture<'static, Result<(), Error>> {
        if self.index < self.interceptors.len() {
            let interceptor = self.interceptors[self.index].clone();
            self.index += 1;
            interceptor.call(ctx, self)
        } else {
            let service = self.service;
            let method = self.method;
            Box::pin(async move { service.invoke(&method, ctx).await })
        }
    }
}
