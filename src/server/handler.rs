//! Request/response handlers
//!
//! A handler is a named service object exposing a static table of methods.
//! Methods are registered once through [`RpcHandlerBuilder`]; the endpoint list
//! is computed from that table at build time, so nothing is discovered at
//! runtime.
//!
//! # Example
//!
//! ```ignore
//! use micro_rs::server::RpcHandler;
//!
//! let greeter = RpcHandler::builder("Greeter")
//!     .method("Hello", |_ctx, req: HelloRequest| async move {
//!         Ok(HelloResponse { message: format!("Hello, {}", req.name) })
//!     })
//!     .build();
//!
//! server.handle(greeter).await?;
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::HandlerError;
use crate::registry::{Endpoint, Schema};

use super::context::Context;
use super::options::HandlerOptions;

/// One invokable method
#[async_trait]
pub trait Method: Send + Sync {
    /// Invoke with a decoded request, returning the response value
    async fn call(&self, ctx: Context, payload: Value) -> Result<Value, HandlerError>;

    /// Request shape hint
    fn request_schema(&self) -> Option<Schema> {
        None
    }

    /// Response shape hint
    fn response_schema(&self) -> Option<Schema> {
        None
    }
}

/// Wrapper that converts between `Value` and typed request/response
pub struct TypedMethod<F, Req, Resp, Fut> {
    handler: F,
    _phantom: PhantomData<fn(Req) -> (Resp, Fut)>,
}

impl<F, Req, Resp, Fut> TypedMethod<F, Req, Resp, Fut>
where
    F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
{
    /// Wrap a typed async closure
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Req, Resp, Fut> Method for TypedMethod<F, Req, Resp, Fut>
where
    F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
{
    async fn call(&self, ctx: Context, payload: Value) -> Result<Value, HandlerError> {
        let request: Req = serde_json::from_value(payload)
            .map_err(|e| HandlerError::bad_request(format!("invalid request: {e}")))?;
        let response = (self.handler)(ctx, request).await?;
        serde_json::to_value(response)
            .map_err(|e| HandlerError::internal(format!("invalid response: {e}")))
    }

    fn request_schema(&self) -> Option<Schema> {
        Some(Schema::of::<Req>())
    }

    fn response_schema(&self) -> Option<Schema> {
        Some(Schema::of::<Resp>())
    }
}

/// Capabilities every handler exposes to the server
pub trait Handler: Send + Sync {
    /// Handler (service object) name
    fn name(&self) -> &str;

    /// Endpoints published to the registry, one per method
    fn endpoints(&self) -> &[Endpoint];

    /// Options fixed at construction
    fn options(&self) -> &HandlerOptions;

    /// Resolve a method by exact, case-sensitive name
    fn method(&self, name: &str) -> Option<Arc<dyn Method>>;
}

/// Handler backed by a static method table
pub struct RpcHandler {
    name: String,
    methods: BTreeMap<String, Arc<dyn Method>>,
    endpoints: Vec<Endpoint>,
    options: HandlerOptions,
}

impl RpcHandler {
    /// Start building a handler
    pub fn builder(name: impl Into<String>) -> RpcHandlerBuilder {
        RpcHandlerBuilder {
            name: name.into(),
            methods: BTreeMap::new(),
            options: HandlerOptions::default(),
        }
    }

    /// Registered method names, sorted
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

impl Handler for RpcHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    fn options(&self) -> &HandlerOptions {
        &self.options
    }

    fn method(&self, name: &str) -> Option<Arc<dyn Method>> {
        self.methods.get(name).cloned()
    }
}

/// Builder for [`RpcHandler`]
pub struct RpcHandlerBuilder {
    name: String,
    methods: BTreeMap<String, Arc<dyn Method>>,
    options: HandlerOptions,
}

impl RpcHandlerBuilder {
    /// Register a typed method
    ///
    /// Registering the same name twice keeps the last one.
    pub fn method<F, Req, Resp, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    {
        self.raw_method(name, TypedMethod::new(handler))
    }

    /// Register any [`Method`] implementation
    pub fn raw_method(mut self, name: impl Into<String>, method: impl Method + 'static) -> Self {
        self.methods.insert(name.into(), Arc::new(method));
        self
    }

    /// Set the handler options
    pub fn options(mut self, options: HandlerOptions) -> Self {
        self.options = options;
        self
    }

    /// Freeze the method table and compute endpoints
    pub fn build(self) -> RpcHandler {
        let endpoints = self
            .methods
            .iter()
            .map(|(method_name, method)| {
                let mut endpoint = Endpoint::new(format!("{}.{}", self.name, method_name));
                endpoint.request = method.request_schema();
                endpoint.response = method.response_schema();
                endpoint.metadata = self.options.metadata.clone();
                endpoint
            })
            .collect();

        RpcHandler {
            name: self.name,
            methods: self.methods,
            endpoints,
            options: self.options,
        }
    }
}
