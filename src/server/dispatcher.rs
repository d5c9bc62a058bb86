//! Inbound dispatch
//!
//! The dispatcher turns broker deliveries and transport requests into handler
//! invocations. It resolves the route, picks a codec, decodes the payload,
//! runs the handler on its own task and settles the outcome: ack/nack for
//! events, a [`Response`] for requests.
//!
//! A handler that panics takes down only its own task. The panic is observed
//! through the `JoinHandle` and reported like any other handler failure.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::broker::{BrokerError, Event, EventHandler};
use crate::codec::{encode, Codec, Codecs, JsonCodec};
use crate::error::{Error, ErrorBody, HandlerError, LifecycleError, Result};
use crate::transport::{Request, Response};

use super::context::Context;
use super::options::ErrorHandler;
use super::routes::Routes;
use super::stats::DispatchStats;
use super::subscriber::Subscriber;

/// Routes inbound work to subscribers and handlers
pub struct Dispatcher {
    routes: Arc<Routes>,
    codecs: Codecs,
    service: String,
    token: CancellationToken,
    tracker: TaskTracker,
    stats: Arc<DispatchStats>,
    limit: Option<Arc<Semaphore>>,
    ordering: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Dispatcher {
    /// Create a dispatcher
    ///
    /// `max_concurrency` of zero means unbounded.
    pub fn new(
        routes: Arc<Routes>,
        codecs: Codecs,
        service: impl Into<String>,
        token: CancellationToken,
        tracker: TaskTracker,
        stats: Arc<DispatchStats>,
        max_concurrency: usize,
    ) -> Self {
        let limit = (max_concurrency > 0).then(|| Arc::new(Semaphore::new(max_concurrency)));

        Self {
            routes,
            codecs,
            service: service.into(),
            token,
            tracker,
            stats,
            limit,
            ordering: Mutex::new(HashMap::new()),
        }
    }

    /// Tracker owning every dispatch task
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Dispatch one broker delivery
    ///
    /// The event is always settled before this returns: acked on success
    /// (when the subscriber auto-acks), otherwise nacked or handed to the
    /// subscriber's error handler. The returned error only reports what
    /// happened.
    pub async fn dispatch_event(&self, event: Box<dyn Event>) -> Result<()> {
        self.dispatch_shared(Arc::from(event)).await
    }

    async fn dispatch_shared(&self, event: Arc<dyn Event>) -> Result<()> {
        self.stats.event_received();
        let topic = event.topic().to_string();

        if self.token.is_cancelled() {
            tracing::debug!(topic = %topic, "Server stopping, rejecting event");
            self.nack(event.as_ref()).await;
            return Err(LifecycleError::Stopped.into());
        }

        let table = self.routes.snapshot().await;
        let Some(subscriber) = table.subscriber(&topic).cloned() else {
            self.stats.event_unhandled();
            tracing::warn!(topic = %topic, "No subscriber for topic, nacking");
            self.nack(event.as_ref()).await;
            return Err(Error::NotFound(format!("no subscriber for topic '{}'", topic)));
        };
        drop(table);

        let _order = if subscriber.options().ordered {
            let lock = self.topic_lock(&topic).await;
            Some(lock.lock_owned().await)
        } else {
            None
        };
        let _permit = self.acquire().await;

        match self.invoke_subscriber(subscriber.as_ref(), &event).await {
            Ok(()) => {
                if subscriber.options().auto_ack {
                    match event.ack().await {
                        Ok(()) => self.stats.event_acked(),
                        Err(e) => tracing::warn!(topic = %topic, error = %e, "Ack failed"),
                    }
                }
                Ok(())
            }
            Err(err) => {
                self.stats.event_failed();
                tracing::warn!(topic = %topic, error = %err, "Subscriber failed");

                match &subscriber.options().error_handler {
                    Some(handler) => self.report(Arc::clone(handler), &event, err).await,
                    None => {
                        self.nack(event.as_ref()).await;
                        Err(err)
                    }
                }
            }
        }
    }

    /// Run the subscriber's error handler on its own task
    ///
    /// A panicking error handler leaves the event unsettled, so it is nacked.
    async fn report(
        &self,
        handler: Arc<dyn ErrorHandler>,
        event: &Arc<dyn Event>,
        err: Error,
    ) -> Result<()> {
        let shared = Arc::clone(event);
        let task = tokio::spawn(async move {
            handler.handle_error(shared.as_ref(), &err).await;
            err
        });

        match task.await {
            Ok(err) => Err(err),
            Err(e) => {
                if e.is_panic() {
                    self.stats.panicked();
                }
                tracing::error!(topic = %event.topic(), "Error handler panicked, nacking");
                self.nack(event.as_ref()).await;
                Err(HandlerError::internal("error handler panicked").into())
            }
        }
    }

    /// Dispatch one transport request
    ///
    /// Never fails: every error is turned into a response carrying an
    /// [`ErrorBody`].
    pub async fn dispatch_request(&self, request: Request) -> Response {
        let codec = match self.codecs.resolve(Some(request.content_type.as_str())) {
            Ok(codec) => codec,
            Err(e) => {
                let response = self.error_response(&self.codecs.default_codec(), &e.into());
                self.stats.request_done(false);
                return response;
            }
        };

        let response = if self.token.is_cancelled() {
            self.error_response(&codec, &LifecycleError::Stopped.into())
        } else {
            let _permit = self.acquire().await;
            match self.serve(&request, &codec).await {
                Ok(body) => Response::ok(codec.content_type(), body),
                Err(err) => {
                    match &err {
                        Error::NotFound(_) => {
                            tracing::warn!(endpoint = %request.endpoint, "No handler for endpoint")
                        }
                        other => {
                            tracing::debug!(
                                endpoint = %request.endpoint,
                                error = %other,
                                "Request failed"
                            )
                        }
                    }
                    self.error_response(&codec, &err)
                }
            }
        };

        self.stats.request_done(response.is_ok());
        response
    }

    async fn serve(&self, request: &Request, codec: &Arc<dyn Codec>) -> Result<Bytes> {
        let (handler_name, method_name) = request.target().ok_or_else(|| {
            HandlerError::bad_request(format!("malformed endpoint '{}'", request.endpoint))
        })?;

        let table = self.routes.snapshot().await;
        let handler = table
            .handler(handler_name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("handler '{}'", handler_name)))?;
        drop(table);

        let method = handler
            .method(method_name)
            .ok_or_else(|| Error::NotFound(format!("endpoint '{}'", request.endpoint)))?;

        let mut ctx = Context::new(
            self.service.clone(),
            request.endpoint.clone(),
            request.header.clone(),
            self.token.child_token(),
        );
        if let Some(timeout) = request.timeout {
            ctx = ctx.with_timeout(timeout);
        }

        let codec = Arc::clone(codec);
        let body = request.body.clone();
        self.isolate(
            async move {
                let payload = codec.unmarshal(&body)?;
                let value = method.call(ctx, payload).await?;
                Ok::<_, Error>(codec.marshal(&value)?)
            },
            request.timeout,
        )
        .await
    }

    async fn invoke_subscriber(
        &self,
        subscriber: &dyn Subscriber,
        event: &Arc<dyn Event>,
    ) -> Result<()> {
        let message = event.message();
        let codec = match &subscriber.options().codec {
            Some(codec) => Arc::clone(codec),
            None => self.codecs.resolve(message.content_type())?,
        };
        let ctx = Context::new(
            self.service.clone(),
            subscriber.topic(),
            message.header.clone(),
            self.token.child_token(),
        )
        .with_event(Arc::clone(event));

        let handler = subscriber.handler();
        let body = message.body.clone();
        self.isolate(
            async move {
                let payload = codec.unmarshal(&body)?;
                handler.handle(ctx, payload).await.map_err(Error::from)
            },
            None,
        )
        .await
    }

    /// Run decoding and handler code on its own task, optionally bounded by
    /// a deadline
    async fn isolate<T, F>(&self, fut: F, deadline: Option<Duration>) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let mut task = tokio::spawn(fut);

        let joined = match deadline {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    return Err(
                        HandlerError::timeout(format!("deadline of {:?} exceeded", limit)).into(),
                    );
                }
            },
            None => task.await,
        };

        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                self.stats.panicked();
                tracing::error!(service = %self.service, "Handler panicked");
                Err(HandlerError::internal("handler panicked").into())
            }
            Err(_) => Err(HandlerError::internal("handler cancelled").into()),
        }
    }

    /// Response for a request whose dispatch task died
    pub(crate) fn failure_response(&self) -> Response {
        let error = HandlerError::internal("request dispatch failed").into();
        self.error_response(&self.codecs.default_codec(), &error)
    }

    fn error_response(&self, codec: &Arc<dyn Codec>, error: &Error) -> Response {
        let body = ErrorBody::new(self.service.clone(), error);
        let status = error.status();

        match encode(codec.as_ref(), &body) {
            Ok(bytes) => Response::with_status(status, codec.content_type(), bytes),
            // Codecs that cannot carry structures fall back to JSON
            Err(_) => Response::with_status(
                status,
                JsonCodec::CONTENT_TYPE,
                serde_json::to_vec(&body).unwrap_or_default(),
            ),
        }
    }

    async fn nack(&self, event: &dyn Event) {
        match event.nack().await {
            Ok(()) => self.stats.event_nacked(),
            Err(e) => tracing::warn!(topic = %event.topic(), error = %e, "Nack failed"),
        }
    }

    async fn topic_lock(&self, topic: &str) -> Arc<Mutex<()>> {
        let mut ordering = self.ordering.lock().await;
        Arc::clone(ordering.entry(topic.to_string()).or_default())
    }

    async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        match &self.limit {
            Some(limit) => Arc::clone(limit).acquire_owned().await.ok(),
            None => None,
        }
    }
}

/// Adapter plugging the dispatcher into broker subscriptions
///
/// Each delivery runs on its own task owned by the server's tracker; the
/// broker's call returns once the event has been settled. If that task dies
/// the event is nacked here.
pub struct DispatchHandler {
    dispatcher: Arc<Dispatcher>,
}

impl DispatchHandler {
    /// Wrap a dispatcher
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl EventHandler for DispatchHandler {
    async fn handle(&self, event: Box<dyn Event>) -> std::result::Result<(), BrokerError> {
        let event: Arc<dyn Event> = Arc::from(event);
        let dispatcher = Arc::clone(&self.dispatcher);
        let shared = Arc::clone(&event);
        let task = self
            .dispatcher
            .tracker
            .spawn(async move { dispatcher.dispatch_shared(shared).await });

        // Failures were already settled by nack or the error handler
        if let Err(e) = task.await {
            if e.is_panic() {
                self.dispatcher.stats.panicked();
            }
            tracing::error!(topic = %event.topic(), error = %e, "Dispatch task failed, nacking");
            self.dispatcher.nack(event.as_ref()).await;
        }
        Ok(())
    }
}
