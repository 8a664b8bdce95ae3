//! Handlers and the name-keyed handler registry.
//!
//! This module provides:
//! - `Handler` trait for business logic bound to a message name
//! - `handler_fn` to use an async closure as a handler
//! - `HandlerRegistry` mapping names to handlers, itself a `Handler` that routes by name

use crate::error::{BrokerError, HandlerError};
use crate::message::Message;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

/// Processes messages registered under a name.
///
/// Shared state (counters, clients, ...) belongs in the implementing type and is
/// injected when the handler is constructed.
///
/// # Example
///
/// ```rust,ignore
/// struct CounterHandler {
///     count: Arc<AtomicI64>,
/// }
///
/// #[async_trait]
/// impl Handler for CounterHandler {
///     async fn handle(&self, _message: &Message) -> Result<(), HandlerError> {
///         self.count.fetch_add(1, Ordering::SeqCst);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handle one message. `Err` triggers the retry policy.
    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        (**self).handle(message).await
    }
}

/// Handler backed by an async closure. Built with [`handler_fn`].
#[derive(Clone)]
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap an async closure taking an owned `Message` as a [`Handler`].
///
/// ```rust,ignore
/// broker.register("print", handler_fn(|msg: Message| async move {
///     println!("{}", msg.decode::<String>()?);
///     Ok(())
/// }))?;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        (self.f)(message.clone()).await
    }
}

/// Name → handler table.
///
/// Lookups take a read lock and may run concurrently with each other and with
/// late registrations. Registering a name twice is rejected.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Fails with `DuplicateHandler` if the name is taken.
    pub fn register(
        &self,
        name: impl Into<String>,
        handler: impl Handler,
    ) -> Result<(), BrokerError> {
        let name = name.into();
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);

        if handlers.contains_key(&name) {
            return Err(BrokerError::DuplicateHandler(name));
        }

        handlers.insert(name, Arc::new(handler));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Route a message to its handler.
    ///
    /// The lock is released before the handler runs.
    pub async fn dispatch(&self, message: &Message) -> Result<(), HandlerError> {
        let handler = self
            .get(&message.name)
            .ok_or_else(|| HandlerError::NotFound(message.name.clone()))?;

        handler.handle(message).await
    }
}

#[async_trait]
impl Handler for HandlerRegistry {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        self.dispatch(message).await
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("names", &self.names())
            .finish()
    }
}
