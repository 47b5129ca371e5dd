use std::fmt;

use appstats_statsd::metric;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::statsd::SystemGauges;

/// The messages accepted by a service.
///
/// This is usually an enum with one variant per operation. It is implemented for every type that
/// can be moved between tasks.
pub trait Interface: Send + 'static {}

impl<T: Send + 'static> Interface for T {}

/// An error when [sending](Addr::send) a message to a service fails.
///
/// This only happens once the service has stopped and dropped its [`Receiver`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendError;

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to send message to service")
    }
}

impl std::error::Error for SendError {}

/// An error returned by [`Addr::try_send`].
#[derive(Debug, PartialEq, Eq)]
pub enum TrySendError<I> {
    /// The inbox is at capacity. The message is handed back.
    Full(I),
    /// The service has stopped.
    Closed(I),
}

impl<I> fmt::Display for TrySendError<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => write!(f, "service inbox is full"),
            Self::Closed(_) => write!(f, "service has stopped"),
        }
    }
}

impl<I: fmt::Debug> std::error::Error for TrySendError<I> {}

/// The address of a [`Service`].
///
/// The address allows sending messages to the service as long as it is running. It can be freely
/// cloned. The inbox is bounded: [`send`](Self::send) waits for free capacity, which propagates
/// backpressure to the producer.
pub struct Addr<I: Interface> {
    tx: mpsc::Sender<I>,
}

impl<I: Interface> Clone for Addr<I> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<I: Interface> fmt::Debug for Addr<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Addr")
            .field("queued", &self.len())
            .field("capacity", &self.tx.max_capacity())
            .finish()
    }
}

impl<I: Interface> Addr<I> {
    /// Sends a message to the service, waiting while the inbox is full.
    pub async fn send(&self, message: I) -> Result<(), SendError> {
        self.tx.send(message).await.map_err(|_| SendError)
    }

    /// Sends a message to the service if there is capacity, without waiting.
    pub fn try_send(&self, message: I) -> Result<(), TrySendError<I>> {
        self.tx.try_send(message).map_err(|error| match error {
            mpsc::error::TrySendError::Full(message) => TrySendError::Full(message),
            mpsc::error::TrySendError::Closed(message) => TrySendError::Closed(message),
        })
    }

    /// Returns the number of messages currently queued in the inbox.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Returns `true` if no messages are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once the service has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Inbound channel for messages sent through an [`Addr`].
///
/// This is handed to [`Service::spawn_handler`] and drained by the service.
pub struct Receiver<I: Interface> {
    rx: mpsc::Receiver<I>,
    name: &'static str,
}

impl<I: Interface> Receiver<I> {
    /// Receives the next message, or `None` once all addresses have been dropped.
    pub async fn recv(&mut self) -> Option<I> {
        let message = self.rx.recv().await;
        metric!(
            gauge(SystemGauges::ServiceBackPressure) = self.rx.len() as u64,
            service = self.name
        );
        message
    }

    /// Receives a message if one is queued, without waiting.
    pub fn try_recv(&mut self) -> Option<I> {
        self.rx.try_recv().ok()
    }

    /// Stops accepting new messages. Already queued messages can still be received.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

impl<I: Interface> fmt::Debug for Receiver<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("name", &self.name)
            .field("queued", &self.rx.len())
            .finish()
    }
}

/// Creates a bounded channel for a service with the given name and capacity.
///
/// A capacity of `0` is raised to `1`.
pub fn channel<I: Interface>(name: &'static str, capacity: usize) -> (Addr<I>, Receiver<I>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (Addr { tx }, Receiver { rx, name })
}

/// A long running component that processes messages from a bounded inbox.
///
/// Services are much like actors: they receive messages from their inbox and handle them one by
/// one. A service usually also watches [`Controller::shutdown_handle`](crate::Controller) to stop.
///
/// # Example
///
/// ```
/// use appstats_system::{Receiver, Service};
/// use tokio::task::JoinHandle;
///
/// struct Echo;
///
/// impl Service for Echo {
///     type Interface = String;
///
///     fn spawn_handler(self, mut rx: Receiver<String>) -> JoinHandle<()> {
///         tokio::spawn(async move {
///             while let Some(line) = rx.recv().await {
///                 appstats_log::info!("echo: {line}");
///             }
///         })
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let addr = Echo.start(16);
/// addr.send("hello".to_owned()).await.unwrap();
/// # }
/// ```
pub trait Service: Sized {
    /// The messages this service accepts.
    type Interface: Interface;

    /// Spawns a task to handle messages from the inbox.
    ///
    /// The returned handle completes when the service has fully stopped.
    fn spawn_handler(self, rx: Receiver<Self::Interface>) -> JoinHandle<()>;

    /// Starts the service with an inbox of the given capacity and returns its address.
    fn start(self, capacity: usize) -> Addr<Self::Interface> {
        let (addr, rx) = channel(Self::name(), capacity);
        self.spawn_handler(rx);
        addr
    }

    /// Returns a unique name for this service implementation.
    fn name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Starts services and keeps track of their tasks so they can be awaited on shutdown.
#[derive(Debug, Default)]
pub struct ServiceRunner {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl ServiceRunner {
    /// Creates an empty runner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a service and records its task.
    pub fn start<S: Service>(&mut self, service: S, capacity: usize) -> Addr<S::Interface> {
        let (addr, rx) = channel(S::name(), capacity);
        self.handles.push((S::name(), service.spawn_handler(rx)));
        addr
    }

    /// Returns the number of started services.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns `true` if no services were started.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for all started services to finish.
    ///
    /// A service that panicked is logged and does not prevent the others from being awaited.
    pub async fn join(self) {
        let (names, handles): (Vec<_>, Vec<_>) = self.handles.into_iter().unzip();

        for (name, result) in names.into_iter().zip(join_all(handles).await) {
            if let Err(error) = result {
                appstats_log::error!(
                    error = &error as &dyn std::error::Error,
                    service = name,
                    "service terminated abnormally"
                );
            }
        }
    }
}
