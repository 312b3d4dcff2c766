use std::{
    future::Future,
    sync::{Arc, Mutex},
};

use futures::{stream::FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to install signal handler: {0}")]
    Ctrlc(#[from] ctrlc::Error),
}

/// The interrupt source used by production hosts. Completes on the first
/// SIGINT/SIGTERM. Tests substitute any future they like.
pub fn get_signal() -> Result<impl Future<Output = Option<()>>, Error> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        // A failed send means the run is already shutting down.
        tx.send(()).ok();
    })?;

    Ok(async move { rx.recv().await })
}

/// Alerts subscribers when a signal source completes or `close` is called.
/// Created once at program start and passed explicitly, so tests can
/// substitute a fake source.
#[derive(Debug, Clone)]
pub struct SignalHandler {
    state: Arc<Mutex<HandlerState>>,
    close: mpsc::Sender<()>,
}

#[derive(Debug, Default)]
struct HandlerState {
    subscribers: Vec<oneshot::Sender<oneshot::Sender<()>>>,
    is_closing: bool,
}

impl HandlerState {
    fn add_subscriber(&mut self) -> Option<oneshot::Receiver<oneshot::Sender<()>>> {
        (!self.is_closing).then(|| {
            let (tx, rx) = oneshot::channel();
            self.subscribers.push(tx);
            rx
        })
    }
}

pub struct SignalSubscriber(oneshot::Receiver<oneshot::Sender<()>>);

/// Held by a subscriber while it reacts to the signal; the handler's
/// shutdown waits until every guard is dropped.
pub struct SubscriberGuard(#[allow(dead_code)] oneshot::Sender<()>);

impl SignalSubscriber {
    /// Resolves when the signal fires. The returned guard should be kept
    /// until the subscriber finishes its shutdown work.
    pub async fn listen(self) -> SubscriberGuard {
        let done_callback = self.0.await.expect("signal handler dropped without firing");
        SubscriberGuard(done_callback)
    }
}

impl SignalHandler {
    /// Watches `signal_source`; when it completes (or `close` is called)
    /// every subscriber is alerted, and the handler waits for their guards.
    pub fn new(signal_source: impl Future<Output = Option<()>> + Send + 'static) -> Self {
        let state = Arc::new(Mutex::new(HandlerState::default()));
        let worker_state = state.clone();
        let (close, mut rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            tokio::select! {
                // A signal, or the inability to ever receive one: either
                // way, start the shutdown.
                _ = signal_source => {},
                _ = rx.recv() => {}
            }

            let mut callbacks = {
                let mut state = worker_state.lock().expect("signal handler lock poisoned");
                // No new subscribers once shutdown begins.
                state.is_closing = true;
                state
                    .subscribers
                    .drain(..)
                    .filter_map(|callback| {
                        let (tx, rx) = oneshot::channel();
                        // A gone subscriber has nothing to wait for.
                        callback.send(tx).ok()?;
                        Some(rx)
                    })
                    .collect::<FuturesUnordered<_>>()
            };

            // Dropped guards and explicit done signals both count.
            while let Some(_result) = callbacks.next().await {}
        });

        Self { state, close }
    }

    /// Registers a new subscriber. `None` once shutdown has begun.
    pub fn subscribe(&self) -> Option<SignalSubscriber> {
        self.state
            .lock()
            .expect("signal handler lock poisoned")
            .add_subscriber()
            .map(SignalSubscriber)
    }

    /// Triggers the shutdown flow without a signal.
    pub async fn close(self) {
        self.close.send(()).await.ok();
    }
}
