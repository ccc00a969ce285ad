//! Process-wide state store driven by a pure reducer.
//!
//! Actions are plain data queued on an unbounded channel. A single writer task
//! applies them in order and publishes each new state through a `watch`
//! channel, so readers never observe a partially applied action.

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

/// A pure `(state, action) -> state` function.
pub trait Reducer: Send + 'static {
  type State: Clone + Send + Sync + 'static;
  type Action: Send + 'static;

  fn reduce(&self, state: &Self::State, action: Self::Action) -> Self::State;
}

/// The writer task is gone (the runtime shut down).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("store writer has stopped")]
pub struct StoreClosed;

struct Envelope<A, S> {
  action: A,
  applied: Option<oneshot::Sender<S>>,
}

/// Handle to a running store. Clones dispatch to the same writer.
pub struct Store<R: Reducer> {
  actions: mpsc::UnboundedSender<Envelope<R::Action, R::State>>,
  state: watch::Receiver<R::State>,
}

impl<R: Reducer> Store<R> {
  /// Spawn the writer task with an initial state.
  ///
  /// Must be called from within a tokio runtime.
  pub fn new(reducer: R, initial: R::State) -> Self {
    let (actions, mut rx) = mpsc::unbounded_channel::<Envelope<R::Action, R::State>>();
    let (state_tx, state) = watch::channel(initial);

    tokio::spawn(async move {
      while let Some(envelope) = rx.recv().await {
        let next = reducer.reduce(&state_tx.borrow(), envelope.action);
        state_tx.send_replace(next.clone());
        if let Some(applied) = envelope.applied {
          // The dispatcher may have stopped waiting
          let _ = applied.send(next);
        }
      }
    });

    Self { actions, state }
  }

  /// Queue an action without waiting for it to be applied.
  pub fn dispatch(&self, action: R::Action) -> Result<(), StoreClosed> {
    self
      .actions
      .send(Envelope {
        action,
        applied: None,
      })
      .map_err(|_| StoreClosed)
  }

  /// Queue an action and wait for the state it produced.
  pub async fn send(&self, action: R::Action) -> Result<R::State, StoreClosed> {
    let (tx, rx) = oneshot::channel();
    self
      .actions
      .send(Envelope {
        action,
        applied: Some(tx),
      })
      .map_err(|_| StoreClosed)?;
    rx.await.map_err(|_| StoreClosed)
  }

  /// Snapshot of the latest published state.
  pub fn state(&self) -> R::State {
    self.state.borrow().clone()
  }

  /// Receive every published state.
  pub fn subscribe(&self) -> watch::Receiver<R::State> {
    self.state.clone()
  }
}

impl<R: Reducer> Clone for Store<R> {
  fn clone(&self) -> Self {
    Self {
      actions: self.actions.clone(),
      state: self.state.clone(),
    }
  }
}
