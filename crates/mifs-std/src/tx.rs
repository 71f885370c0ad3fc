//! Compensating-action transactions.
//!
//! Multi-step operations over stores without a shared transaction register an undo step after
//! each completed step. If the operation fails, the undo steps run in reverse order.
use std::pin::Pin;
use std::sync::Arc;

use futures::Future;

use tokio::sync::Mutex;

type RollbackStep<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send>>;

pub struct TxState<E> {
    rb_stack: Mutex<Vec<RollbackStep<E>>>,
}

impl<E> TxState<E> {
    fn new() -> Self {
        Self {
            rb_stack: Mutex::new(Vec::new()),
        }
    }

    /// Record the undo action for a step that just completed.
    pub async fn complete(&self, step: RollbackStep<E>) {
        self.rb_stack.lock().await.push(step);
    }

    async fn rollback(&self) -> Result<(), E> {
        let steps = std::mem::take(&mut *self.rb_stack.lock().await);
        for step in steps.into_iter().rev() {
            step.await?;
        }
        Ok(())
    }
}

pub async fn try_rollback<F, Fut, Res, E>(func: F) -> Result<Res, E>
where
    F: FnOnce(Arc<TxState<E>>) -> Fut,
    Fut: Future<Output = Result<Res, E>>,
    E: std::fmt::Display,
{
    let state = Arc::new(TxState::new());
    match func(state.clone()).await {
        Ok(r) => Ok(r),
        Err(e) => {
            if let Err(rb_err) = state.rollback().await {
                tracing::warn!("error while rolling back '{e}': {rb_err}");
            }
            Err(e)
        }
    }
}
