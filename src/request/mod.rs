//! Request lifecycle: start, cancel, repeat, progress and completion hooks
//!
//! A [`Request`] delivers exactly one terminal [`ResponseInfo`] to each of
//! its completion hooks, no matter when they are attached. Hooks attached
//! after completion run on a later turn of the local task set, never inside
//! the call that attached them.

mod chain;
mod hardwired;
pub(crate) mod network;
mod progress;

pub use chain::RequestChainAction;

use crate::entity::Entity;
use crate::error::RequestError;
use crate::pipeline::Response;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub(crate) use progress::RequestProgress;

/// Terminal outcome of a request
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    /// Success with an entity, or failure
    pub response: Response,
    /// False when the server confirmed existing data was still current
    pub is_new: bool,
}

impl ResponseInfo {
    /// A new response
    pub fn new(response: Response) -> Self {
        Self {
            response,
            is_new: true,
        }
    }

    /// Existing data, confirmed unchanged
    pub fn not_modified(entity: Entity) -> Self {
        Self {
            response: Ok(entity),
            is_new: false,
        }
    }

    /// A failure
    pub fn failure(error: RequestError) -> Self {
        Self::new(Err(error))
    }

    /// The outcome of a cancelled request
    pub fn cancellation() -> Self {
        Self::failure(RequestError::cancellation())
    }

    /// Whether this is the outcome of a cancelled request
    pub fn is_cancellation(&self) -> bool {
        matches!(&self.response, Err(error) if error.is_cancellation())
    }
}

/// Lifecycle state of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Created but not yet started
    NotStarted,
    /// Waiting for its outcome
    InProgress,
    /// Outcome delivered; terminal
    Completed,
}

/// The operation behind a [`Request`].
///
/// Implement this to back a request with arbitrary asynchronous work, then
/// wrap it with [`Request::custom`].
pub trait RequestDelegate {
    /// Begin the work, eventually passing its outcome to `completion_handler`
    fn start_underlying_operation(&self, completion_handler: RequestCompletionHandler);

    /// Best-effort abort of the work. The request has already reported
    /// cancellation when this is called.
    fn cancel_underlying_operation(&self);

    /// A fresh, unstarted delegate that performs the same work again
    fn repeated(&self) -> Rc<dyn RequestDelegate>;

    /// Short description for logs
    fn request_description(&self) -> String;

    /// Estimated progress in [0, 1]
    fn compute_progress(&self) -> f64 {
        0.0
    }

    /// How often progress hooks should be polled
    fn progress_reporting_interval(&self) -> Duration {
        Duration::from_millis(50)
    }
}

type CompletionCallback = Box<dyn FnOnce(&ResponseInfo)>;
type ProgressCallback = Rc<dyn Fn(f64)>;

struct RequestInner {
    delegate: Rc<dyn RequestDelegate>,
    state: Cell<RequestState>,
    response: RefCell<Option<ResponseInfo>>,
    completion_callbacks: RefCell<Vec<CompletionCallback>>,
    progress_callbacks: RefCell<Vec<ProgressCallback>>,
    progress: Cell<f64>,
    progress_task: RefCell<Option<JoinHandle<()>>>,
}

impl Drop for RequestInner {
    fn drop(&mut self) {
        if let Some(task) = self.progress_task.get_mut().take() {
            task.abort();
        }
    }
}

/// One operation, from creation to its single outcome.
///
/// Cloning yields another handle to the same request.
#[derive(Clone)]
pub struct Request(Rc<RequestInner>);

impl Request {
    /// Wrap a delegate in a new, unstarted request
    pub fn custom(delegate: impl RequestDelegate + 'static) -> Self {
        Self::from_delegate(Rc::new(delegate))
    }

    /// A request that has already failed with `error`
    pub fn failed(error: RequestError) -> Self {
        Self::with_response(ResponseInfo::failure(error))
    }

    /// A request that has already completed with `response`
    pub fn with_response(response: ResponseInfo) -> Self {
        let request = Self::from_delegate(Rc::new(hardwired::HardWiredRequestDelegate::new(
            response,
        )));
        request.start();
        request
    }

    pub(crate) fn from_delegate(delegate: Rc<dyn RequestDelegate>) -> Self {
        Self(Rc::new(RequestInner {
            delegate,
            state: Cell::new(RequestState::NotStarted),
            response: RefCell::new(None),
            completion_callbacks: RefCell::new(Vec::new()),
            progress_callbacks: RefCell::new(Vec::new()),
            progress: Cell::new(0.0),
            progress_task: RefCell::new(None),
        }))
    }

    /// Begin the operation. Starting twice has no effect.
    pub fn start(&self) -> &Self {
        if self.state() != RequestState::NotStarted {
            tracing::debug!("Ignoring start() on {:?}: already started", self);
            return self;
        }

        tracing::debug!("Starting {:?}", self);
        self.0.state.set(RequestState::InProgress);
        self.0
            .delegate
            .start_underlying_operation(RequestCompletionHandler {
                request: self.clone(),
            });
        self.start_progress_updates();
        self
    }

    /// Report cancellation now and ask the operation to stop.
    ///
    /// Any outcome the operation produces afterwards is discarded.
    pub fn cancel(&self) {
        if self.is_completed() {
            tracing::debug!("Ignoring cancel() on {:?}: already completed", self);
            return;
        }

        tracing::debug!("Cancelling {:?}", self);
        self.broadcast_response(ResponseInfo::cancellation());
        self.0.delegate.cancel_underlying_operation();
    }

    /// A new, unstarted request that performs the same operation again.
    ///
    /// Configuration and request mutations are re-applied; decorators are
    /// not.
    pub fn repeated(&self) -> Request {
        Self::from_delegate(self.0.delegate.repeated())
    }

    /// A request whose outcome is decided by `when_completed` once this one
    /// completes. The returned request is already started.
    ///
    /// Cancelling it cancels whichever request the chain is waiting on,
    /// without consulting `when_completed` again.
    pub fn chained(
        &self,
        when_completed: impl Fn(&ResponseInfo) -> RequestChainAction + 'static,
    ) -> Request {
        let chain = Self::from_delegate(Rc::new(chain::RequestChainDelegate::new(
            self.clone(),
            Rc::new(when_completed),
        )));
        chain.start();
        chain
    }

    /// Current lifecycle state
    pub fn state(&self) -> RequestState {
        self.0.state.get()
    }

    /// Whether the outcome has been delivered
    pub fn is_completed(&self) -> bool {
        self.state() == RequestState::Completed
    }

    /// Estimated progress in [0, 1]; exactly 1 once completed
    pub fn progress(&self) -> f64 {
        if self.state() == RequestState::InProgress {
            self.update_progress();
        }
        self.0.progress.get()
    }

    /// The outcome, once completed
    pub fn response(&self) -> Option<ResponseInfo> {
        self.0.response.borrow().clone()
    }

    /// Short description for logs
    pub fn description(&self) -> String {
        self.0.delegate.request_description()
    }

    /// Whether two handles refer to the same request
    pub fn ptr_eq(&self, other: &Request) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Call `callback` with the outcome
    pub fn on_completion(&self, callback: impl FnOnce(&ResponseInfo) + 'static) -> &Self {
        if self.is_completed() {
            let request = self.clone();
            tokio::task::spawn_local(async move {
                if let Some(info) = request.response() {
                    callback(&info);
                }
            });
        } else {
            self.0
                .completion_callbacks
                .borrow_mut()
                .push(Box::new(callback));
        }
        self
    }

    /// Call `callback` if the request succeeds, with new or unchanged data
    pub fn on_success(&self, callback: impl FnOnce(&Entity) + 'static) -> &Self {
        self.on_completion(move |info| {
            if let Ok(entity) = &info.response {
                callback(entity);
            }
        })
    }

    /// Call `callback` if the request succeeds with new data
    pub fn on_new_data(&self, callback: impl FnOnce(&Entity) + 'static) -> &Self {
        self.on_completion(move |info| {
            if let (Ok(entity), true) = (&info.response, info.is_new) {
                callback(entity);
            }
        })
    }

    /// Call `callback` if the server reports the data unchanged
    pub fn on_not_modified(&self, callback: impl FnOnce() + 'static) -> &Self {
        self.on_completion(move |info| {
            if info.response.is_ok() && !info.is_new {
                callback();
            }
        })
    }

    /// Call `callback` if the request fails, including by cancellation
    pub fn on_failure(&self, callback: impl FnOnce(&RequestError) + 'static) -> &Self {
        self.on_completion(move |info| {
            if let Err(error) = &info.response {
                callback(error);
            }
        })
    }

    /// Call `callback` periodically with estimated progress, and with 1 on
    /// completion
    pub fn on_progress(&self, callback: impl Fn(f64) + 'static) -> &Self {
        if self.is_completed() {
            tokio::task::spawn_local(async move { callback(1.0) });
            return self;
        }
        self.0
            .progress_callbacks
            .borrow_mut()
            .push(Rc::new(callback));
        self.start_progress_updates();
        self
    }

    /// Wait for the outcome
    pub fn outcome(&self) -> impl Future<Output = ResponseInfo> + use<> {
        let (tx, rx) = oneshot::channel();
        self.on_completion(move |info| {
            let _ = tx.send(info.clone());
        });
        async move {
            // a request dropped before completing never reports; treat as cancelled
            rx.await.unwrap_or_else(|_| ResponseInfo::cancellation())
        }
    }

    fn start_progress_updates(&self) {
        if self.state() != RequestState::InProgress
            || self.0.progress_callbacks.borrow().is_empty()
            || self.0.progress_task.borrow().is_some()
        {
            return;
        }

        let interval = self.0.delegate.progress_reporting_interval();
        let weak: Weak<RequestInner> = Rc::downgrade(&self.0);
        let task = tokio::task::spawn_local(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let request = Request(inner);
                if request.is_completed() {
                    break;
                }
                request.update_progress();
            }
        });
        *self.0.progress_task.borrow_mut() = Some(task);
    }

    fn update_progress(&self) {
        let computed = self.0.delegate.compute_progress().clamp(0.0, 1.0);
        self.set_progress(computed);
    }

    fn set_progress(&self, progress: f64) {
        let previous = self.0.progress.get();
        if progress <= previous {
            return;
        }
        self.0.progress.set(progress);

        let callbacks = self.0.progress_callbacks.borrow().clone();
        for callback in callbacks {
            callback(progress);
        }
    }

    fn broadcast_response(&self, info: ResponseInfo) {
        if self.is_completed() {
            tracing::debug!(
                "Ignoring duplicate response for {:?}: {:?}",
                self,
                info.response.as_ref().map(|_| ())
            );
            return;
        }

        tracing::debug!(
            "{:?} completed: {}",
            self,
            match &info.response {
                Ok(_) if info.is_new => "new data".to_string(),
                Ok(_) => "not modified".to_string(),
                Err(error) => error.user_message.clone(),
            }
        );

        self.0.state.set(RequestState::Completed);
        *self.0.response.borrow_mut() = Some(info.clone());
        if let Some(task) = self.0.progress_task.borrow_mut().take() {
            task.abort();
        }

        self.set_progress(1.0);
        self.0.progress_callbacks.borrow_mut().clear();

        let callbacks = std::mem::take(&mut *self.0.completion_callbacks.borrow_mut());
        for callback in callbacks {
            callback(&info);
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Request({}, {:?})", self.description(), self.state())
    }
}

/// Handle through which a [`RequestDelegate`] reports its outcome
#[derive(Clone)]
pub struct RequestCompletionHandler {
    request: Request,
}

impl RequestCompletionHandler {
    /// Deliver the outcome. Ignored if the request already completed.
    pub fn broadcast_response(&self, info: ResponseInfo) {
        self.request.broadcast_response(info);
    }

    /// Whether an outcome delivered now would be discarded.
    ///
    /// Delegates check this before doing expensive work on a response.
    pub fn will_ignore(&self, info: &ResponseInfo) -> bool {
        if !self.request.is_completed() {
            return false;
        }
        if !info.is_cancellation() {
            tracing::debug!(
                "Received response for {:?}, but it was already completed",
                self.request
            );
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ManualDelegate {
        handler: Rc<RefCell<Option<RequestCompletionHandler>>>,
        cancelled: Rc<Cell<bool>>,
    }

    impl RequestDelegate for ManualDelegate {
        fn start_underlying_operation(&self, completion_handler: RequestCompletionHandler) {
            *self.handler.borrow_mut() = Some(completion_handler);
        }

        fn cancel_underlying_operation(&self) {
            self.cancelled.set(true);
        }

        fn repeated(&self) -> Rc<dyn RequestDelegate> {
            Rc::new(ManualDelegate {
                handler: Rc::new(RefCell::new(None)),
                cancelled: Rc::new(Cell::new(false)),
            })
        }

        fn request_description(&self) -> String {
            "manual".to_string()
        }
    }

    fn manual() -> (Request, Rc<RefCell<Option<RequestCompletionHandler>>>, Rc<Cell<bool>>) {
        let handler = Rc::new(RefCell::new(None));
        let cancelled = Rc::new(Cell::new(false));
        let request = Request::custom(ManualDelegate {
            handler: handler.clone(),
            cancelled: cancelled.clone(),
        });
        (request, handler, cancelled)
    }

    fn success() -> ResponseInfo {
        ResponseInfo::new(Ok(Entity::new("ok", "text/plain")))
    }

    #[test]
    fn test_lifecycle_states() {
        let (request, handler, _) = manual();
        assert_eq!(request.state(), RequestState::NotStarted);
        request.start();
        assert_eq!(request.state(), RequestState::InProgress);

        let handler = handler.borrow().clone().unwrap();
        handler.broadcast_response(success());
        assert_eq!(request.state(), RequestState::Completed);
        assert_eq!(request.progress(), 1.0);
        assert!(request.response().unwrap().response.is_ok());
    }

    #[test]
    fn test_callbacks_fire_once() {
        let (request, handler, _) = manual();
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        request.start().on_completion(move |_| c.set(c.get() + 1));

        let handler = handler.borrow().clone().unwrap();
        handler.broadcast_response(success());
        handler.broadcast_response(success());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_cancel_wins_over_late_response() {
        let (request, handler, cancelled) = manual();
        let outcome = Rc::new(RefCell::new(None));
        let o = outcome.clone();
        request.start().on_completion(move |info| {
            *o.borrow_mut() = Some(info.is_cancellation());
        });

        request.cancel();
        assert!(cancelled.get());

        let handler = handler.borrow().clone().unwrap();
        assert!(handler.will_ignore(&success()));
        handler.broadcast_response(success());
        assert_eq!(*outcome.borrow(), Some(true));
    }

    #[test]
    fn test_repeated_is_unstarted() {
        let (request, _, _) = manual();
        request.start();
        let again = request.repeated();
        assert_eq!(again.state(), RequestState::NotStarted);
        assert!(!again.ptr_eq(&request));
    }

    #[test]
    fn test_response_info_flags() {
        assert!(ResponseInfo::cancellation().is_cancellation());
        let entity = Entity::new("x", "text/plain");
        assert!(!ResponseInfo::not_modified(entity).is_new);
    }
}
