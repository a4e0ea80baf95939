//! Request lifecycle: delivery guarantees, cancellation, repeats, chaining
//! and decorators

mod common;

use common::{local, service, settle};
use http::{HeaderValue, Method, StatusCode};
use reposo::{
    Entity, Request, RequestChainAction, RequestCompletionHandler, RequestDelegate, RequestError,
    RequestState, ResponseInfo,
};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

fn counter() -> Rc<Cell<usize>> {
    Rc::new(Cell::new(0))
}

fn bump(count: &Rc<Cell<usize>>) -> impl Fn() + 'static {
    let count = count.clone();
    move || count.set(count.get() + 1)
}

#[tokio::test(start_paused = true)]
async fn test_callbacks_fire_exactly_once() {
    local(async {
        let (service, transport) = service();
        let resource = service.resource("/items");
        let before = counter();
        let after = counter();

        let request = resource.request(Method::GET);
        let hit = bump(&before);
        request.on_completion(move |_| hit());

        transport.respond(0, 200, "text/plain", "ok");
        request.outcome().await;
        assert_eq!(before.get(), 1);

        let hit = bump(&after);
        request.on_completion(move |_| hit());
        assert_eq!(after.get(), 0, "late hooks never run synchronously");
        settle().await;
        assert_eq!(after.get(), 1);
        assert_eq!(before.get(), 1);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_beats_late_success() {
    local(async {
        let (service, transport) = service();
        let resource = service.resource("/items");
        let outcomes = Rc::new(RefCell::new(Vec::new()));

        let request = resource.request(Method::GET);
        let seen = outcomes.clone();
        request.on_completion(move |info| seen.borrow_mut().push(info.is_cancellation()));
        let successes = counter();
        let hit = bump(&successes);
        request.on_success(move |_| hit());

        request.cancel();
        assert_eq!(request.state(), RequestState::Completed);
        assert!(transport.was_cancelled(0));

        transport.respond(0, 200, "text/plain", "too late");
        settle().await;

        assert_eq!(*outcomes.borrow(), vec![true]);
        assert_eq!(successes.get(), 0);
        assert!(request.response().unwrap().is_cancellation());

        request.cancel();
        assert_eq!(outcomes.borrow().len(), 1);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_outcome_hooks_route_by_result() {
    local(async {
        let (service, transport) = service();
        let resource = service.resource("/items");
        let success = counter();
        let new_data = counter();
        let not_modified = counter();
        let failure = counter();

        let request = resource.request(Method::GET);
        let (s, n, m, f) = (bump(&success), bump(&new_data), bump(&not_modified), bump(&failure));
        request
            .on_success(move |_| s())
            .on_new_data(move |_| n())
            .on_not_modified(move || m())
            .on_failure(move |_| f());
        transport.respond(0, 200, "text/plain", "ok");
        request.outcome().await;
        assert_eq!((success.get(), new_data.get(), not_modified.get(), failure.get()), (1, 1, 0, 0));

        let request = resource.request(Method::GET);
        let status = Rc::new(Cell::new(None));
        let s = status.clone();
        request.on_failure(move |error: &RequestError| s.set(error.http_status));
        transport.respond(1, 500, "text/plain", "boom");
        request.outcome().await;
        assert_eq!(status.get(), Some(StatusCode::INTERNAL_SERVER_ERROR));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_repeated_reapplies_configuration_but_not_decorators() {
    local(async {
        let (service, transport) = service();
        let token = Rc::new(RefCell::new("first".to_string()));
        let decorations = counter();

        let t = token.clone();
        let d = decorations.clone();
        service.configure("**", "auth", move |config| {
            let value = HeaderValue::from_str(&t.borrow()).unwrap();
            config.set_header("x-token", value);
            let d = d.clone();
            config.decorate_requests(move |_, request| {
                d.set(d.get() + 1);
                request
            });
        });

        let resource = service.resource("/secure");
        let request = resource.request(Method::GET);
        assert_eq!(decorations.get(), 1);
        assert_eq!(transport.request(0).headers["x-token"], "first");

        *token.borrow_mut() = "second".to_string();
        service.invalidate_configuration();

        let again = request.repeated();
        assert_eq!(again.state(), RequestState::NotStarted);
        assert_eq!(transport.request_count(), 1);
        again.start();
        assert_eq!(transport.request_count(), 2);
        assert_eq!(transport.request(1).headers["x-token"], "second");
        assert_eq!(decorations.get(), 1);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_mutations_rerun_on_repeat() {
    local(async {
        let (service, transport) = service();
        let attempt = counter();
        let a = attempt.clone();
        service.configure("**", "attempt header", move |config| {
            let a = a.clone();
            config.mutate_requests(move |request| {
                a.set(a.get() + 1);
                let value = HeaderValue::from_str(&a.get().to_string()).unwrap();
                request.headers.insert("x-attempt", value);
            });
        });

        let resource = service.resource("/items");
        let request = resource.request(Method::GET);
        request.repeated().start();
        assert_eq!(transport.request(0).headers["x-attempt"], "1");
        assert_eq!(transport.request(1).headers["x-attempt"], "2");
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_headers_follow_requested_method() {
    local(async {
        let (service, transport) = service();
        let post_decorations = counter();

        service.configure_methods("**", &[Method::GET], "get headers", |config| {
            config.set_header("x-config", HeaderValue::from_static("get"));
        });
        let d = post_decorations.clone();
        service.configure_methods("**", &[Method::POST], "post config", move |config| {
            config.set_header("x-config", HeaderValue::from_static("post"));
            let d = d.clone();
            config.decorate_requests(move |_, request| {
                d.set(d.get() + 1);
                request
            });
        });

        let resource = service.resource("/items");
        resource.request_mutating(Method::GET, |request| request.method = Method::POST);

        let sent = transport.request(0);
        assert_eq!(sent.method, Method::POST);
        assert_eq!(sent.headers["x-config"], "get");
        assert_eq!(post_decorations.get(), 1);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_chain_passes_control_on_failure() {
    local(async {
        let (service, transport) = service();
        let decisions = counter();
        let resource = service.resource("/items");

        let base = resource.request(Method::GET);
        let retry_from = base.clone();
        let decided = bump(&decisions);
        let chain = base.chained(move |info| {
            decided();
            match &info.response {
                Err(error) if error.http_status == Some(StatusCode::UNAUTHORIZED) => {
                    RequestChainAction::PassTo(retry_from.repeated())
                }
                _ => RequestChainAction::UseThisResponse,
            }
        });
        assert_eq!(chain.state(), RequestState::InProgress);

        transport.respond(0, 401, "text/plain", "who are you");
        settle().await;
        assert_eq!(transport.request_count(), 2);
        assert!(!chain.is_completed());

        transport.respond(1, 200, "text/plain", "welcome");
        let info = chain.outcome().await;
        assert_eq!(
            info.response.unwrap().content().as_text(),
            Some("welcome")
        );
        assert_eq!(decisions.get(), 1);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_chain_substitutes_response() {
    local(async {
        let (service, transport) = service();
        let resource = service.resource("/items");

        let chain = resource.request(Method::GET).chained(|info| {
            if info.response.is_err() {
                RequestChainAction::UseResponse(ResponseInfo::new(Ok(Entity::new(
                    "fallback",
                    "text/plain",
                ))))
            } else {
                RequestChainAction::UseThisResponse
            }
        });

        transport.respond(0, 503, "text/plain", "down");
        let info = chain.outcome().await;
        assert_eq!(info.response.unwrap().content().as_text(), Some("fallback"));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_cancelling_chain_cancels_active_request() {
    local(async {
        let (service, transport) = service();
        let decisions = counter();
        let resource = service.resource("/items");

        let follow_up = resource.clone();
        let decided = bump(&decisions);
        let chain = resource.request(Method::GET).chained(move |_| {
            decided();
            RequestChainAction::PassTo(follow_up.request(Method::POST))
        });

        transport.respond(0, 200, "text/plain", "first");
        settle().await;
        assert_eq!(decisions.get(), 1);

        chain.cancel();
        assert!(chain.response().unwrap().is_cancellation());
        assert!(transport.was_cancelled(1));

        transport.respond(1, 200, "text/plain", "second");
        settle().await;
        assert_eq!(decisions.get(), 1);
        assert!(chain.response().unwrap().is_cancellation());
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_decorator_retry_with_repeated() {
    local(async {
        let (service, transport) = service();
        let decorations = counter();
        let d = decorations.clone();
        service.configure("**", "retry on 401", move |config| {
            let d = d.clone();
            config.decorate_requests(move |_, request| {
                d.set(d.get() + 1);
                let original = request.clone();
                request.chained(move |info| match &info.response {
                    Err(error) if error.http_status == Some(StatusCode::UNAUTHORIZED) => {
                        RequestChainAction::PassTo(original.repeated())
                    }
                    _ => RequestChainAction::UseThisResponse,
                })
            });
        });

        let resource = service.resource("/secure");
        let load = resource.load();
        transport.respond(0, 401, "text/plain", "expired");
        settle().await;
        transport.respond(1, 200, "text/plain", "secret");
        load.outcome().await;

        assert_eq!(decorations.get(), 1);
        assert_eq!(transport.request_count(), 2);
        assert_eq!(resource.text().as_deref(), Some("secret"));
        assert!(resource.latest_error().is_none());
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_hard_wired_requests() {
    local(async {
        let ok = Request::with_response(ResponseInfo::new(Ok(Entity::new("x", "text/plain"))));
        assert!(ok.is_completed());
        assert_eq!(ok.progress(), 1.0);
        assert!(ok.outcome().await.response.is_ok());

        let failed = Request::failed(RequestError::with_message("nope", None));
        let info = failed.outcome().await;
        assert_eq!(info.response.unwrap_err().user_message, "nope");

        let progress = Rc::new(RefCell::new(Vec::new()));
        let p = progress.clone();
        failed.on_progress(move |value| p.borrow_mut().push(value));
        settle().await;
        assert_eq!(*progress.borrow(), vec![1.0]);
    })
    .await;
}

struct DelayedDelegate {
    starts: Rc<Cell<usize>>,
    delay: Duration,
}

impl RequestDelegate for DelayedDelegate {
    fn start_underlying_operation(&self, completion_handler: RequestCompletionHandler) {
        self.starts.set(self.starts.get() + 1);
        let delay = self.delay;
        tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            completion_handler
                .broadcast_response(ResponseInfo::new(Ok(Entity::new("done", "text/plain"))));
        });
    }

    fn cancel_underlying_operation(&self) {}

    fn repeated(&self) -> Rc<dyn RequestDelegate> {
        Rc::new(DelayedDelegate {
            starts: self.starts.clone(),
            delay: self.delay,
        })
    }

    fn request_description(&self) -> String {
        "delayed".to_string()
    }
}

#[tokio::test(start_paused = true)]
async fn test_custom_delegate() {
    local(async {
        let starts = counter();
        let request = Request::custom(DelayedDelegate {
            starts: starts.clone(),
            delay: Duration::from_millis(5),
        });
        assert_eq!(request.state(), RequestState::NotStarted);

        request.start();
        request.start();
        assert_eq!(starts.get(), 1);

        let info = request.outcome().await;
        assert_eq!(info.response.unwrap().content().as_text(), Some("done"));

        let again = request.repeated();
        again.start();
        again.outcome().await;
        assert_eq!(starts.get(), 2);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_custom_request_applied_with_load_using() {
    local(async {
        let (service, transport) = service();
        let resource = service.resource("/computed");
        let request = Request::custom(DelayedDelegate {
            starts: counter(),
            delay: Duration::from_millis(1),
        });
        request.start();

        resource.load_using(request.clone());
        assert!(resource.is_loading());
        request.outcome().await;

        assert_eq!(resource.text().as_deref(), Some("done"));
        assert!(!resource.is_loading());
        assert_eq!(transport.request_count(), 0);
    })
    .await;
}
