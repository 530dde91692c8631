//! Control API over HTTP/1.
//!
//! Single mode exposes one experiment:
//!
//! | route               | body                  | answer                       |
//! |---------------------|-----------------------|------------------------------|
//! | `GET /`             |                       | liveness text                |
//! | `GET /status`       |                       | `{"status", "code"}`         |
//! | `POST /start`       | [`ExperimentRequest`] | status                       |
//! | `GET /stop`         |                       | status                       |
//! | `POST /pulse`       | [`PulseParameters`]   | waveform                     |
//! | `GET /last_updated` |                       | UNIX seconds or `null`       |
//! | `GET /elapsed`      |                       | seconds or `null`            |
//!
//! Multi mode replaces the experiment routes with `GET /jigs` and
//! `/jigs/{name}/{start,stop,status,pulse}`.

use crate::error::DaqError;
use crate::experiment::{Controller, ExperimentRequest, Status};
use crate::instrument::PulseParameters;
use crate::scheduler::{JigRequest, SchedulerHandle};
use hyper::service::{make_service_fn, service_fn};
use hyper::{header, Body, Method, Request, Response, Server, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the API drives.
#[derive(Clone)]
pub enum Backend {
    /// One experiment owns the rig.
    Single(Arc<Controller>),
    /// Jigs time-share the rig.
    Multi(SchedulerHandle),
}

#[derive(Serialize)]
struct StatusBody {
    status: Status,
    code: u8,
}

impl From<Status> for StatusBody {
    fn from(status: Status) -> Self {
        Self {
            status,
            code: status.code(),
        }
    }
}

/// Serve `backend` on `addr` until `shutdown` resolves.
pub async fn serve<F>(backend: Backend, addr: SocketAddr, shutdown: F) -> Result<(), DaqError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let make_svc = make_service_fn(move |_conn| {
        let backend = backend.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let backend = backend.clone();
                async move { Ok::<_, Infallible>(route(&backend, req).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr).map_err(DaqError::Server)?.serve(make_svc);
    info!(addr = %server.local_addr(), "Control API listening");
    server
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(DaqError::Server)
}

/// Dispatch one request.
pub async fn route(backend: &Backend, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().trim_end_matches('/').to_string();
    debug!(%method, path = %path, "Control request");

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match backend {
        Backend::Single(controller) => single(controller, &method, &segments, req).await,
        Backend::Multi(scheduler) => multi(scheduler, &method, &segments, req).await,
    }
}

async fn single(
    controller: &Controller,
    method: &Method,
    segments: &[&str],
    req: Request<Body>,
) -> Response<Body> {
    match (method, segments) {
        (&Method::GET, []) => text(
            StatusCode::OK,
            format!("Controller is up. Status: {}", controller.status()),
        ),
        (&Method::GET, ["status"]) => json_response(StatusCode::OK, &StatusBody::from(controller.status())),
        (&Method::POST, ["start"]) => {
            let request: ExperimentRequest = match read_json(req).await {
                Ok(request) => request,
                Err(response) => return response,
            };
            match controller.start(request.settings, request.params).await {
                Ok(status) => json_response(StatusCode::OK, &StatusBody::from(status)),
                Err(e) => error_response(&e),
            }
        }
        (&Method::GET, ["stop"]) => json_response(StatusCode::OK, &StatusBody::from(controller.stop())),
        (&Method::POST, ["pulse"]) => {
            let params: PulseParameters = match read_json(req).await {
                Ok(params) => params,
                Err(response) => return response,
            };
            match controller.pulse(&params).await {
                Ok(waveform) => json_response(StatusCode::OK, &waveform),
                Err(e) => error_response(&e),
            }
        }
        (&Method::GET, ["last_updated"]) => json_response(StatusCode::OK, &controller.last_updated()),
        (&Method::GET, ["elapsed"]) => json_response(
            StatusCode::OK,
            &controller.elapsed_time().map(|d| d.as_secs_f64()),
        ),
        _ => not_found(),
    }
}

async fn multi(
    scheduler: &SchedulerHandle,
    method: &Method,
    segments: &[&str],
    req: Request<Body>,
) -> Response<Body> {
    match (method, segments) {
        (&Method::GET, []) => text(
            StatusCode::OK,
            format!("Controller is up. Jigs: {}", scheduler.jig_names().join(", ")),
        ),
        (&Method::GET, ["jigs"]) | (&Method::GET, ["status"]) => {
            json_response(StatusCode::OK, &scheduler.snapshots())
        }
        (&Method::POST, ["jigs", name, "start"]) => {
            let request: JigRequest = match read_json(req).await {
                Ok(request) => request,
                Err(response) => return response,
            };
            match scheduler.start_jig(name, request).await {
                Ok(status) => json_response(StatusCode::OK, &StatusBody::from(status)),
                Err(e) => error_response(&e),
            }
        }
        (&Method::GET, ["jigs", name, "stop"]) => match scheduler.stop_jig(name) {
            Ok(status) => json_response(StatusCode::OK, &StatusBody::from(status)),
            Err(e) => error_response(&e),
        },
        (&Method::GET, ["jigs", name, "status"]) => match scheduler.snapshot(name) {
            Ok(snapshot) => json_response(StatusCode::OK, &snapshot),
            Err(e) => error_response(&e),
        },
        (&Method::POST, ["jigs", name, "pulse"]) => {
            let params: PulseParameters = match read_json(req).await {
                Ok(params) => params,
                Err(response) => return response,
            };
            match scheduler.pulse_jig(name, params).await {
                Ok(waveform) => json_response(StatusCode::OK, &waveform),
                Err(e) => error_response(&e),
            }
        }
        _ => not_found(),
    }
}

async fn read_json<T: DeserializeOwned>(req: Request<Body>) -> Result<T, Response<Body>> {
    let body = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| bad_request(format!("could not read body: {}", e)))?;
    serde_json::from_slice(&body).map_err(|e| bad_request(format!("malformed body: {}", e)))
}

/// HTTP status for an error surfaced by the core.
pub fn status_for(error: &DaqError) -> StatusCode {
    match error {
        DaqError::InvalidSettings(_) => StatusCode::BAD_REQUEST,
        DaqError::AlreadyRunning(_) => StatusCode::CONFLICT,
        DaqError::UnknownJig(_) => StatusCode::NOT_FOUND,
        DaqError::Gateway(_) => StatusCode::BAD_GATEWAY,
        DaqError::SchedulerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: &DaqError) -> Response<Body> {
    let status = status_for(error);
    if status.is_server_error() {
        warn!(error = %error, "Control request failed");
    }
    json_response(status, &json!({ "error": error.to_string() }))
}

fn bad_request(message: String) -> Response<Body> {
    json_response(StatusCode::BAD_REQUEST, &json!({ "error": message }))
}

fn not_found() -> Response<Body> {
    json_response(StatusCode::NOT_FOUND, &json!({ "error": "not found" }))
}

fn text(status: StatusCode, body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn json_response<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(e) => text(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("could not encode response: {}", e),
        ),
    }
}
