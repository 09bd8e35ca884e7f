use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Form, Query, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::Config;
use crate::launcher::{JobState, Launcher, LauncherError};
use crate::repository::Repository;
use crate::scheduler::JobScheduler;

/// Everything the Scrapyd endpoints need, shared across requests.
pub struct AppState {
    config: Arc<Config>,
    launcher: Arc<dyn Launcher>,
    repository: Arc<dyn Repository>,
    scheduler: Option<Arc<JobScheduler>>,
    node_name: String,
    // precomputed `Basic ...` header value when auth is enabled
    auth: Option<String>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        launcher: Arc<dyn Launcher>,
        repository: Arc<dyn Repository>,
        scheduler: Option<Arc<JobScheduler>>,
    ) -> AppState {
        let node_name = config
            .node_name()
            .map(str::to_string)
            .unwrap_or_else(|| launcher.node_name());
        let auth = match (config.username(), config.password()) {
            (Some(username), Some(password)) => {
                Some(format!("Basic {}", BASE64.encode(format!("{username}:{password}"))))
            }
            _ => None,
        };

        AppState {
            config,
            launcher,
            repository,
            scheduler,
            node_name,
            auth,
        }
    }

    fn ok(&self, mut payload: Value) -> Response {
        if let Value::Object(fields) = &mut payload {
            fields.insert("status".to_string(), json!("ok"));
            fields.insert("node_name".to_string(), json!(self.node_name));
        }
        axum::Json(payload).into_response()
    }

    fn error(&self, status: StatusCode, message: impl Into<String>) -> Response {
        let body = json!({
            "status": "error",
            "message": message.into(),
            "node_name": self.node_name,
        });
        (status, axum::Json(body)).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let routes = Router::new()
        .route("/", get(home))
        .route("/healthz", get(healthz))
        .route("/daemonstatus.json", get(daemonstatus))
        .route("/listprojects.json", get(listprojects))
        .route("/listversions.json", get(listversions))
        .route("/listspiders.json", get(listspiders))
        .route("/listjobs.json", get(listjobs))
        .route("/schedule.json", post(schedule))
        .route("/cancel.json", post(cancel))
        .route("/addversion.json", post(not_implemented))
        .route("/delversion.json", post(not_implemented))
        .route("/delproject.json", post(not_implemented));

    let routes = if state.auth.is_some() {
        routes.layer(middleware::from_fn_with_state(state.clone(), require_auth))
    } else {
        routes
    };

    routes.layer(TraceLayer::new_for_http()).with_state(state)
}

async fn require_auth(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    if provided == state.auth.as_deref() {
        return next.run(request).await;
    }

    let mut response = state.error(StatusCode::UNAUTHORIZED, "authentication required");
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"spiderd\""),
    );
    response
}

async fn home() -> Html<&'static str> {
    Html("<html><body><h1>spiderd</h1></body></html>")
}

async fn healthz() -> &'static str {
    "OK"
}

async fn daemonstatus(State(state): State<Arc<AppState>>) -> Response {
    state.ok(json!({"spiders": 0}))
}

async fn listprojects(State(state): State<Arc<AppState>>) -> Response {
    state.ok(json!({"projects": state.config.listprojects()}))
}

async fn listversions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(project_id) = params.get("project") else {
        return state.error(StatusCode::BAD_REQUEST, "project missing in query parameters");
    };
    let Some(project) = state.config.project(project_id) else {
        return state.error(StatusCode::NOT_FOUND, "project not found in configuration");
    };
    let repository = match project.repository() {
        Ok(repository) => repository,
        Err(err) => return state.error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };

    match state.repository.listtags(repository).await {
        Ok(tags) => state.ok(json!({"versions": sorted_versions(tags)})),
        Err(err) => {
            error!("Cannot list versions for project {}: {}", project_id, err);
            state.error(StatusCode::INTERNAL_SERVER_ERROR, "cannot list versions from repository")
        }
    }
}

async fn listspiders(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(project_id) = params.get("project") else {
        return state.error(StatusCode::BAD_REQUEST, "project missing in query parameters");
    };
    let Some(project) = state.config.project(project_id) else {
        return state.error(StatusCode::NOT_FOUND, "project not found in configuration");
    };
    let version = params.get("_version").map(String::as_str).unwrap_or("latest");
    let repository = match project.repository() {
        Ok(repository) => repository,
        Err(err) => return state.error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };

    match state.repository.listspiders(repository, project_id, version).await {
        Ok(Some(spiders)) => state.ok(json!({"spiders": spiders})),
        Ok(None) => state.error(StatusCode::NOT_FOUND, "project version not found in repository"),
        Err(err) => {
            error!("Cannot list spiders for project {}: {}", project_id, err);
            state.error(StatusCode::INTERNAL_SERVER_ERROR, "cannot list spiders from repository")
        }
    }
}

async fn listjobs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let project = params.get("project").map(String::as_str);
    let jobs = match state.launcher.list_jobs(project).await {
        Ok(jobs) => jobs,
        Err(err) => {
            error!("Cannot list jobs: {}", err);
            return state.error(StatusCode::INTERNAL_SERVER_ERROR, "cannot list jobs");
        }
    };

    let in_state = |wanted: &JobState| jobs.iter().filter(|job| &job.state == wanted).collect::<Vec<_>>();
    state.ok(json!({
        "pending": in_state(&JobState::Pending),
        "running": in_state(&JobState::Running),
        "finished": in_state(&JobState::Finished),
    }))
}

async fn schedule(State(state): State<Arc<AppState>>, Form(fields): Form<Vec<(String, String)>>) -> Response {
    let request = match ScheduleRequest::from_form(fields) {
        Ok(request) => request,
        Err(message) => return state.error(StatusCode::BAD_REQUEST, message),
    };
    let Some(project) = state.config.project(&request.project) else {
        return state.error(StatusCode::BAD_REQUEST, "project not found in configuration");
    };

    let start_suspended = match &state.scheduler {
        Some(scheduler) => scheduler.start_suspended().await,
        None => false,
    };

    let job_id = request
        .job_id
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

    let scheduled = state
        .launcher
        .schedule(
            &project,
            &request.version,
            &request.spider,
            &job_id,
            &request.settings,
            &request.args,
            start_suspended,
        )
        .await;

    match scheduled {
        Ok(()) => state.ok(json!({"jobid": job_id})),
        Err(err @ LauncherError::AlreadyExists { .. }) => state.error(StatusCode::CONFLICT, err.to_string()),
        Err(err) => {
            error!("Cannot schedule job {}: {}", job_id, err);
            state.error(StatusCode::INTERNAL_SERVER_ERROR, "cannot schedule job")
        }
    }
}

async fn cancel(State(state): State<Arc<AppState>>, Form(fields): Form<Vec<(String, String)>>) -> Response {
    let mut project = None;
    let mut job = None;
    let mut signal = None;
    for (key, value) in fields {
        match key.as_str() {
            "project" => project = Some(value),
            "job" => job = Some(value),
            "signal" => signal = Some(value),
            _ => {}
        }
    }
    let Some(project) = project else {
        return state.error(StatusCode::BAD_REQUEST, "project missing in form parameters");
    };
    let Some(job) = job else {
        return state.error(StatusCode::BAD_REQUEST, "job missing in form parameters");
    };
    let signal = signal.unwrap_or_else(|| "TERM".to_string());

    match state.launcher.cancel(&project, &job, &signal).await {
        Ok(Some(prevstate)) => state.ok(json!({"prevstate": prevstate})),
        Ok(None) => state.error(StatusCode::NOT_FOUND, "job not found"),
        Err(err @ LauncherError::UnknownSignal(_)) => state.error(StatusCode::BAD_REQUEST, err.to_string()),
        Err(err) => {
            error!("Cannot cancel job {}: {}", job, err);
            state.error(StatusCode::INTERNAL_SERVER_ERROR, "cannot cancel job")
        }
    }
}

async fn not_implemented(State(state): State<Arc<AppState>>) -> Response {
    state.error(
        StatusCode::NOT_IMPLEMENTED,
        "project versions are managed in the image repository",
    )
}

/// Version tags, natural-sorted ascending with build digests dropped.
fn sorted_versions(tags: Vec<String>) -> Vec<String> {
    let mut tags: Vec<String> = tags.into_iter().filter(|tag| !tag.starts_with("sha-")).collect();
    tags.sort_by(|a, b| natord::compare(a, b));
    tags
}

/// Parsed `/schedule.json` form. Any field that is not one of the known
/// parameters is passed to the spider as an argument, in form order.
#[derive(Debug)]
pub(crate) struct ScheduleRequest {
    project: String,
    spider: String,
    job_id: Option<String>,
    version: String,
    settings: Vec<(String, String)>,
    args: Vec<(String, String)>,
}

impl ScheduleRequest {
    fn from_form(fields: Vec<(String, String)>) -> Result<ScheduleRequest, String> {
        let mut project = None;
        let mut spider = None;
        let mut job_id = None;
        let mut version = None;
        let mut settings = Vec::new();
        let mut args = Vec::new();

        for (key, value) in fields {
            match key.as_str() {
                "project" => project = Some(value),
                "spider" => spider = Some(value),
                "jobid" => job_id = Some(value),
                "_version" => version = Some(value),
                "priority" => {} // accepted, not supported
                "setting" => match value.split_once('=') {
                    Some((name, setting)) => settings.push((name.to_string(), setting.to_string())),
                    None => return Err(format!("invalid setting `{value}`, expected key=value")),
                },
                _ => args.push((key, value)),
            }
        }

        let project = project.ok_or("project missing in form parameters")?;
        let spider = spider.ok_or("spider not found in form parameters")?;
        Ok(ScheduleRequest {
            project,
            spider,
            job_id,
            version: version.unwrap_or_else(|| "latest".to_string()),
            settings,
            args,
        })
    }
}
