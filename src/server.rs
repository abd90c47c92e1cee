use std::sync::Arc;

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Multipart, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use log::{error, info, warn};
use serde_json::json;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};

use crate::admittance::build_admittance;
use crate::case::Network;
use crate::config::SolverConfig;
use crate::error::PowerFlowError;
use crate::export::{bus_power_rows, results_summary, trace_csv, voltage_rows, voltages_csv};
use crate::loadflow::{Method, PowerFlowSolution, run_load_flow};
use crate::parse::{parse_case_str, parse_tables, write_case};

pub const DEFAULT_ADDR: &str = "0.0.0.0:3000";

type Solved = (Network, SolverConfig, PowerFlowSolution);

/// The network being edited and the outcome of the last solve. The solved
/// network keeps any bus type changes made by the solver.
#[derive(Default)]
struct Session {
    network: Option<Network>,
    // bumped on every network replacement
    generation: u64,
    solved: Option<Solved>,
}

impl Session {
    fn replace(&mut self, network: Network) {
        self.network = Some(network);
        self.generation += 1;
        self.solved = None;
    }

    fn checkout(&self) -> Option<(u64, Network)> {
        self.network.clone().map(|n| (self.generation, n))
    }

    /// Keeps a solve result only if the network it was computed from is
    /// still the loaded one.
    fn record(&mut self, generation: u64, solved: Solved) -> bool {
        if generation != self.generation {
            return false;
        }
        self.solved = Some(solved);
        true
    }
}

type AppState = Arc<Mutex<Session>>;

fn json_ok(val: serde_json::Value) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        val.to_string(),
    )
        .into_response()
}

fn json_err(status: StatusCode, msg: &str) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        json!({"error": msg}).to_string(),
    )
        .into_response()
}

fn error_response(e: PowerFlowError) -> Response {
    let status = match e {
        PowerFlowError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        PowerFlowError::Parse { .. } | PowerFlowError::Json(_) | PowerFlowError::InvalidConfig(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    };
    warn!("Request failed: {}", e);
    json_err(status, &e.to_string())
}

fn text(content_type: &'static str, body: String, filename: Option<&str>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    if let Some(name) = filename {
        if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", name)) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }
    (StatusCode::OK, headers, Body::from(body)).into_response()
}

fn file_stem(network: &Network) -> String {
    if network.case_name.is_empty() {
        "case".to_string()
    } else {
        network.case_name.replace(' ', "_")
    }
}

fn store(session: &mut Session, network: Network) -> Response {
    let net_json = serde_json::to_value(&network).unwrap_or(json!(null));
    session.replace(network);
    json_ok(net_json)
}

// POST /api/upload  multipart/form-data with either a "case" file or
// "buses" and "lines" tables, plus optional "name" and "s_base"
async fn upload(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let mut case = None;
    let mut buses = None;
    let mut lines = None;
    let mut name = String::new();
    let mut s_base = None;

    while let Ok(Some(field)) = multipart.next_field().await {
        let key = field.name().unwrap_or_default().to_string();
        let content = match field.bytes().await {
            Ok(b) => String::from_utf8_lossy(&b).to_string(),
            Err(_) => return json_err(StatusCode::BAD_REQUEST, "Failed to read upload"),
        };
        match key.as_str() {
            "case" => case = Some(content),
            "buses" => buses = Some(content),
            "lines" => lines = Some(content),
            "name" => name = content.trim().to_string(),
            "s_base" => match content.trim().parse::<f64>() {
                Ok(v) => s_base = Some(v),
                Err(_) => return json_err(StatusCode::BAD_REQUEST, "s_base is not a number"),
            },
            _ => {}
        }
    }

    let parsed = match (case, buses, lines) {
        (Some(text), _, _) => parse_case_str(&text).map(|mut net| {
            if !name.is_empty() {
                net.case_name = name;
            }
            if let Some(base) = s_base {
                net.s_base = base;
            }
            net
        }),
        (None, Some(b), l) => parse_tables(&name, s_base.unwrap_or(1.0), &b, &l.unwrap_or_default()),
        _ => {
            return json_err(
                StatusCode::BAD_REQUEST,
                "Expected a 'case' field or 'buses' and 'lines' fields",
            );
        }
    };

    match parsed {
        Ok(network) => store(&mut *state.lock().await, network),
        Err(e) => error_response(e),
    }
}

// GET /api/network
async fn get_network(State(state): State<AppState>) -> Response {
    let guard = state.lock().await;
    match guard.network.as_ref() {
        Some(net) => json_ok(serde_json::to_value(net).unwrap_or(json!(null))),
        None => json_err(StatusCode::NOT_FOUND, "No network loaded"),
    }
}

// PUT /api/network  replace the entire network
async fn put_network(
    State(state): State<AppState>,
    body: axum::extract::Json<serde_json::Value>,
) -> Response {
    match serde_json::from_value::<Network>(body.0) {
        Ok(mut net) => {
            net.rebuild_bus_map();
            store(&mut *state.lock().await, net)
        }
        Err(e) => json_err(StatusCode::BAD_REQUEST, &e.to_string()),
    }
}

// POST /api/solve/{method}  optional JSON body with solver settings
async fn solve(
    State(state): State<AppState>,
    Path(method): Path<String>,
    body: Bytes,
) -> Response {
    let method: Method = match method.parse() {
        Ok(m) => m,
        Err(e) => return error_response(e),
    };

    let mut config = SolverConfig::for_method(method);
    if !body.iter().all(|b| b.is_ascii_whitespace()) {
        let overrides = String::from_utf8_lossy(&body);
        config = match config.with_overrides(&overrides) {
            Ok(c) => c,
            Err(e) => return error_response(e),
        };
    }

    let (generation, mut network) = match state.lock().await.checkout() {
        Some(checked_out) => checked_out,
        None => return json_err(StatusCode::NOT_FOUND, "No network loaded"),
    };

    // solve on a copy so the lock is not held while iterating
    let worker_config = config.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        run_load_flow(&mut network, method, &worker_config).map(|sol| (network, sol))
    })
    .await;

    match outcome {
        Ok(Ok((network, solution))) => {
            info!(
                "{} solve finished: {} after {} iterations",
                method, solution.status, solution.iterations
            );
            let body = json!({
                "solution": solution,
                "voltages": voltage_rows(&solution),
            });
            if !state.lock().await.record(generation, (network, config, solution)) {
                warn!("Network replaced during the {} solve, result discarded", method);
                return json_err(
                    StatusCode::CONFLICT,
                    "Network changed while solving, result discarded",
                );
            }
            json_ok(body)
        }
        Ok(Err(e)) => error_response(e),
        Err(e) => {
            error!("Solver task failed: {}", e);
            json_err(StatusCode::INTERNAL_SERVER_ERROR, "Solver task failed")
        }
    }
}

// GET /api/ybus  printable admittance matrix of the current network
async fn get_ybus(State(state): State<AppState>) -> Response {
    let mut network = match state.lock().await.network.clone() {
        Some(n) => n,
        None => return json_err(StatusCode::NOT_FOUND, "No network loaded"),
    };
    let sparse = SolverConfig::default().use_sparse(network.buses.len());
    let built = network
        .validate()
        .and_then(|_| build_admittance(&network, sparse));
    match built {
        Ok((ybus, _)) => text("text/plain; charset=utf-8", ybus.to_string(), None),
        Err(e) => error_response(e),
    }
}

// GET /api/results
async fn get_results(State(state): State<AppState>) -> Response {
    let guard = state.lock().await;
    let Some((network, config, solution)) = guard.solved.as_ref() else {
        return json_err(StatusCode::NOT_FOUND, "No solution available");
    };
    match bus_power_rows(network, solution, config) {
        Ok(power) => json_ok(json!({
            "solution": solution,
            "voltages": voltage_rows(solution),
            "power": power,
        })),
        Err(e) => error_response(e),
    }
}

// GET /api/results/summary
async fn get_summary(State(state): State<AppState>) -> Response {
    let guard = state.lock().await;
    match guard.solved.as_ref() {
        Some((network, _, solution)) => text(
            "text/plain; charset=utf-8",
            results_summary(network, solution),
            None,
        ),
        None => json_err(StatusCode::NOT_FOUND, "No solution available"),
    }
}

// GET /api/export/voltages.csv
async fn export_voltages(State(state): State<AppState>) -> Response {
    let guard = state.lock().await;
    match guard.solved.as_ref() {
        Some((network, _, solution)) => text(
            "text/csv; charset=utf-8",
            voltages_csv(solution),
            Some(&format!("{}_voltages.csv", file_stem(network))),
        ),
        None => json_err(StatusCode::NOT_FOUND, "No solution available"),
    }
}

// GET /api/export/trace.csv
async fn export_trace(State(state): State<AppState>) -> Response {
    let guard = state.lock().await;
    match guard.solved.as_ref() {
        Some((network, _, solution)) => text(
            "text/csv; charset=utf-8",
            trace_csv(solution),
            Some(&format!("{}_iterations.csv", file_stem(network))),
        ),
        None => json_err(StatusCode::NOT_FOUND, "No solution available"),
    }
}

// GET /api/export/case
async fn export_case(State(state): State<AppState>) -> Response {
    let guard = state.lock().await;
    match guard.network.as_ref() {
        Some(network) => text(
            "text/plain; charset=utf-8",
            write_case(network),
            Some(&format!("{}.case", file_stem(network))),
        ),
        None => json_err(StatusCode::NOT_FOUND, "No network loaded"),
    }
}

pub fn router() -> Router {
    let state: AppState = Arc::new(Mutex::new(Session::default()));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/upload", post(upload))
        .route("/api/network", get(get_network).put(put_network))
        .route("/api/solve/{method}", post(solve))
        .route("/api/ybus", get(get_ybus))
        .route("/api/results", get(get_results))
        .route("/api/results/summary", get(get_summary))
        .route("/api/export/voltages.csv", get(export_voltages))
        .route("/api/export/trace.csv", get(export_trace))
        .route("/api/export/case", get(export_case))
        .layer(cors)
        .with_state(state)
}

pub async fn run_server(addr: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);
    println!("gridflow running at http://{}", addr);
    axum::serve(listener, router()).await
}
