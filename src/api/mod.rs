use axum::{
    Router,
    extract::Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::rc::Rc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::core::income::{
    RSU_INCOME_USD, SALE_PROCEEDS_USD, SALES_ORDERS, SHARES_WITHHELD_RSU_N, TOTAL_INCOME_USD,
};
use crate::core::position::{SHARES_SELLABLE_N, SHARES_VESTED_RSU_USD};
use crate::core::taxes::{
    AMT_EXCESS_USD, CASH_AFTER_TAXES_USD, FED_TAXES_USD, RSU_SHARES_TO_COVER_N, STATE_TAXES_USD,
    TAX_BURDEN_USD, TAX_OUTSTANDING_USD,
};
use crate::core::{
    ComputationGraph, ModelError, SaleOrder, SaleSimulation, ScenarioConfig, SolveConfig,
    SolveResult, TaxTable, Value, amt_crossover, build_graph, commit_sales, parse_date, solve_for,
};

/// Nodes reported when a request does not name any.
pub const DEFAULT_REPORT_NODES: &[&str] = &[
    SHARES_VESTED_RSU_USD,
    SHARES_SELLABLE_N,
    SHARES_WITHHELD_RSU_N,
    RSU_INCOME_USD,
    SALE_PROCEEDS_USD,
    TOTAL_INCOME_USD,
    FED_TAXES_USD,
    STATE_TAXES_USD,
    TAX_BURDEN_USD,
    AMT_EXCESS_USD,
    TAX_OUTSTANDING_USD,
    CASH_AFTER_TAXES_USD,
    RSU_SHARES_TO_COVER_N,
];

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct EvaluatePayload {
    #[serde(flatten)]
    scenario: ScenarioConfig,
    overrides: BTreeMap<String, serde_json::Value>,
    nodes: Vec<String>,
    commit_sales: bool,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AmtCrossoverRequest {
    lo: f64,
    hi: f64,
    step: f64,
    #[serde(default = "default_rounds")]
    rounds: u32,
}

fn default_rounds() -> u32 {
    3
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SolvePayload {
    #[serde(flatten)]
    scenario: ScenarioConfig,
    overrides: BTreeMap<String, serde_json::Value>,
    solve: Option<SolveConfig>,
    amt_crossover: Option<AmtCrossoverRequest>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NodesResponse {
    nodes: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateResponse {
    values: BTreeMap<String, Value>,
    overridden: Vec<String>,
    committed: Option<Rc<SaleSimulation>>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Why a request was turned down.
#[derive(Debug)]
enum Rejection {
    BadRequest(String),
    Model(ModelError),
}

impl From<ModelError> for Rejection {
    fn from(err: ModelError) -> Self {
        Rejection::Model(err)
    }
}

impl Rejection {
    fn status(&self) -> StatusCode {
        match self {
            Rejection::Model(
                ModelError::InsufficientShares { .. } | ModelError::SolverNoCrossingFound { .. },
            ) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    fn message(&self) -> String {
        match self {
            Rejection::BadRequest(msg) => msg.clone(),
            Rejection::Model(err) => err.to_string(),
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let message = self.message();
        warn!(status = %self.status(), error = %message, "request rejected");
        error_response(self.status(), &message)
    }
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = Router::new()
        .route("/api/nodes", get(nodes_handler))
        .route("/api/evaluate", post(evaluate_handler))
        .route("/api/solve", post(solve_handler))
        .fallback(not_found_handler);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "vestcalc HTTP API listening");

    axum::serve(listener, app).await
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn nodes_handler() -> Response {
    match node_names() {
        Ok(nodes) => json_response(StatusCode::OK, NodesResponse { nodes }),
        Err(rejection) => rejection.into_response(),
    }
}

async fn evaluate_handler(Json(payload): Json<EvaluatePayload>) -> Response {
    match evaluate(payload) {
        Ok(response) => json_response(StatusCode::OK, response),
        Err(rejection) => rejection.into_response(),
    }
}

async fn solve_handler(Json(payload): Json<SolvePayload>) -> Response {
    match solve(payload) {
        Ok(response) => json_response(StatusCode::OK, response),
        Err(rejection) => rejection.into_response(),
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

/// Resolves `names` on `graph`, failing on the first node that cannot be evaluated.
pub fn report(
    graph: &ComputationGraph,
    names: &[String],
) -> Result<BTreeMap<String, Value>, ModelError> {
    names
        .iter()
        .map(|name| Ok((name.clone(), graph.value(name)?)))
        .collect()
}

pub fn default_report_names() -> Vec<String> {
    DEFAULT_REPORT_NODES.iter().map(|name| name.to_string()).collect()
}

fn node_names() -> Result<Vec<String>, Rejection> {
    let graph = build_graph(&ScenarioConfig::default())?;
    Ok(graph.names().into_iter().map(str::to_string).collect())
}

fn override_from_json(name: &str, raw: &serde_json::Value) -> Result<Value, String> {
    match raw {
        serde_json::Value::Number(n) => n
            .as_f64()
            .map(Value::Number)
            .ok_or_else(|| format!("override {name}: number out of range")),
        serde_json::Value::String(text) => parse_date(text)
            .map(Value::Date)
            .map_err(|e| format!("override {name}: {e}")),
        serde_json::Value::Array(_) if name == SALES_ORDERS => {
            serde_json::from_value::<Vec<SaleOrder>>(raw.clone())
                .map(Value::from)
                .map_err(|e| format!("override {name}: invalid sale orders: {e}"))
        }
        serde_json::Value::Array(_) => serde_json::from_value::<TaxTable>(raw.clone())
            .map(Value::from)
            .map_err(|e| format!("override {name}: invalid tax table: {e}")),
        _ => Err(format!(
            "override {name}: expected a number, a date string, a tax table or sale orders"
        )),
    }
}

fn scenario_graph(
    scenario: &ScenarioConfig,
    overrides: &BTreeMap<String, serde_json::Value>,
) -> Result<ComputationGraph, Rejection> {
    let mut graph = build_graph(scenario)?;
    for (name, raw) in overrides {
        let value = override_from_json(name, raw).map_err(Rejection::BadRequest)?;
        graph.override_node(name, value)?;
    }
    Ok(graph)
}

fn evaluate(payload: EvaluatePayload) -> Result<EvaluateResponse, Rejection> {
    let mut graph = scenario_graph(&payload.scenario, &payload.overrides)?;
    let committed = if payload.commit_sales {
        Some(commit_sales(&mut graph)?)
    } else {
        None
    };

    let names = if payload.nodes.is_empty() {
        default_report_names()
    } else {
        payload.nodes
    };
    let values = report(&graph, &names)?;
    Ok(EvaluateResponse {
        values,
        overridden: payload.overrides.into_keys().collect(),
        committed,
    })
}

fn solve(payload: SolvePayload) -> Result<SolveResult, Rejection> {
    let mut graph = scenario_graph(&payload.scenario, &payload.overrides)?;
    match (payload.solve, payload.amt_crossover) {
        (Some(config), None) => Ok(solve_for(&mut graph, &config)?),
        (None, Some(request)) => Ok(amt_crossover(
            &mut graph,
            request.lo,
            request.hi,
            request.step,
            request.rounds,
        )?),
        (Some(_), Some(_)) => Err(Rejection::BadRequest(
            "send either solve or amtCrossover, not both".to_string(),
        )),
        (None, None) => Err(Rejection::BadRequest(
            "solve or amtCrossover is required".to_string(),
        )),
    }
}
