//! HTTP surface over [`VariableApi`], built with axum.

use std::collections::BTreeSet;
use std::net::SocketAddr;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_modbus::slave::SlaveId;
use tracing::{error, info};

use crate::api::{VariableApi, VariableView};
use crate::codec::Address;
use crate::error::Error;
use crate::value::Value;
use crate::variable::RegisterKind;

/// Failure of a request, rendered as a JSON response.
#[derive(Debug)]
pub enum ApiError {
    Variable(Error),
    /// Body is not `{"value": <bool | int | float>}`.
    Body(JsonRejection),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self::Variable(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Body(rejection)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Variable(err) => {
                let status = match &err {
                    Error::NotFound(_) => StatusCode::NOT_FOUND,
                    Error::TypeMismatch { .. }
                    | Error::Range { .. }
                    | Error::Binding(_)
                    | Error::Decode(_) => StatusCode::BAD_REQUEST,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    error!(error = %err, "request failed");
                }
                (status, err.to_string())
            }
            ApiError::Body(rejection) => (StatusCode::BAD_REQUEST, rejection.body_text()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct SetVariable {
    pub value: Value,
}

#[derive(Debug, Serialize)]
pub struct SetVariableResponse {
    pub variable: VariableView,
    /// Present when a protocol store could not be updated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct NodeView {
    pub node: String,
    pub qualified_name: String,
    pub writeable: bool,
}

/// Path segment naming a register kind, e.g. `/modbus/slaves/0/holding_registers`.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum KindSegment {
    Coils,
    DiscreteInputs,
    HoldingRegisters,
    InputRegisters,
}

impl From<KindSegment> for RegisterKind {
    fn from(segment: KindSegment) -> Self {
        match segment {
            KindSegment::Coils => RegisterKind::Coil,
            KindSegment::DiscreteInputs => RegisterKind::DiscreteInput,
            KindSegment::HoldingRegisters => RegisterKind::HoldingRegister,
            KindSegment::InputRegisters => RegisterKind::InputRegister,
        }
    }
}

pub fn router(api: VariableApi) -> Router {
    Router::new()
        .route("/variables", get(list_variables))
        .route(
            "/variables/{name}",
            get(get_variable).put(set_variable).post(set_variable),
        )
        .route("/opcua/namespaces", get(list_namespaces))
        .route("/opcua/nodes", get(list_nodes))
        .route("/modbus/slaves", get(list_slaves))
        .route("/modbus/slaves/{slave}/{kind}", get(list_addresses))
        .with_state(api)
}

pub async fn serve(address: SocketAddr, api: VariableApi) -> std::io::Result<()> {
    let listener = TcpListener::bind(address).await?;
    info!(%address, "REST server listening");
    axum::serve(listener, router(api)).await
}

async fn list_variables(State(api): State<VariableApi>) -> Json<Vec<VariableView>> {
    Json(api.list_variables())
}

async fn get_variable(
    State(api): State<VariableApi>,
    Path(name): Path<String>,
) -> Result<Json<VariableView>, ApiError> {
    Ok(Json(api.get_variable(&name)?))
}

async fn set_variable(
    State(api): State<VariableApi>,
    Path(name): Path<String>,
    body: Result<Json<SetVariable>, JsonRejection>,
) -> Result<Json<SetVariableResponse>, ApiError> {
    let Json(body) = body?;
    match api.set_variable(&name, body.value).await {
        Ok(variable) => Ok(Json(SetVariableResponse {
            variable,
            warning: None,
        })),
        Err(err @ Error::Propagation { .. }) => Ok(Json(SetVariableResponse {
            variable: api.get_variable(&name)?,
            warning: Some(err.to_string()),
        })),
        Err(err) => Err(err.into()),
    }
}

/// Namespace indices that hold at least one bound node.
async fn list_namespaces(State(api): State<VariableApi>) -> Json<Vec<u16>> {
    let namespaces: BTreeSet<u16> = api
        .registry()
        .all_variables()
        .iter()
        .filter_map(|variable| variable.opcua().map(|binding| binding.node.namespace_index))
        .collect();
    Json(namespaces.into_iter().collect())
}

async fn list_nodes(State(api): State<VariableApi>) -> Json<Vec<NodeView>> {
    let nodes = api
        .registry()
        .all_variables()
        .iter()
        .filter_map(|variable| {
            variable.opcua().map(|binding| NodeView {
                node: binding.node.to_string(),
                qualified_name: variable.qualified_name().to_owned(),
                writeable: binding.writeable,
            })
        })
        .collect();
    Json(nodes)
}

async fn list_slaves(State(api): State<VariableApi>) -> Json<Vec<SlaveId>> {
    let slaves: BTreeSet<SlaveId> = api
        .registry()
        .all_variables()
        .iter()
        .filter_map(|variable| variable.modbus().map(|binding| binding.slave))
        .collect();
    Json(slaves.into_iter().collect())
}

/// First address of every variable bound to `kind` on `slave`.
async fn list_addresses(
    State(api): State<VariableApi>,
    Path((slave, kind)): Path<(SlaveId, KindSegment)>,
) -> Json<Vec<Address>> {
    let kind = RegisterKind::from(kind);
    let addresses: BTreeSet<Address> = api
        .registry()
        .all_variables()
        .iter()
        .filter_map(|variable| variable.modbus())
        .filter(|binding| binding.slave == slave && binding.kind == kind)
        .map(|binding| binding.address)
        .collect();
    Json(addresses.into_iter().collect())
}
