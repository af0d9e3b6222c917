// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Minimal ops listener: health probe, Prometheus metrics and read-only
//! swap views for the operator CLI. The rich status API lives elsewhere.

use crate::engine::SwapEngine;
use crate::error::CoordinatorError;
use crate::node::HealthProbe;
use crate::store::SwapStore;
use crate::types::{Swap, SwapId};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus::{Encoder, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct OpsState {
    pub registry: Registry,
    pub store: Arc<dyn SwapStore>,
    pub health: Arc<HealthProbe>,
    pub engine: Arc<SwapEngine>,
}

/// Wire form of a swap. Secrets are redacted before anything leaves the
/// process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapView {
    pub id: String,
    pub phase: String,
    pub digest: String,
    pub algorithm: String,
    pub hold: Option<String>,
    pub created_ms: u64,
    pub updated_ms: u64,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub sides: Vec<SideView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SideView {
    pub ledger: String,
    pub escrow_id: String,
    pub owner: String,
    pub beneficiary: String,
    pub token: String,
    pub amount: String,
    pub deadline_ms: u64,
    pub withdrawn: bool,
    pub refunded: bool,
    pub revealed_secret: Option<String>,
}

impl SwapView {
    pub fn from_swap(swap: &Swap) -> Self {
        Self {
            id: swap.id.to_string(),
            phase: swap.phase.as_str().to_string(),
            digest: swap.digest.to_hex(),
            algorithm: swap.algorithm.as_str().to_string(),
            hold: swap.hold.map(|h| format!("{h:?}")),
            created_ms: swap.created_ms,
            updated_ms: swap.updated_ms,
            last_error: swap.last_error.clone(),
            retry_count: swap.retry_count,
            sides: swap
                .sides()
                .map(|side| SideView {
                    ledger: side.ledger.to_string(),
                    escrow_id: side.escrow_id.to_string(),
                    owner: side.owner.clone(),
                    beneficiary: side.beneficiary.clone(),
                    token: side.token.clone(),
                    amount: side.amount.to_string(),
                    deadline_ms: side.deadline_ms(),
                    withdrawn: side.withdrawn,
                    refunded: side.refunded,
                    revealed_secret: side.revealed_secret.map(|s| s.redacted()),
                })
                .collect(),
        }
    }
}

pub fn router(state: Arc<OpsState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/swaps", get(handle_list_swaps))
        .route("/swaps/:id", get(handle_get_swap))
        .route("/swaps/:id/force-refund", post(handle_force_refund))
        .with_state(state)
}

pub fn run_ops_server(
    port: u16,
    state: Arc<OpsState>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let address = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(address).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!("ops listener bind on {address} failed: {e}");
                return;
            }
        };
        info!("ops server listening on {address}");
        let app = router(state);
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await;
    })
}

async fn handle_health(State(state): State<Arc<OpsState>>) -> impl IntoResponse {
    let report = state.health.check().await;
    let code = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

async fn handle_metrics(State(state): State<Arc<OpsState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = state.registry.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    (StatusCode::OK, String::from_utf8_lossy(&buffer).to_string())
}

async fn handle_list_swaps(State(state): State<Arc<OpsState>>) -> impl IntoResponse {
    match state.store.all_swaps().await {
        Ok(swaps) => {
            let mut views: Vec<SwapView> = swaps
                .iter()
                .filter(|v| !v.swap.phase.is_terminal())
                .map(|v| SwapView::from_swap(&v.swap))
                .collect();
            views.sort_by(|a, b| b.updated_ms.cmp(&a.updated_ms));
            (StatusCode::OK, Json(views)).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn handle_get_swap(
    State(state): State<Arc<OpsState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_swap(&SwapId::from_key(id)).await {
        Ok(Some(v)) => (StatusCode::OK, Json(SwapView::from_swap(&v.swap))).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "swap not found").into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn handle_force_refund(
    State(state): State<Arc<OpsState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.engine.force_refund(&SwapId::from_key(id)).await {
        Ok(swap) => (StatusCode::OK, Json(SwapView::from_swap(&swap))).into_response(),
        Err(e @ CoordinatorError::SwapNotFound { .. }) => {
            (StatusCode::NOT_FOUND, e.to_string()).into_response()
        }
        Err(e @ CoordinatorError::PolicyViolation { .. }) => {
            (StatusCode::CONFLICT, e.to_string()).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
