// Health and metrics endpoints
//
// Liveness answers as long as the process runs; readiness requires a live
// router link. The detailed report and the text metrics exposition are
// meant for operators and scrapers respectively.

use crate::gateway::Gateway;
use crate::network::connection::ConnectionState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use std::sync::Arc;

pub async fn liveness(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    Json(json!({
        "status": "alive",
        "uptime_seconds": gateway.uptime().as_secs(),
    }))
}

pub async fn readiness(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    let state = gateway.manager().state();
    let ready = matches!(
        state,
        ConnectionState::Connected | ConnectionState::Ready
    );
    let body = Json(json!({
        "status": if ready { "ready" } else { "not_ready" },
        "connection": format!("{:?}", state),
    }));
    if ready {
        (StatusCode::OK, body)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body)
    }
}

pub async fn detailed(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    let connected = gateway.manager().is_connected();
    let status = if connected { "healthy" } else { "degraded" };
    Json(json!({
        "status": status,
        "components": {
            "router_link": {
                "healthy": connected,
                "state": format!("{:?}", gateway.manager().state()),
                "router": gateway.manager().current_router().map(|r| r.name),
            },
            "state_store": {
                "healthy": true,
                "muds": gateway.state().mud_count().await,
                "sessions": gateway.state().session_count().await,
            },
            "circuit_breakers": gateway
                .breakers()
                .status()
                .into_iter()
                .map(|(name, state, rejected)| {
                    json!({
                        "name": name,
                        "state": format!("{:?}", state),
                        "rejected_calls": rejected,
                    })
                })
                .collect::<Vec<_>>(),
        },
        "stats": gateway.stats().await,
    }))
}

/// Prometheus-style text exposition of the core counters
pub async fn metrics(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    let conn = gateway.manager().stats();
    let routing = gateway.packet_router().stats();
    let ordering = std::sync::atomic::Ordering::Relaxed;

    let mut out = String::new();
    let counters = [
        ("i3_gateway_packets_sent_total", conn.packets_sent),
        ("i3_gateway_packets_received_total", conn.packets_received),
        ("i3_gateway_bytes_sent_total", conn.bytes_sent),
        ("i3_gateway_bytes_received_total", conn.bytes_received),
        ("i3_gateway_reconnects_total", conn.reconnect_count),
        (
            "i3_gateway_packets_routed_local_total",
            routing.packets_routed_local.load(ordering),
        ),
        (
            "i3_gateway_packets_routed_remote_total",
            routing.packets_routed_remote.load(ordering),
        ),
        (
            "i3_gateway_packets_broadcast_total",
            routing.packets_broadcast.load(ordering),
        ),
        (
            "i3_gateway_packets_dropped_total",
            routing.packets_dropped.load(ordering),
        ),
    ];
    for (name, value) in counters {
        out.push_str(&format!("# TYPE {} counter\n{} {}\n", name, name, value));
    }

    let gauges = [
        ("i3_gateway_sessions", gateway.state().session_count().await as u64),
        ("i3_gateway_known_muds", gateway.state().mud_count().await as u64),
        (
            "i3_gateway_connected",
            u64::from(gateway.manager().is_connected()),
        ),
        ("i3_gateway_uptime_seconds", gateway.uptime().as_secs()),
    ];
    for (name, value) in gauges {
        out.push_str(&format!("# TYPE {} gauge\n{} {}\n", name, name, value));
    }

    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        out,
    )
}
