// JSON-RPC 2.0 over WebSocket
//
// The downstream surface local MUD clients speak. Requests map onto
// gateway operations; gateway events stream to every connected client as
// JSON-RPC notifications.

use crate::gateway::Gateway;
use crate::network::lpc::LpcValue;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

const PARSE_ERROR: i32 = -32700;
const INVALID_REQUEST: i32 = -32600;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const GATEWAY_ERROR: i32 = -32000;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    jsonrpc: String,
    method: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    id: Value,
}

fn ok_response(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn err_response(id: Value, code: i32, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}

/// Convert an LPC value into JSON for client consumption
fn lpc_to_json(value: &LpcValue) -> Value {
    match value {
        LpcValue::Null => Value::Null,
        LpcValue::Int(i) => json!(i),
        LpcValue::Float(f) => json!(f),
        LpcValue::Str(s) => json!(s),
        LpcValue::Buffer(b) => json!(String::from_utf8_lossy(b)),
        LpcValue::Array(items) => Value::Array(items.iter().map(lpc_to_json).collect()),
        LpcValue::Mapping(pairs) => Value::Object(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string_lossy(), lpc_to_json(v)))
                .collect(),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct TellParams {
    from_user: String,
    target_mud: String,
    target_user: String,
    message: String,
    #[serde(default)]
    visname: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChannelSendParams {
    from_user: String,
    channel: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ChannelMemberParams {
    user: String,
    channel: String,
}

#[derive(Debug, Deserialize)]
struct ChannelQueryParams {
    channel: String,
}

#[derive(Debug, Deserialize)]
struct WhoParams {
    from_user: String,
    target_mud: String,
}

#[derive(Debug, Deserialize)]
struct FingerParams {
    from_user: String,
    target_mud: String,
    target_user: String,
}

#[derive(Debug, Deserialize)]
struct LocateParams {
    from_user: String,
    user: String,
}

fn parse<T: for<'de> Deserialize<'de>>(params: Value) -> Result<T, (i32, String)> {
    serde_json::from_value(params).map_err(|e| (INVALID_PARAMS, e.to_string()))
}

/// Execute one JSON-RPC method against the gateway
pub async fn dispatch(gateway: &Arc<Gateway>, method: &str, params: Value) -> Result<Value, (i32, String)> {
    match method {
        "ping" => Ok(json!("pong")),
        "status" => Ok(gateway.status().await),
        "stats" => Ok(gateway.stats().await),
        "reconnect" => Ok(json!({"reconnected": gateway.reconnect().await})),

        "tell" => {
            let p: TellParams = parse(params)?;
            let sent = gateway
                .send_tell(
                    &p.from_user,
                    &p.target_mud,
                    &p.target_user,
                    &p.message,
                    p.visname.as_deref(),
                )
                .await;
            Ok(json!({"sent": sent}))
        }
        "emoteto" => {
            let p: TellParams = parse(params)?;
            let sent = gateway
                .send_emoteto(
                    &p.from_user,
                    &p.target_mud,
                    &p.target_user,
                    &p.message,
                    p.visname.as_deref(),
                )
                .await;
            Ok(json!({"sent": sent}))
        }

        "channel_send" => {
            let p: ChannelSendParams = parse(params)?;
            let sent = gateway.channel_send(&p.from_user, &p.channel, &p.message).await;
            Ok(json!({"sent": sent}))
        }
        "channel_emote" => {
            let p: ChannelSendParams = parse(params)?;
            let sent = gateway.channel_emote(&p.from_user, &p.channel, &p.message).await;
            Ok(json!({"sent": sent}))
        }
        "channel_join" => {
            let p: ChannelMemberParams = parse(params)?;
            Ok(json!({"joined": gateway.channel_join(&p.user, &p.channel).await}))
        }
        "channel_leave" => {
            let p: ChannelMemberParams = parse(params)?;
            Ok(json!({"left": gateway.channel_leave(&p.user, &p.channel).await}))
        }
        "channel_list" => {
            let channels: Vec<Value> = gateway
                .channel_list()
                .await
                .into_iter()
                .map(|ch| {
                    json!({
                        "name": ch.name,
                        "owner": ch.owner,
                        "type": ch.channel_type,
                        "listening_muds": ch.listening_muds.len(),
                        "message_count": ch.message_count,
                    })
                })
                .collect();
            Ok(json!(channels))
        }
        "channel_who" => {
            let p: ChannelQueryParams = parse(params)?;
            Ok(json!(gateway.channel_who(&p.channel).await))
        }
        "channel_history" => {
            let p: ChannelQueryParams = parse(params)?;
            let history: Vec<Value> = gateway
                .channel_history(&p.channel)
                .into_iter()
                .map(|record| {
                    json!({
                        "from_mud": record.from_mud,
                        "from_user": record.from_user,
                        "visname": record.visname,
                        "message": record.message,
                        "emote": record.emote,
                        "timestamp": record.timestamp.to_rfc3339(),
                    })
                })
                .collect();
            Ok(json!(history))
        }

        "who" => {
            let p: WhoParams = parse(params)?;
            match gateway.who(&p.from_user, &p.target_mud).await {
                Some(users) => Ok(Value::Array(users.iter().map(lpc_to_json).collect())),
                None => Err((GATEWAY_ERROR, "who request timed out".to_string())),
            }
        }
        "finger" => {
            let p: FingerParams = parse(params)?;
            match gateway
                .finger(&p.from_user, &p.target_mud, &p.target_user)
                .await
            {
                Some(info) => Ok(lpc_to_json(&LpcValue::Mapping(info))),
                None => Err((GATEWAY_ERROR, "finger request timed out".to_string())),
            }
        }
        "locate" => {
            let p: LocateParams = parse(params)?;
            match gateway.locate(&p.from_user, &p.user).await {
                Some(result) => Ok(json!({
                    "mud": result.mud,
                    "user": result.user,
                    "idle_time": result.idle_time,
                    "status": result.status,
                })),
                None => Ok(Value::Null),
            }
        }
        "mudlist" => {
            let muds: Vec<Value> = gateway
                .mudlist()
                .await
                .into_iter()
                .map(|mud| {
                    json!({
                        "name": mud.name,
                        "address": mud.address,
                        "player_port": mud.player_port,
                        "status": format!("{:?}", mud.status).to_lowercase(),
                        "driver": mud.driver,
                        "mud_type": mud.mud_type,
                        "services": mud.services,
                    })
                })
                .collect();
            Ok(json!(muds))
        }

        _ => Err((METHOD_NOT_FOUND, format!("unknown method: {}", method))),
    }
}

async fn handle_request_text(gateway: &Arc<Gateway>, text: &str) -> Value {
    let request: RpcRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => return err_response(Value::Null, PARSE_ERROR, &e.to_string()),
    };
    if !request.jsonrpc.is_empty() && request.jsonrpc != "2.0" {
        return err_response(request.id, INVALID_REQUEST, "jsonrpc must be \"2.0\"");
    }

    debug!(method = %request.method, "rpc request");
    match dispatch(gateway, &request.method, request.params).await {
        Ok(result) => ok_response(request.id, result),
        Err((code, message)) => err_response(request.id, code, &message),
    }
}

pub async fn ws_handler(
    State(gateway): State<Arc<Gateway>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| client_session(gateway, socket))
}

/// Serve newline-delimited JSON-RPC over plain TCP for clients without a
/// WebSocket stack.
pub async fn serve_tcp(
    gateway: Arc<Gateway>,
    host: &str,
    port: u16,
) -> crate::error::Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| crate::error::GatewayError::Network(format!("cannot bind {}: {}", addr, e)))?;
    tracing::info!(address = %addr, "TCP RPC listening");

    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "TCP accept failed");
                continue;
            }
        };
        debug!(peer = %peer, "TCP RPC client connected");
        let gateway = Arc::clone(&gateway);
        tokio::spawn(tcp_session(gateway, socket));
    }
}

async fn tcp_session(gateway: Arc<Gateway>, socket: tokio::net::TcpStream) {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut events = gateway.events().subscribe();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(text)) if !text.trim().is_empty() => {
                        let response = handle_request_text(&gateway, &text).await;
                        let mut payload = response.to_string();
                        payload.push('\n');
                        if write_half.write_all(payload.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => break,
                }
            }
            event = events.recv() => {
                if let Ok(event) = event {
                    let mut payload = json!({
                        "jsonrpc": "2.0",
                        "method": "event",
                        "params": event,
                    })
                    .to_string();
                    payload.push('\n');
                    if write_half.write_all(payload.as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
    debug!("TCP RPC client disconnected");
}

/// One connected downstream client: requests in, responses and event
/// notifications out.
async fn client_session(gateway: Arc<Gateway>, mut socket: WebSocket) {
    let mut events = gateway.events().subscribe();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let response = handle_request_text(&gateway, &text).await;
                        let payload = response.to_string();
                        if socket.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket error");
                        break;
                    }
                }
            }
            event = events.recv() => {
                if let Ok(event) = event {
                    let notification = json!({
                        "jsonrpc": "2.0",
                        "method": "event",
                        "params": event,
                    });
                    if socket.send(Message::Text(notification.to_string().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
    debug!("client session closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::state::ChannelInfo;

    fn test_gateway() -> Arc<Gateway> {
        let mut settings = Settings::default();
        settings.mud.name = "TestMUD".to_string();
        settings.gateway.state_dir = tempfile::tempdir()
            .unwrap()
            .keep()
            .to_string_lossy()
            .into_owned();
        settings.router.primary.host = "127.0.0.1".to_string();
        settings.router.primary.port = 1;
        Gateway::new(settings)
    }

    #[tokio::test]
    async fn test_ping() {
        let gateway = test_gateway();
        let result = dispatch(&gateway, "ping", Value::Null).await.unwrap();
        assert_eq!(result, json!("pong"));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let gateway = test_gateway();
        let err = dispatch(&gateway, "teleport", Value::Null).await.unwrap_err();
        assert_eq!(err.0, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_params() {
        let gateway = test_gateway();
        let err = dispatch(&gateway, "tell", json!({"nope": true})).await.unwrap_err();
        assert_eq!(err.0, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_channel_join_and_list() {
        let gateway = test_gateway();
        gateway.state().add_channel(ChannelInfo::new("chat")).await;

        let joined = dispatch(
            &gateway,
            "channel_join",
            json!({"user": "bob", "channel": "chat"}),
        )
        .await
        .unwrap();
        assert_eq!(joined, json!({"joined": true}));

        let listed = dispatch(&gateway, "channel_list", Value::Null).await.unwrap();
        assert_eq!(listed[0]["name"], "chat");

        let who = dispatch(&gateway, "channel_who", json!({"channel": "chat"}))
            .await
            .unwrap();
        assert_eq!(who, json!(["bob"]));
    }

    #[tokio::test]
    async fn test_request_text_roundtrip() {
        let gateway = test_gateway();
        let response = handle_request_text(
            &gateway,
            r#"{"jsonrpc": "2.0", "method": "ping", "id": 7}"#,
        )
        .await;
        assert_eq!(response["result"], json!("pong"));
        assert_eq!(response["id"], json!(7));
    }

    #[tokio::test]
    async fn test_parse_error_response() {
        let gateway = test_gateway();
        let response = handle_request_text(&gateway, "{not json").await;
        assert_eq!(response["error"]["code"], json!(PARSE_ERROR));
    }

    #[tokio::test]
    async fn test_tcp_session_request_response() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let gateway = test_gateway();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                let (socket, _) = listener.accept().await.unwrap();
                tcp_session(gateway, socket).await;
            });
        }

        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = client.into_split();
        write_half
            .write_all(b"{\"jsonrpc\": \"2.0\", \"method\": \"ping\", \"id\": 3}\n")
            .await
            .unwrap();

        let mut lines = BufReader::new(read_half).lines();
        let line = tokio::time::timeout(std::time::Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let response: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(response["result"], json!("pong"));
        assert_eq!(response["id"], json!(3));
    }

    #[test]
    fn test_lpc_to_json() {
        let value = LpcValue::Mapping(vec![
            (LpcValue::string("name"), LpcValue::string("bob")),
            (LpcValue::string("level"), LpcValue::Int(10)),
            (
                LpcValue::string("tags"),
                LpcValue::Array(vec![LpcValue::Int(1), LpcValue::Null]),
            ),
        ]);
        assert_eq!(
            lpc_to_json(&value),
            json!({"name": "bob", "level": 10, "tags": [1, null]})
        );
    }
}
