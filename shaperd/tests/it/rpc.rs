use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use shaperd::{access::AccessMode, rpc, types::Settings};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::{
    codec::{Framed, LinesCodec},
    sync::CancellationToken,
};

use crate::mock::{orchestrator, settings};

async fn call(conn: &mut Framed<TcpStream, LinesCodec>, request: Value) -> Value {
    conn.send(request.to_string()).await.unwrap();
    let line = conn.next().await.unwrap().unwrap();
    serde_json::from_str(&line).unwrap()
}

#[tokio::test]
async fn serves_json_lines() {
    let _ = tracing_subscriber::fmt::try_init();

    let (orch, _) = orchestrator(AccessMode::Secure, (1, 10)).await;
    let orch = Arc::new(orch);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let server = rpc::serve(listener, Arc::clone(&orch), cancel.clone());

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut conn = Framed::new(stream, LinesCodec::new());
    let device = json!({ "controllingIP": "10.0.0.1", "controlledIP": "10.0.0.1" });

    let reply = call(&mut conn, json!({ "method": "isShaped", "params": device })).await;
    assert_eq!(reply, json!({ "result": false }));

    let reply = call(&mut conn, json!({ "method": "getCurrentShaping", "params": device })).await;
    assert_eq!(reply["error"]["code"], "UNKNOWN_IP");

    let wanted = settings(1_000, 30, 1.5);
    let reply = call(
        &mut conn,
        json!({
            "method": "startShaping",
            "params": { "device": device, "settings": wanted, "timeout": 60 }
        }),
    )
    .await;
    assert_eq!(reply, json!({ "result": { "code": "OK" } }));

    let reply = call(&mut conn, json!({ "method": "getCurrentShaping", "params": device })).await;
    let got: Settings = serde_json::from_value(reply["result"].clone()).unwrap();
    assert_eq!(got, wanted);

    let reply = call(&mut conn, json!({ "method": "getShapedDeviceCount" })).await;
    assert_eq!(reply, json!({ "result": 1 }));

    let reply = call(
        &mut conn,
        json!({
            "method": "startShaping",
            "params": {
                "device": { "controllingIP": "10.0.0.300", "controlledIP": "10.0.0.300" },
                "settings": {},
                "timeout": 60
            }
        }),
    )
    .await;
    assert_eq!(reply["result"]["code"], "INVALID_IP");

    let reply =
        call(&mut conn, json!({ "method": "requestToken", "params": { "ip": "10.0.0.2", "duration": 30 } }))
            .await;
    assert_eq!(reply["result"]["token"].as_str().unwrap().len(), 6);
    assert_eq!(reply["result"]["interval"], 60);

    let reply = call(
        &mut conn,
        json!({ "method": "getDevicesControlledBy", "params": { "ip": "10.0.0.1" } }),
    )
    .await;
    assert_eq!(reply, json!({ "result": [] }));

    let reply = call(&mut conn, json!({ "method": "stopShaping", "params": device })).await;
    assert_eq!(reply, json!({ "result": { "code": "OK" } }));

    let reply = call(&mut conn, json!({ "method": "stopShaping", "params": device })).await;
    assert_eq!(reply["result"]["code"], "UNKNOWN_SESSION");

    conn.send("this is not json".to_string()).await.unwrap();
    let reply: Value = serde_json::from_str(&conn.next().await.unwrap().unwrap()).unwrap();
    assert_eq!(reply["error"]["code"], rpc::BAD_REQUEST);

    cancel.cancel();
    server.await.unwrap();

    // The open connection is closed on cancellation too.
    assert!(conn.next().await.is_none());
}

#[tokio::test]
async fn handle_line_without_transport() {
    let (orch, _) = orchestrator(AccessMode::Secure, (1, 10)).await;

    let reply = rpc::handle_line(&orch, r#"{"method":"getShapedDeviceCount","params":null}"#).await;
    assert_eq!(serde_json::from_str::<Value>(&reply).unwrap(), json!({ "result": 0 }));

    let reply = rpc::handle_line(&orch, r#"{"method":"isShaped"}"#).await;
    assert_eq!(serde_json::from_str::<Value>(&reply).unwrap()["error"]["code"], rpc::BAD_REQUEST);
}
