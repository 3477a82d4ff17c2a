//! Socket-level tests: a real listener, real WebSocket clients.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use assist_hub::auth::{hash_password, LogMailer};
use assist_hub::config::Config;
use assist_hub::server::Server;
use assist_hub::store::MemoryStore;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(3);

fn seed(dir: &TempDir) {
    let accounts = json!([
        {
            "userID": "field1",
            "passwordHash": hash_password("pw"),
            "area": [1],
            "isFrontline": true,
        },
        {
            "userID": "expert",
            "passwordHash": hash_password("pw"),
            "area": [1],
            "isExpert": true,
        },
    ]);
    let areas = json!([{ "id": 1, "name": "Plant A" }]);
    std::fs::write(dir.path().join("accounts.json"), accounts.to_string()).unwrap();
    std::fs::write(dir.path().join("areas.json"), areas.to_string()).unwrap();
}

async fn start_with(cfg: Config) -> (String, TempDir, Arc<Server>) {
    let dir = TempDir::new().unwrap();
    seed(&dir);
    let store = MemoryStore::open(dir.path()).unwrap();
    let (srv, _hub) = Server::start(cfg, Arc::new(store), Arc::new(LogMailer));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(srv.clone().serve(listener));
    (format!("ws://{addr}"), dir, srv)
}

async fn start(idle_timeout_secs: u64) -> (String, TempDir) {
    let cfg = Config {
        idle_timeout_secs,
        ..Config::default()
    };
    let (url, dir, _) = start_with(cfg).await;
    (url, dir)
}

async fn connect(url: &str) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, v: Value) {
    ws.send(Message::Text(v.to_string())).await.unwrap();
}

/// Next JSON frame, or None once the server has closed the socket.
async fn recv(ws: &mut Ws) -> Option<Value> {
    loop {
        let frame = tokio::time::timeout(WAIT, ws.next()).await.expect("no frame in time");
        match frame {
            Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(&text).unwrap()),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

async fn recv_command(ws: &mut Ws, command: i32) -> Value {
    loop {
        let v = recv(ws).await.expect("socket closed");
        if v["command"] == command {
            return v;
        }
    }
}

/// Reads up to the response for `command`, keeping everything pushed before it.
async fn recv_response(ws: &mut Ws, command: i32, pushed: &mut Vec<Value>) -> Value {
    loop {
        let v = recv(ws).await.expect("socket closed");
        if v["command"] == command && v["commandType"] == 2 {
            return v;
        }
        pushed.push(v);
    }
}

fn lists_only(v: &Value, device: &str) -> bool {
    v["command"] == 20
        && v["devices"]
            .as_array()
            .is_some_and(|d| d.len() == 1 && d[0]["deviceID"] == device)
}

fn login(user: &str, device: &str, device_type: u8) -> Value {
    json!({
        "command": 1, "commandType": 1, "transactionID": format!("login-{device}"),
        "userID": user, "userPassword": "pw",
        "deviceID": device, "deviceBrand": "acme", "deviceType": device_type,
    })
}

fn cmd(command: i32, extra: Value) -> Value {
    let mut v = json!({
        "command": command,
        "commandType": 1,
        "transactionID": format!("tx-{command}"),
    });
    if let (Some(obj), Some(extra)) = (v.as_object_mut(), extra.as_object()) {
        obj.extend(extra.clone());
    }
    v
}

async fn logged_in(url: &str, user: &str, device: &str, device_type: u8) -> Ws {
    let mut ws = connect(url).await;
    send(&mut ws, login(user, device, device_type)).await;
    let resp = recv_command(&mut ws, 1).await;
    assert_eq!(resp["resultCode"], 0, "login failed: {resp}");
    // Own login announcement.
    recv_command(&mut ws, 20).await;
    ws
}

#[tokio::test]
async fn help_answer_and_media_between_glasses_and_tablet() {
    let (url, _dir) = start(0).await;
    let mut glasses = logged_in(&url, "field1", "g1", 1).await;
    let mut tablet = logged_in(&url, "expert", "t1", 2).await;
    // The tablet's arrival reaches the glasses.
    let list = recv_command(&mut glasses, 20).await;
    assert_eq!(list["devices"].as_array().unwrap().len(), 2);

    send(&mut glasses, cmd(4, json!({ "roomID": 0 }))).await;
    let resp = recv_command(&mut glasses, 4).await;
    assert_eq!(resp["resultCode"], 0);
    let room = resp["roomID"].as_i64().unwrap();
    assert!(room > 0);

    let list = recv_command(&mut tablet, 20).await;
    let g1 = list["devices"]
        .as_array()
        .unwrap()
        .iter()
        .find(|d| d["deviceID"] == "g1")
        .cloned()
        .unwrap();
    assert_eq!(g1["deviceStatus"], 1);
    assert_eq!(g1["roomID"], room);

    send(&mut tablet, cmd(5, json!({ "deviceID": "g1", "deviceBrand": "acme" }))).await;
    let resp = recv_command(&mut tablet, 5).await;
    assert_eq!(resp["resultCode"], 0);
    assert_eq!(resp["roomID"], room);

    let list = recv_command(&mut glasses, 20).await;
    for d in list["devices"].as_array().unwrap() {
        assert_eq!(d["deviceStatus"], 2);
        assert_eq!(d["roomID"], room);
    }

    send(&mut tablet, cmd(6, json!({ "cameraStatus": 1, "micStatus": 1 }))).await;
    assert_eq!(recv_command(&mut tablet, 6).await["resultCode"], 0);
    let media = recv_command(&mut glasses, 21).await;
    assert_eq!(media["device"]["deviceID"], "t1");
    assert_eq!(media["device"]["cameraStatus"], 1);
    assert_eq!(media["roomID"], room);
}

#[tokio::test]
async fn second_login_displaces_first_socket() {
    let (url, _dir) = start(0).await;
    let mut first = logged_in(&url, "field1", "g1", 1).await;
    let mut second = logged_in(&url, "field1", "g1", 1).await;

    let notice = recv_command(&mut first, 22).await;
    assert_eq!(notice["commandType"], 3);
    while recv(&mut first).await.is_some() {}

    send(&mut second, cmd(9, json!({}))).await;
    assert_eq!(recv_command(&mut second, 9).await["resultCode"], 0);
}

#[tokio::test]
async fn dropped_socket_goes_offline_for_its_area() {
    let (url, _dir) = start(0).await;
    let glasses = logged_in(&url, "field1", "g1", 1).await;
    let mut tablet = logged_in(&url, "expert", "t1", 2).await;

    drop(glasses);
    let list = recv_command(&mut tablet, 20).await;
    let ids: Vec<&str> = list["devices"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["deviceID"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["t1"]);
}

#[tokio::test]
async fn idle_connection_is_logged_out() {
    let (url, _dir) = start(1).await;
    let mut ws = logged_in(&url, "field1", "g1", 1).await;

    let notice = recv_command(&mut ws, 23).await;
    assert_eq!(notice["results"], "idle timeout");
    while recv(&mut ws).await.is_some() {}
}

#[tokio::test]
async fn binary_frames_get_a_failure() {
    let (url, _dir) = start(0).await;
    let mut ws = connect(&url).await;
    ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    let resp = recv(&mut ws).await.unwrap();
    assert_eq!(resp["resultCode"], 1);

    send(&mut ws, cmd(9, json!({}))).await;
    assert_eq!(recv(&mut ws).await.unwrap()["results"], "not logged in");
}

#[tokio::test]
async fn login_persists_device_area() {
    let (url, dir) = start(0).await;
    let _ws = logged_in(&url, "field1", "g1", 1).await;

    let text = std::fs::read_to_string(dir.path().join("devices.json")).unwrap();
    let devices: Vec<Value> = serde_json::from_str(&text).unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0]["deviceID"], "g1");
    assert_eq!(devices[0]["area"], json!([1]));
}

#[tokio::test]
async fn peer_that_stops_reading_is_torn_down() {
    let cfg = Config {
        idle_timeout_secs: 0,
        send_buffer: 2,
        ..Config::default()
    };
    let (url, _dir, srv) = start_with(cfg).await;
    let mut glasses = logged_in(&url, "field1", "g1", 1).await;
    let mut tablet = logged_in(&url, "expert", "t1", 2).await;
    recv_command(&mut glasses, 20).await;
    assert_eq!(srv.hub().count().await.unwrap(), 2);

    // The tablet reads nothing from here on while big device lists pile up.
    let pic = "x".repeat(512 * 1024);
    let mut pushed = Vec::new();
    for _ in 0..40 {
        send(&mut glasses, cmd(4, json!({ "pic": pic.as_str() }))).await;
        assert_eq!(recv_response(&mut glasses, 4, &mut pushed).await["resultCode"], 0);
        send(&mut glasses, cmd(7, json!({}))).await;
        assert_eq!(recv_response(&mut glasses, 7, &mut pushed).await["resultCode"], 0);
        if srv.registry().len().await == 1 {
            break;
        }
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while srv.registry().len().await > 1 || srv.hub().count().await.unwrap() > 1 {
        assert!(Instant::now() < deadline, "stalled peer still registered");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    if !pushed.iter().any(|v| lists_only(v, "g1")) {
        loop {
            let v = recv(&mut glasses).await.expect("socket closed");
            if lists_only(&v, "g1") {
                break;
            }
        }
    }

    // Whatever the kernel buffered drains, then the server side is gone.
    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        while recv(&mut tablet).await.is_some() {}
    })
    .await;
    assert!(drained.is_ok(), "stalled peer's socket never closed");

    send(&mut glasses, cmd(9, json!({}))).await;
    assert_eq!(recv_command(&mut glasses, 9).await["resultCode"], 0);
}
