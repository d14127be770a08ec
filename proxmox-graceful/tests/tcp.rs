use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use proxmox_graceful::{Connection, Error, ServerProcess, ServerState};

mod common;
use common::config;

async fn echo_line(conn: Connection) -> Result<(), anyhow::Error> {
    let mut stream = BufReader::new(conn.stream);
    let mut line = String::new();
    stream.read_line(&mut line).await?;
    stream.get_mut().write_all(line.as_bytes()).await?;
    Ok(())
}

async fn request(stream: &mut TcpStream, line: &str) -> String {
    let (reader, mut writer) = stream.split();
    writer.write_all(line.as_bytes()).await.unwrap();
    let mut reply = String::new();
    BufReader::new(reader).read_line(&mut reply).await.unwrap();
    reply
}

#[tokio::test]
async fn serve_and_stop() {
    let server = ServerProcess::new(config(Duration::from_secs(5)), echo_line).graceful(false);
    let handle = server.handle();
    let run = tokio::spawn(server.run());

    handle.wait_for_state(ServerState::Serving).await;
    assert_eq!(handle.is_inherited(), Some(false));
    let addr = handle.local_addr().unwrap();
    assert!(addr.ip().is_loopback());
    assert_ne!(addr.port(), 0);

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert_eq!(request(&mut client, "ping\n").await, "ping\n");

    handle.stop().await.unwrap();
    run.await.unwrap().unwrap();

    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn failed_spawn_keeps_serving() {
    let server = ServerProcess::new(
        config(Duration::from_secs(5)).executable("/nonexistent/graceful-successor"),
        echo_line,
    )
    .graceful(false);
    let handle = server.handle();
    let run = tokio::spawn(server.run());
    handle.wait_for_state(ServerState::Serving).await;
    let addr = handle.local_addr().unwrap();

    let result = handle.reload().await;
    assert!(matches!(result, Err(Error::Spawn(_))), "{result:?}");
    assert_eq!(handle.state(), ServerState::Serving);

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert_eq!(request(&mut client, "still here\n").await, "still here\n");

    handle.stop().await.unwrap();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn successful_reload_stops_the_server() {
    let server = ServerProcess::new(config(Duration::from_secs(5)).executable("true"), echo_line)
        .graceful(false);
    let handle = server.handle();
    let run = tokio::spawn(server.run());
    handle.wait_for_state(ServerState::Serving).await;

    handle.reload().await.unwrap();
    assert_eq!(handle.state(), ServerState::Terminated);
    run.await.unwrap().unwrap();

    // nothing left to reload
    assert!(matches!(
        handle.reload().await,
        Err(Error::NotServing(ServerState::Terminated))
    ));
}

#[tokio::test]
async fn address_in_use_fails_run() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = taken.local_addr().unwrap().to_string();

    let server = ServerProcess::new(config(Duration::from_secs(1)).address(address), echo_line)
        .graceful(false);
    let handle = server.handle();

    let result = server.run().await;
    assert!(matches!(result, Err(Error::Bind { .. })), "{result:?}");
    assert_eq!(handle.state(), ServerState::Created);
}
