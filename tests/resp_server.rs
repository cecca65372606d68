//! End-to-end tests of the Redis-protocol front-end over real TCP sockets.

use delayq::engine::RedbOptions;
use delayq::server::Server;
use delayq::store::QueueStore;
use std::net::SocketAddr;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct TestServer {
    addr: SocketAddr,
    store: QueueStore,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<std::io::Result<()>>,
    _dir: TempDir,
}

impl TestServer {
    async fn start() -> anyhow::Result<Self> {
        let dir = TempDir::new()?;
        let store = QueueStore::redb(RedbOptions::new(dir.path().join("server.redb")))?;
        let server = Server::bind("127.0.0.1:0", store.clone()).await?;
        let addr = server.local_addr()?;

        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async move {
            let _ = stopped.await;
        }));

        Ok(Self {
            addr,
            store,
            stop: Some(stop),
            handle,
            _dir: dir,
        })
    }

    async fn shutdown(mut self) -> anyhow::Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.handle.await??;
        self.store.close().await?;
        Ok(())
    }
}

/// Send raw bytes and read until `expected` bytes of reply arrived.
async fn roundtrip(stream: &mut TcpStream, request: &[u8], expected: usize) -> anyhow::Result<Vec<u8>> {
    stream.write_all(request).await?;
    let mut reply = vec![0u8; expected];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut reply)).await??;
    Ok(reply)
}

fn command(args: &[&[u8]]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

async fn call(stream: &mut TcpStream, args: &[&[u8]], reply: &[u8]) -> anyhow::Result<()> {
    let got = roundtrip(stream, &command(args), reply.len()).await?;
    assert_eq!(
        String::from_utf8_lossy(&got),
        String::from_utf8_lossy(reply),
        "reply to {:?}",
        args.iter().map(|a| String::from_utf8_lossy(a)).collect::<Vec<_>>()
    );
    Ok(())
}

#[tokio::test]
async fn test_ping_and_inline_commands() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let mut client = TcpStream::connect(server.addr).await?;

    assert_eq!(roundtrip(&mut client, b"PING\r\n", 7).await?, b"+PONG\r\n");
    assert_eq!(roundtrip(&mut client, b"llen nothing\r\n", 4).await?, b":0\r\n");
    call(&mut client, &[b"PING"], b"+PONG\r\n").await?;

    drop(client);
    server.shutdown().await
}

#[tokio::test]
async fn test_delayed_delivery_over_the_wire() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let mut client = TcpStream::connect(server.addr).await?;

    call(&mut client, &[b"SADD", b"mail", b"later", b"300"], b":1\r\n").await?;
    call(&mut client, &[b"SADD", b"mail", b"now", b"0"], b":1\r\n").await?;
    call(&mut client, &[b"LLEN", b"mail"], b":2\r\n").await?;

    call(&mut client, &[b"SPOP", b"mail", b"10"], b"*1\r\n$3\r\nnow\r\n").await?;
    call(&mut client, &[b"SPOP", b"mail"], b"*0\r\n").await?;

    tokio::time::sleep(Duration::from_millis(400)).await;
    call(&mut client, &[b"SPOP", b"mail"], b"*1\r\n$5\r\nlater\r\n").await?;

    call(&mut client, &[b"KEYS", b"*"], b"*1\r\n$4\r\nmail\r\n").await?;
    call(&mut client, &[b"DEL", b"mail"], b":0\r\n").await?;
    call(&mut client, &[b"KEYS"], b"*0\r\n").await?;

    drop(client);
    server.shutdown().await
}

#[tokio::test]
async fn test_error_replies() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let mut client = TcpStream::connect(server.addr).await?;

    call(&mut client, &[b"SADD"], b"-ERR queue name missing\r\n").await?;
    call(
        &mut client,
        &[b"SADD", b"q"],
        b"-ERR element and delay duration missing\r\n",
    )
    .await?;
    call(&mut client, &[b"SADD", b"q", b"x"], b"-ERR delay milliseconds missing\r\n").await?;
    call(
        &mut client,
        &[b"FLUSHALL"],
        b"-ERR unknown command 'FLUSHALL'\r\n",
    )
    .await?;
    call(&mut client, &[b"SPOP", b"q", b"-1"], b"*0\r\n").await?;

    // The connection is still usable after errors.
    call(&mut client, &[b"PING"], b"+PONG\r\n").await?;

    drop(client);
    server.shutdown().await
}

#[tokio::test]
async fn test_pipelined_requests_answered_in_order() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let mut client = TcpStream::connect(server.addr).await?;

    let mut batch = Vec::new();
    for i in 0..3 {
        batch.extend(command(&[b"SADD", b"pipe", format!("m{i}").as_bytes(), b"0"]));
    }
    batch.extend(command(&[b"LLEN", b"pipe"]));
    batch.extend(b"PING\r\n");

    let expected = b":1\r\n:1\r\n:1\r\n:3\r\n+PONG\r\n";
    assert_eq!(roundtrip(&mut client, &batch, expected.len()).await?, expected);

    drop(client);
    server.shutdown().await
}

#[tokio::test]
async fn test_quit_closes_connection() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let mut client = TcpStream::connect(server.addr).await?;

    assert_eq!(roundtrip(&mut client, b"QUIT\r\n", 5).await?, b"+OK\r\n");
    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest)).await??;
    assert_eq!(read, 0);

    server.shutdown().await
}

#[tokio::test]
async fn test_shutdown_closes_idle_connections() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let mut client = TcpStream::connect(server.addr).await?;
    call(&mut client, &[b"SADD", b"q", b"kept", b"0"], b":1\r\n").await?;

    let store = server.store.clone();
    server.shutdown().await?;

    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest)).await??;
    assert_eq!(read, 0);
    assert!(store.len(b"q").await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_concurrent_clients_share_one_queue() -> anyhow::Result<()> {
    let server = TestServer::start().await?;

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let addr = server.addr;
            tokio::spawn(async move {
                let mut client = TcpStream::connect(addr).await?;
                for i in 0..25 {
                    let payload = format!("{p}-{i}");
                    call(&mut client, &[b"SADD", b"shared", payload.as_bytes(), b"0"], b":1\r\n")
                        .await?;
                }
                anyhow::Ok(())
            })
        })
        .collect();
    for producer in producers {
        producer.await??;
    }

    let mut client = TcpStream::connect(server.addr).await?;
    call(&mut client, &[b"LLEN", b"shared"], b":100\r\n").await?;
    assert_eq!(server.store.pop(b"shared", 1000).await?.len(), 100);

    drop(client);
    server.shutdown().await
}
