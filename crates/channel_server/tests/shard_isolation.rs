//! Shard isolation tests.
//!
//! Multiple shards run in one process; shutting one down, breaking one
//! listener, or panicking one handler must never affect any other shard's
//! ability to accept and service connections.

use channel_protocol::frame::opcodes;
use channel_protocol::{read_frame, write_frame, DispatchTable, HandlerError, Opcode};
use channel_server::registry::{ChannelRegistry, LocalRegistry};
use channel_server::repository::MemoryRepository;
use channel_server::server::packets::Pong;
use channel_server::{HandlerContext, Server, ShardConfig};
use futures::FutureExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

const PANIC_OPCODE: Opcode = Opcode(0x9999);

fn test_config(name: &str) -> ShardConfig {
    ShardConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        name: name.to_string(),
        public_addr: format!("{name}.example:54001"),
        ..ShardConfig::default()
    }
}

async fn start_shard(name: &str) -> (Arc<Server>, SocketAddr) {
    let server = Server::with_defaults(test_config(name));
    server.start().await.expect("bind failed");
    let addr = server.local_addr().expect("listener bound");
    (server, addr)
}

async fn dial(addr: SocketAddr) -> std::io::Result<TcpStream> {
    timeout(Duration::from_secs(1), TcpStream::connect(addr))
        .await
        .unwrap_or_else(|_| Err(std::io::Error::other("connect timed out")))
}

/// Polls until the shard has registered `n` sessions.
async fn wait_for_sessions(server: &Arc<Server>, n: usize) {
    timeout(Duration::from_secs(2), async {
        while server.current_players() < n {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sessions never registered");
}

#[tokio::test(flavor = "multi_thread")]
async fn shutting_down_one_shard_leaves_the_rest_accepting() {
    let (s1, a1) = start_shard("channel-1").await;
    let (s2, a2) = start_shard("channel-2").await;
    let (s3, a3) = start_shard("channel-3").await;

    // All three accept before the shutdown
    for addr in [a1, a2, a3] {
        dial(addr).await.expect("shard should accept");
    }

    s1.shutdown();
    // Give the acceptor a moment to drop the listener
    sleep(Duration::from_millis(100)).await;

    assert!(dial(a1).await.is_err(), "dead shard must refuse connections");
    dial(a2).await.expect("live shard 2 must still accept");
    dial(a3).await.expect("live shard 3 must still accept");

    s2.shutdown();
    s3.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn killing_one_listener_leaves_other_shards_accepting() {
    let (s1, a1) = start_shard("channel-1").await;
    let (s2, a2) = start_shard("channel-2").await;

    let mut client = dial(a1).await.expect("accepts before the listener dies");
    wait_for_sessions(&s1, 1).await;

    s1.close_listener();
    sleep(Duration::from_millis(100)).await;

    assert!(dial(a1).await.is_err(), "dead listener must refuse new connections");
    dial(a2).await.expect("sibling shard must keep accepting");

    // Only the listener died: the shard is not shut down and its existing
    // session is still serviced.
    assert!(!s1.is_shut_down());
    write_frame(&mut client, opcodes::PING, &[]).await.unwrap();
    let (opcode, _) = timeout(Duration::from_secs(2), read_frame(&mut client))
        .await
        .expect("existing session should still respond")
        .unwrap()
        .expect("stream open");
    assert_eq!(opcode, opcodes::PONG);

    s1.shutdown();
    s2.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_is_idempotent() {
    let (server, addr) = start_shard("channel-1").await;
    dial(addr).await.expect("accepts before shutdown");

    server.shutdown();
    server.shutdown();
    server.shutdown();
    sleep(Duration::from_millis(100)).await;

    assert!(server.is_shut_down());
    assert!(dial(addr).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn handler_panic_does_not_kill_the_session_or_the_shard() {
    let repo = Arc::new(MemoryRepository::new());
    let dispatch: DispatchTable<HandlerContext> = DispatchTable::builder()
        .register(PANIC_OPCODE, |_ctx, _payload| {
            async move { panic!("handler bug") }.boxed()
        })
        .register(opcodes::PING, |ctx: HandlerContext, _payload| {
            async move {
                ctx.session
                    .queue_send(&Pong)
                    .await
                    .map_err(|_| HandlerError::SessionClosed)
            }
            .boxed()
        })
        .build();
    let server = Server::new(test_config("channel-1"), dispatch, repo.clone(), repo);
    server.start().await.expect("bind failed");
    let addr = server.local_addr().unwrap();

    let mut client = dial(addr).await.expect("accepts");
    wait_for_sessions(&server, 1).await;

    // Trigger the panic, then prove the same session still answers
    write_frame(&mut client, PANIC_OPCODE, &[]).await.unwrap();
    write_frame(&mut client, opcodes::PING, &[]).await.unwrap();
    let (opcode, _) = timeout(Duration::from_secs(2), read_frame(&mut client))
        .await
        .expect("session should still respond")
        .unwrap()
        .expect("stream open");
    assert_eq!(opcode, opcodes::PONG);

    // And the shard still accepts a subsequent connection
    dial(addr).await.expect("shard must keep accepting after a handler panic");

    server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn registry_ignores_shut_down_shards() {
    let repo1 = Arc::new(MemoryRepository::new());
    repo1.insert_token("tok-a", 100, "Aster");
    let s1 = Server::new(
        test_config("channel-1"),
        channel_server::core_dispatch_table(),
        repo1.clone(),
        repo1,
    );
    s1.start().await.unwrap();

    let repo2 = Arc::new(MemoryRepository::new());
    repo2.insert_token("tok-b", 200, "Briar");
    let s2 = Server::new(
        test_config("channel-2"),
        channel_server::core_dispatch_table(),
        repo2.clone(),
        repo2,
    );
    s2.start().await.unwrap();

    let _c1 = dial(s1.local_addr().unwrap()).await.unwrap();
    let _c2 = dial(s2.local_addr().unwrap()).await.unwrap();
    wait_for_sessions(&s1, 1).await;
    wait_for_sessions(&s2, 1).await;

    let sess1 = s1.sessions_snapshot().pop().unwrap();
    s1.login_session(&sess1, "tok-a").await.unwrap();
    let sess2 = s2.sessions_snapshot().pop().unwrap();
    s2.login_session(&sess2, "tok-b").await.unwrap();

    let registry = LocalRegistry::new(vec![s1.clone(), s2.clone()]);
    assert!(registry.find_session_by_char_id(100).is_some());
    assert!(registry.find_session_by_char_id(200).is_some());

    s1.shutdown();

    assert!(
        registry.find_session_by_char_id(100).is_none(),
        "chars on a dead shard must be invisible"
    );
    assert!(registry.find_session_by_char_id(200).is_some());

    let results = registry.search_sessions(&|_| true, 10);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].char_id, 200);

    s2.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_sessions_are_reaped() {
    let config = ShardConfig {
        idle_timeout: Duration::from_millis(200),
        reaper_interval: Duration::from_millis(50),
        ..test_config("channel-1")
    };
    let server = Server::with_defaults(config);
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let mut client = dial(addr).await.unwrap();
    wait_for_sessions(&server, 1).await;

    // Stay silent past the timeout; the reaper should log the session out
    // and the server side of the connection should close.
    timeout(Duration::from_secs(2), async {
        while server.current_players() > 0 {
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("idle session was never reaped");

    let eof = timeout(Duration::from_secs(2), read_frame(&mut client))
        .await
        .expect("server should close the idle connection")
        .unwrap();
    assert!(eof.is_none());

    server.shutdown();
}
