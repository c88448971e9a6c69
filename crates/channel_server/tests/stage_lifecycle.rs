//! Stage transfer and reservation tests over real connections.

use channel_protocol::frame::opcodes;
use channel_protocol::read_frame;
use channel_server::repository::MemoryRepository;
use channel_server::stage::StageId;
use channel_server::{Server, ServerError, ShardConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

struct Harness {
    server: Arc<Server>,
    repo: Arc<MemoryRepository>,
    addr: SocketAddr,
}

async fn start_harness() -> Harness {
    let config = ShardConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        name: "channel-1".to_string(),
        ..ShardConfig::default()
    };
    let repo = Arc::new(MemoryRepository::new());
    let server = Server::new(
        config,
        channel_server::core_dispatch_table(),
        repo.clone(),
        repo.clone(),
    );
    server.start().await.expect("bind failed");
    let addr = server.local_addr().unwrap();
    Harness { server, repo, addr }
}

impl Harness {
    /// Connects a client and logs its session in as `char_id`.
    async fn login(&self, char_id: u32, name: &str) -> (TcpStream, Arc<channel_server::session::Session>) {
        let token = format!("tok-{char_id}");
        self.repo.insert_token(&token, char_id, name);

        let before = self.server.current_players();
        let client = TcpStream::connect(self.addr).await.expect("connect");
        timeout(Duration::from_secs(2), async {
            while self.server.current_players() <= before {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session never registered");

        let session = self
            .server
            .sessions_snapshot()
            .into_iter()
            .find(|s| s.char_id().is_none())
            .expect("fresh session present");
        self.server.login_session(&session, &token).await.expect("login");
        (client, session)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn transfer_always_sends_completion_packet() {
    let harness = start_harness().await;
    let (mut client, session) = harness.login(100, "Aster").await;

    // Destination is empty: there are zero peers and zero objects to
    // describe, but the completion packet must still arrive.
    harness
        .server
        .do_stage_transfer(&session, StageId::from("sl1Qs463p0a0u0"))
        .await
        .expect("transfer");

    let (opcode, payload) = timeout(Duration::from_secs(2), read_frame(&mut client))
        .await
        .expect("completion packet must arrive")
        .unwrap()
        .expect("stream open");
    assert_eq!(opcode, opcodes::TRANSFER_COMPLETE);
    assert_eq!(payload, vec![0, 0], "empty notification still carries its count");

    harness.server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn transfer_moves_session_between_stages() {
    let harness = start_harness().await;
    let (_c1, s1) = harness.login(100, "Aster").await;
    let (_c2, s2) = harness.login(200, "Briar").await;

    let quest = StageId::from("sl1Qs463p0a0u0");
    harness.server.do_stage_transfer(&s1, quest.clone()).await.unwrap();
    harness.server.do_stage_transfer(&s2, quest.clone()).await.unwrap();

    let stage = harness.server.stages().get(&quest).unwrap();
    assert_eq!(stage.client_count(), 2);

    // Moving away removes the session and its objects from the old stage
    stage.spawn_object(100, 0.0, 0.0, 0.0);
    harness
        .server
        .do_stage_transfer(&s1, StageId::from("sl1Ls210p0a0u0"))
        .await
        .unwrap();
    assert_eq!(stage.client_count(), 1);
    assert!(stage.object_by_char(100).is_none());
    assert_eq!(s1.stage_id(), Some(StageId::from("sl1Ls210p0a0u0")));

    harness.server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn back_falls_through_to_home_stage() {
    let harness = start_harness().await;
    let (_client, session) = harness.login(100, "Aster").await;

    // No history yet: "back" lands on the configured home stage
    harness.server.back_to_previous_stage(&session).await.unwrap();
    assert_eq!(session.stage_id(), Some(harness.server.config().home_stage_id.clone()));

    let quest = StageId::from("sl1Qs463p0a0u0");
    harness.server.do_stage_transfer(&session, quest.clone()).await.unwrap();
    assert_eq!(session.stage_id(), Some(quest));

    harness.server.back_to_previous_stage(&session).await.unwrap();
    assert_eq!(session.stage_id(), Some(harness.server.config().home_stage_id.clone()));

    harness.server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_back_keeps_the_history_entry() {
    let harness = start_harness().await;
    let (_c1, s1) = harness.login(100, "Aster").await;
    let (_c2, s2) = harness.login(200, "Briar").await;
    let (_c3, host) = harness.login(300, "Clove").await;

    let quest = StageId::from("sl1Qs903p0a0u0");
    let lobby = StageId::from("sl1Ls210p0a0u0");
    harness.server.create_stage(&host, quest.clone(), 1).expect("create");

    harness.server.do_stage_transfer(&s1, quest.clone()).await.unwrap();
    harness.server.do_stage_transfer(&s1, lobby.clone()).await.unwrap();
    assert_eq!(s1.state().stage_history.last(), Some(&quest));

    // Another session fills the single slot, so going back must fail --
    // and the history entry must survive the failure so a retry still
    // targets the quest stage.
    harness.server.do_stage_transfer(&s2, quest.clone()).await.unwrap();
    let err = harness.server.back_to_previous_stage(&s1).await.unwrap_err();
    assert!(matches!(err, ServerError::StageFull(_)));
    assert_eq!(s1.state().stage_history.last(), Some(&quest));
    assert_eq!(s1.stage_id(), Some(lobby));

    harness.server.do_stage_transfer(&s2, StageId::from("sl1Ls211p0a0u0")).await.unwrap();
    harness.server.back_to_previous_stage(&s1).await.expect("retry succeeds");
    assert_eq!(s1.stage_id(), Some(quest));
    assert!(s1.state().stage_history.is_empty());

    harness.server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn reservation_race_admits_exactly_one() {
    let harness = start_harness().await;
    let (_c1, s1) = harness.login(100, "Aster").await;
    let (_c2, s2) = harness.login(200, "Briar").await;
    let (_c3, host) = harness.login(300, "Clove").await;

    let id = StageId::from("sl1Qs900p0a0u0");
    harness.server.create_stage(&host, id.clone(), 1).expect("create");

    let server_a = harness.server.clone();
    let server_b = harness.server.clone();
    let (id_a, id_b) = (id.clone(), id.clone());
    let sa = s1.clone();
    let sb = s2.clone();
    let (ra, rb) = tokio::join!(
        tokio::spawn(async move { server_a.reserve_stage(&sa, &id_a, None) }),
        tokio::spawn(async move { server_b.reserve_stage(&sb, &id_b, None) }),
    );

    let results = [ra.unwrap(), rb.unwrap()];
    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one racer may win the single slot");
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(ServerError::StageFull(_)))));

    harness.server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn reservation_holder_is_admitted_at_capacity() {
    let harness = start_harness().await;
    let (_c1, s1) = harness.login(100, "Aster").await;
    let (_c2, host) = harness.login(300, "Clove").await;

    let id = StageId::from("sl1Qs901p0a0u0");
    harness.server.create_stage(&host, id.clone(), 1).expect("create");
    harness.server.reserve_stage(&s1, &id, None).expect("reserve");

    // The stage is at capacity through the reservation, but the holder
    // itself must never be rejected by the capacity check.
    harness.server.do_stage_transfer(&s1, id.clone()).await.expect("enter");
    assert!(s1.state().reservation_stage_id.is_none(), "entering consumed the reservation");

    harness.server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_stage_creation_fails_without_overwrite() {
    let harness = start_harness().await;
    let (_c1, s1) = harness.login(100, "Aster").await;
    let (_c2, s2) = harness.login(200, "Briar").await;

    let id = StageId::from("sl1Gs301p0a0u0");
    harness.server.create_stage(&s1, id.clone(), 4).expect("first create");
    let err = harness.server.create_stage(&s2, id.clone(), 8).unwrap_err();
    assert!(matches!(err, ServerError::DuplicateStage(_)));

    let stage = harness.server.stages().get(&id).unwrap();
    assert_eq!(stage.max_players(), 4, "loser must not overwrite the winner");
    assert_eq!(stage.host(), Some(s1.id));

    harness.server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn unlock_evicts_reserved_members_and_deletes_the_stage() {
    let harness = start_harness().await;
    let (mut c1, s1) = harness.login(100, "Aster").await;
    let (_c2, host) = harness.login(300, "Clove").await;

    let id = StageId::from("sl1Qs902p0a0u0");
    harness.server.create_stage(&host, id.clone(), 4).expect("create");
    harness.server.reserve_stage(&s1, &id, None).expect("reserve");

    harness.server.unlock_stage(&id).await;

    let (opcode, _) = timeout(Duration::from_secs(2), read_frame(&mut c1))
        .await
        .expect("destruct notice must arrive")
        .unwrap()
        .expect("stream open");
    assert_eq!(opcode, opcodes::STAGE_DESTRUCT);
    assert!(s1.state().reservation_stage_id.is_none());
    assert!(harness.server.stages().get(&id).is_none());

    harness.server.shutdown();
}
