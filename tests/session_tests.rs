//! Minion session lifecycle against masters on the in-memory network:
//! reconnect backoff, failover, DNS handling, key pinning and re-auth.

mod test_harness;

use std::sync::Arc;
use std::time::Duration;

use brine::config::MasterType;
use brine::error::BrineError;
use brine::master::{Master, PublishRequest, TargetType};
use brine::minion::{SessionEvent, SessionState};
use brine::pki::{Identity, KeyState};
use brine::transport::MemoryNetwork;
use test_harness::{
    assert_eventually, spawn_silent_master, test_master_config, test_minion_config,
    wait_for_event, TestMaster, TestMinion,
};

fn transition(master: &str, state: SessionState) -> SessionEvent {
    SessionEvent::Transition {
        master: master.to_string(),
        state,
    }
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_waits_follow_backoff_schedule() {
    let network = MemoryNetwork::new();
    let config = test_minion_config("web1", &["m1"], MasterType::Str);
    let mut minion = TestMinion::start(&network, config).await;

    let mut waits = Vec::new();
    while waits.len() < 5 {
        match wait_for_event(&mut minion.events, Duration::from_secs(60), |e| {
            matches!(e, SessionEvent::Backoff { .. })
        })
        .await
        {
            Some(SessionEvent::Backoff { wait, .. }) => waits.push(wait.as_millis() as u64),
            other => panic!("expected a backoff event, got {:?}", other),
        }
    }
    assert_eq!(waits, vec![1000, 2000, 4000, 8000, 1000]);

    let session = minion.sessions.session("m1").await.unwrap();
    assert!(!session.master.alive);
    assert!(session.reconnect_attempt >= 5);
    assert!(network.connect_attempts("m1") >= 5);

    minion.stop().await.unwrap();
}

#[tokio::test]
async fn test_failover_skips_unreachable_master_without_waiting() {
    let network = MemoryNetwork::new();
    let master_b = TestMaster::start(&network, "b", test_master_config("b"));

    let config = test_minion_config("web1", &["a", "b"], MasterType::Failover);
    let mut minion = TestMinion::start(&network, config).await;

    let mut seen = Vec::new();
    let connected = wait_for_event(&mut minion.events, Duration::from_secs(5), |e| {
        seen.push(e.clone());
        *e == transition("b", SessionState::Connected)
    })
    .await;
    assert!(connected.is_some(), "never connected to b: {:?}", seen);

    assert_eq!(
        seen,
        vec![
            transition("a", SessionState::Disconnected),
            transition("a", SessionState::Resolving),
            transition("a", SessionState::Authenticating),
            transition("a", SessionState::Failed),
            transition("b", SessionState::Resolving),
            transition("b", SessionState::Authenticating),
            transition("b", SessionState::Connected),
        ]
    );
    assert_eq!(network.connect_attempts("a"), 1);
    assert_eq!(master_b.connected().await, vec!["web1".to_string()]);

    minion.stop().await.unwrap();
    master_b.stop().await;
}

#[tokio::test]
async fn test_failover_moves_past_unresolvable_master() {
    let network = MemoryNetwork::new();
    network.set_unresolvable("a", true);
    let master_b = TestMaster::start(&network, "b", test_master_config("b"));

    let config = test_minion_config("web1", &["a", "b"], MasterType::Failover);
    let mut minion = TestMinion::start(&network, config).await;

    assert!(
        minion
            .wait_for_state("b", SessionState::Connected, Duration::from_secs(5))
            .await
    );
    assert_eq!(network.connect_attempts("a"), 0);

    minion.stop().await.unwrap();
    master_b.stop().await;
}

#[tokio::test]
async fn test_failover_returns_to_first_master_after_loss() {
    let network = MemoryNetwork::new();
    let master_a = TestMaster::start(&network, "a", test_master_config("a"));
    let master_b = TestMaster::start(&network, "b", test_master_config("b"));

    let config = test_minion_config("web1", &["a", "b"], MasterType::Failover);
    let mut minion = TestMinion::start(&network, config).await;
    assert!(
        minion
            .wait_for_state("a", SessionState::Connected, Duration::from_secs(5))
            .await
    );
    assert!(master_b.connected().await.is_empty());

    master_a.stop().await;
    assert!(
        minion
            .wait_for_state("b", SessionState::Connected, Duration::from_secs(5))
            .await
    );

    minion.stop().await.unwrap();
    master_b.stop().await;
}

#[tokio::test]
async fn test_unresolvable_everywhere_is_fatal() {
    let network = MemoryNetwork::new();
    network.set_unresolvable("a", true);
    network.set_unresolvable("b", true);

    let config = test_minion_config("web1", &["a", "b"], MasterType::Failover);
    let minion = TestMinion::start(&network, config).await;

    let outcome = tokio::time::timeout(Duration::from_secs(30), minion.sessions.join())
        .await
        .expect("sessions should end on their own");
    assert!(matches!(outcome, Err(BrineError::Resolution { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_retry_dns_count_bounds_dns_retries() {
    let network = MemoryNetwork::new();
    network.set_unresolvable("m1", true);

    let mut config = test_minion_config("web1", &["m1"], MasterType::Str);
    config.retry_dns = 30;
    config.retry_dns_count = Some(2);
    let mut minion = TestMinion::start(&network, config).await;

    let mut resolving = 0;
    let events = &mut minion.events;
    while wait_for_event(events, Duration::from_secs(120), |e| {
        *e == transition("m1", SessionState::Resolving)
    })
    .await
    .is_some()
    {
        resolving += 1;
    }
    // The first attempt plus two retries.
    assert_eq!(resolving, 3);

    let outcome = minion.sessions.join().await;
    assert!(matches!(outcome, Err(BrineError::Resolution { .. })));
}

#[tokio::test]
async fn test_master_finger_mismatch_is_security_violation() {
    let network = MemoryNetwork::new();
    let master = TestMaster::start(&network, "m1", test_master_config("m1"));

    let mut config = test_minion_config("web1", &["m1"], MasterType::Str);
    config.master_finger = Some("00:11:22".into());
    let minion = TestMinion::start(&network, config).await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), minion.sessions.join())
        .await
        .expect("sessions should end on their own");
    assert!(matches!(outcome, Err(BrineError::SecurityViolation(_))));

    let registry = master.master.dispatcher().registry().clone();
    assert_eventually(
        || {
            let registry = registry.clone();
            async move { registry.read().await.connected().is_empty() }
        },
        Duration::from_secs(5),
        "refused session should not stay connected",
    )
    .await;

    master.stop().await;
}

#[tokio::test]
async fn test_master_finger_match_connects() {
    let network = MemoryNetwork::new();
    let master = TestMaster::start(&network, "m1", test_master_config("m1"));

    let mut config = test_minion_config("web1", &["m1"], MasterType::Str);
    config.master_finger = Some(master.master.identity().fingerprint().to_uppercase());
    let mut minion = TestMinion::start(&network, config).await;

    assert!(
        minion
            .wait_for_state("m1", SessionState::Connected, Duration::from_secs(5))
            .await
    );

    minion.stop().await.unwrap();
    master.stop().await;
}

#[tokio::test]
async fn test_signed_master_key_is_verified() {
    let network = MemoryNetwork::new();
    let signer = Identity::generate("m1");
    let master = Master::in_memory(test_master_config("m1")).with_signing_key(&signer);
    let master = TestMaster::start_with(&network, "m1", master);

    let mut config = test_minion_config("web1", &["m1"], MasterType::Str);
    config.verify_master_pubkey_sign = true;
    let sign_key = signer.public_key().to_vec();
    let mut minion =
        TestMinion::start_with(&network, config, |m| m.with_master_sign_key(sign_key)).await;
    assert!(
        minion
            .wait_for_state("m1", SessionState::Connected, Duration::from_secs(5))
            .await
    );
    minion.stop().await.unwrap();

    // A different signing key does not vouch for this master.
    let mut config = test_minion_config("web2", &["m1"], MasterType::Str);
    config.verify_master_pubkey_sign = true;
    let wrong = Identity::generate("other").public_key().to_vec();
    let minion = TestMinion::start_with(&network, config, |m| m.with_master_sign_key(wrong)).await;
    let outcome = tokio::time::timeout(Duration::from_secs(5), minion.sessions.join())
        .await
        .expect("sessions should end on their own");
    assert!(matches!(outcome, Err(BrineError::SecurityViolation(_))));

    master.stop().await;
}

#[tokio::test]
async fn test_unsigned_master_fails_signature_verification() {
    let network = MemoryNetwork::new();
    let master = TestMaster::start(&network, "m1", test_master_config("m1"));

    let mut config = test_minion_config("web1", &["m1"], MasterType::Str);
    config.verify_master_pubkey_sign = true;
    let sign_key = Identity::generate("sign").public_key().to_vec();
    let minion = TestMinion::start_with(&network, config, |m| m.with_master_sign_key(sign_key)).await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), minion.sessions.join())
        .await
        .expect("sessions should end on their own");
    assert!(matches!(outcome, Err(BrineError::SecurityViolation(_))));

    master.stop().await;
}

#[tokio::test]
async fn test_changed_master_key_is_refused() {
    let network = MemoryNetwork::new();
    let first = spawn_silent_master(&network, "m1", Identity::generate("m1"));

    let config = test_minion_config("web1", &["m1"], MasterType::Str);
    let mut minion = TestMinion::start(&network, config).await;
    assert!(
        minion
            .wait_for_state("m1", SessionState::Connected, Duration::from_secs(5))
            .await
    );

    // Same address, different key.
    first.abort();
    let _ = first.await;
    let second = spawn_silent_master(&network, "m1", Identity::generate("m1"));

    let outcome = tokio::time::timeout(Duration::from_secs(10), minion.sessions.join())
        .await
        .expect("sessions should end on their own");
    assert!(matches!(outcome, Err(BrineError::SecurityViolation(_))));
    second.abort();
}

#[tokio::test]
async fn test_changed_master_key_accepted_in_open_mode() {
    let network = MemoryNetwork::new();
    let first = spawn_silent_master(&network, "m1", Identity::generate("m1"));

    let mut config = test_minion_config("web1", &["m1"], MasterType::Str);
    config.open_mode = true;
    let mut minion = TestMinion::start(&network, config).await;
    assert!(
        minion
            .wait_for_state("m1", SessionState::Connected, Duration::from_secs(5))
            .await
    );

    first.abort();
    let _ = first.await;
    let second = spawn_silent_master(&network, "m1", Identity::generate("m1"));

    assert!(
        minion
            .wait_for_state("m1", SessionState::Connected, Duration::from_secs(10))
            .await
    );
    minion.stop().await.unwrap();
    second.abort();
}

#[tokio::test]
async fn test_liveness_probe_detects_silent_master() {
    let network = MemoryNetwork::new();
    let silent = spawn_silent_master(&network, "m1", Identity::generate("m1"));

    let mut config = test_minion_config("web1", &["m1"], MasterType::Str);
    config.master_alive_interval = 1;
    config.auth_timeout = 1;
    let mut minion = TestMinion::start(&network, config).await;

    assert!(
        minion
            .wait_for_state("m1", SessionState::Connected, Duration::from_secs(5))
            .await
    );
    assert!(
        minion
            .wait_for_state("m1", SessionState::Failed, Duration::from_secs(5))
            .await,
        "unanswered probe should fail the session"
    );

    minion.stop().await.unwrap();
    silent.abort();
}

#[tokio::test]
async fn test_liveness_probe_keeps_healthy_session() {
    let network = MemoryNetwork::new();
    let master = TestMaster::start(&network, "m1", test_master_config("m1"));

    let mut config = test_minion_config("web1", &["m1"], MasterType::Str);
    config.master_alive_interval = 1;
    config.auth_timeout = 1;
    let mut minion = TestMinion::start(&network, config).await;
    assert!(
        minion
            .wait_for_state("m1", SessionState::Connected, Duration::from_secs(5))
            .await
    );

    assert!(
        !minion
            .wait_for_state("m1", SessionState::Failed, Duration::from_millis(3500))
            .await,
        "answered probes must not fail the session"
    );
    let session = minion.sessions.session("m1").await.unwrap();
    assert!(session.master.alive);

    minion.stop().await.unwrap();
    master.stop().await;
}

#[tokio::test]
async fn test_pending_key_connects_after_operator_accepts() {
    let network = MemoryNetwork::new();
    let master = TestMaster::start(&network, "m1", test_master_config("m1").with_auto_accept(false));

    let config = test_minion_config("web1", &["m1"], MasterType::Str);
    let mut minion = TestMinion::start(&network, config).await;

    let keys = master.master.keys().clone();
    assert_eventually(
        || {
            let keys = keys.clone();
            async move { keys.read().await.state("web1") == Some(KeyState::Pending) }
        },
        Duration::from_secs(5),
        "minion key should be pending",
    )
    .await;

    master.master.keys().write().await.accept("web1");
    assert!(
        minion
            .wait_for_state("m1", SessionState::Connected, Duration::from_secs(5))
            .await
    );

    minion.stop().await.unwrap();
    master.stop().await;
}

#[tokio::test]
async fn test_rekey_triggers_reauthentication() {
    let network = MemoryNetwork::new();
    let master = TestMaster::start(&network, "m1", test_master_config("m1"));

    let config = test_minion_config("web1", &["m1"], MasterType::Str);
    let mut minion = TestMinion::start(&network, config).await;
    assert!(
        minion
            .wait_for_state("m1", SessionState::Connected, Duration::from_secs(5))
            .await
    );

    assert_eq!(master.master.dispatcher().rotate_session_key().await, 1);
    let rekey = wait_for_event(&mut minion.events, Duration::from_secs(5), |e| {
        matches!(e, SessionEvent::Rekey { .. })
    })
    .await;
    assert_eq!(
        rekey,
        Some(SessionEvent::Rekey {
            master: "m1".into(),
            delay: Duration::ZERO
        })
    );
    assert!(
        minion
            .wait_for_state("m1", SessionState::Connected, Duration::from_secs(5))
            .await
    );

    minion.stop().await.unwrap();
    master.stop().await;
}

#[tokio::test]
async fn test_publication_during_rekey_is_executed() {
    let network = MemoryNetwork::new();
    let master = TestMaster::start(&network, "m1", test_master_config("m1"));

    let config = test_minion_config("web1", &["m1"], MasterType::Str);
    let mut minion = TestMinion::start(&network, config).await;
    assert!(
        minion
            .wait_for_state("m1", SessionState::Connected, Duration::from_secs(5))
            .await
    );

    // The publication is sealed with the new key and reaches the minion while
    // it is still re-authenticating.
    let dispatcher = master.master.dispatcher();
    assert_eq!(dispatcher.rotate_session_key().await, 1);
    let result = dispatcher
        .publish(PublishRequest::new("test.ping", "web1", TargetType::List))
        .await
        .unwrap();
    assert_eq!(result.delivered, 1);

    let cache = dispatcher.cache().clone();
    let jid = result.jid.clone();
    assert_eventually(
        || {
            let cache = cache.clone();
            let jid = jid.clone();
            async move {
                cache
                    .read()
                    .await
                    .lookup(&jid)
                    .map(|job| job.is_complete())
                    .unwrap_or(false)
            }
        },
        Duration::from_secs(5),
        "publication sent across a rekey should still return",
    )
    .await;
    let job = cache.read().await.lookup(&result.jid).unwrap();
    assert_eq!(job.returns["web1"].payload, serde_json::json!(true));

    minion.stop().await.unwrap();
    master.stop().await;
}

#[tokio::test]
async fn test_multi_master_sessions_are_independent() {
    let network = MemoryNetwork::new();
    let m1 = TestMaster::start(&network, "m1", test_master_config("m1"));
    let m2 = TestMaster::start(&network, "m2", test_master_config("m2"));

    // A plain list of masters runs one session per master.
    let config = test_minion_config("web1", &["m1", "m2"], MasterType::Str);
    let minion = TestMinion::start(&network, config).await;

    for master in [&m1, &m2] {
        let registry = master.master.dispatcher().registry().clone();
        assert_eventually(
            || {
                let registry = registry.clone();
                async move { registry.read().await.connected() == vec!["web1".to_string()] }
            },
            Duration::from_secs(5),
            "minion should be connected to every master",
        )
        .await;
    }

    m1.stop().await;
    let sessions = &minion.sessions;
    assert_eventually(
        || async move {
            sessions
                .session("m1")
                .await
                .map(|s| s.state != SessionState::Connected)
                .unwrap_or(false)
        },
        Duration::from_secs(5),
        "session to the stopped master should leave Connected",
    )
    .await;
    assert_eq!(
        minion.sessions.session("m2").await.map(|s| s.state),
        Some(SessionState::Connected)
    );

    minion.stop().await.unwrap();
    m2.stop().await;
}

#[tokio::test]
async fn test_func_mode_asks_resolver_for_master() {
    let network = MemoryNetwork::new();
    let master = TestMaster::start(&network, "dynamic", test_master_config("dynamic"));

    let config = test_minion_config("web1", &[], MasterType::Func);
    let resolver = Arc::new(|| Ok::<_, BrineError>("dynamic".to_string()));
    let mut minion = TestMinion::start_with(&network, config, |m| m.with_resolver(resolver)).await;

    assert!(
        minion
            .wait_for_state("dynamic", SessionState::Connected, Duration::from_secs(5))
            .await
    );

    minion.stop().await.unwrap();
    master.stop().await;
}
