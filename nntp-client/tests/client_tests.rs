//! Integration tests against the in-process mock NNTP server

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use nntp_client::{
    AdmissionLimits, ArticleFetcher, CheckOutcome, ConnectionPool, Error, MsgId, PoolConfig,
    Provider, ProviderRole, UsageContext, UsageKind,
};
use test_utils::MockNntpServer;

fn provider_for(server: &MockNntpServer, index: usize, role: ProviderRole, max: usize) -> Provider {
    Provider {
        index,
        host: server.host(),
        port: server.port(),
        tls: false,
        username: None,
        password: None,
        max_connections: max,
        role,
    }
}

fn limits(streaming: usize, queue: usize, healthcheck: usize) -> AdmissionLimits {
    AdmissionLimits {
        streaming,
        queue,
        healthcheck,
    }
}

fn pool_for(providers: Vec<Provider>, limits: AdmissionLimits) -> Arc<ConnectionPool> {
    ConnectionPool::new(providers, limits, PoolConfig::default()).unwrap()
}

#[tokio::test]
async fn test_fetch_happy_path_with_auth() {
    let server = MockNntpServer::start().await;
    server.require_auth("user", "secret");
    let payload = test_utils::segment_payload(1, 0, 700_000);
    server.add_article("<a@test>", &payload);

    let mut provider = provider_for(&server, 0, ProviderRole::Pool, 5);
    provider.username = Some("user".to_string());
    provider.password = Some("secret".to_string());

    let pool = pool_for(vec![provider], limits(10, 5, 2));
    let fetcher = ArticleFetcher::new(pool);

    let ctx = UsageContext::streaming("job");
    let cancel = CancellationToken::new();
    let bytes = fetcher
        .fetch(&MsgId::new("a@test"), &ctx, &cancel)
        .await
        .unwrap();

    assert_eq!(&bytes[..], &payload[..]);
    assert_eq!(server.bodies_served(), 1);

    let stats = fetcher.affinity().snapshot("job");
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].successful_segments, 1);
    assert_eq!(stats[0].total_bytes, 700_000);
    assert_eq!(fetcher.bandwidth().total_bytes(0), 700_000);
}

#[tokio::test]
async fn test_fetch_missing_everywhere_is_not_found() {
    let server = MockNntpServer::start().await;
    let pool = pool_for(
        vec![provider_for(&server, 0, ProviderRole::Pool, 5)],
        limits(10, 5, 2),
    );
    let fetcher = ArticleFetcher::new(pool);

    let result = fetcher
        .fetch(
            &MsgId::new("gone@test"),
            &UsageContext::streaming("job"),
            &CancellationToken::new(),
        )
        .await;
    assert!(matches!(result, Err(Error::ArticleNotFound { .. })));
}

#[tokio::test]
async fn test_failover_on_missing_article() {
    let server_a = MockNntpServer::start().await;
    let server_b = MockNntpServer::start().await;
    let payload = test_utils::segment_payload(3, 17, 500_000);
    // Segment 17 is missing on A, present on B.
    server_a.mark_missing("<seg17@test>");
    server_b.add_article("<seg17@test>", &payload);

    let pool = pool_for(
        vec![
            provider_for(&server_a, 0, ProviderRole::Pool, 5),
            provider_for(&server_b, 1, ProviderRole::Pool, 5),
        ],
        limits(10, 5, 2),
    );
    let fetcher = ArticleFetcher::new(pool);

    let bytes = fetcher
        .fetch(
            &MsgId::new("seg17@test"),
            &UsageContext::streaming("job"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(&bytes[..], &payload[..]);

    let mut stats = fetcher.affinity().snapshot("job");
    stats.sort_by_key(|row| row.provider_index);
    assert_eq!(stats[0].provider_index, 0);
    assert_eq!(stats[0].missing_errors, 1);
    assert_eq!(stats[0].successful_segments, 0);
    assert_eq!(stats[1].provider_index, 1);
    assert_eq!(stats[1].successful_segments, 1);
}

#[tokio::test]
async fn test_backup_only_provider_used_when_pool_exhausted() {
    let pool_server = MockNntpServer::start().await;
    let backup_server = MockNntpServer::start().await;
    let payload = test_utils::segment_payload(9, 0, 10_000);
    pool_server.mark_missing("<x@test>");
    backup_server.add_article("<x@test>", &payload);

    let pool = pool_for(
        vec![
            provider_for(&pool_server, 0, ProviderRole::Pool, 5),
            provider_for(&backup_server, 1, ProviderRole::BackupOnly, 5),
        ],
        limits(10, 5, 2),
    );
    let fetcher = ArticleFetcher::new(pool);

    let bytes = fetcher
        .fetch(
            &MsgId::new("x@test"),
            &UsageContext::streaming("job"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(&bytes[..], &payload[..]);
}

#[tokio::test]
async fn test_auth_failure_trips_circuit_breaker() {
    let server = MockNntpServer::start().await;
    server.require_auth("user", "right");
    server.add_article("<a@test>", b"irrelevant");

    let mut provider = provider_for(&server, 0, ProviderRole::Pool, 5);
    provider.username = Some("user".to_string());
    provider.password = Some("wrong".to_string());

    let pool = pool_for(vec![provider], limits(10, 5, 2));
    let fetcher = ArticleFetcher::new(Arc::clone(&pool));

    let result = fetcher
        .fetch(
            &MsgId::new("a@test"),
            &UsageContext::streaming("job"),
            &CancellationToken::new(),
        )
        .await;
    assert!(matches!(result, Err(Error::ArticleUnavailable { .. })));
    assert!(pool.breaker(0).unwrap().is_open());

    // Circuit open: the next fetch fails fast without dialing again.
    let accepted_before = server.connections_accepted();
    let result = fetcher
        .fetch(
            &MsgId::new("a@test"),
            &UsageContext::streaming("job"),
            &CancellationToken::new(),
        )
        .await;
    assert!(matches!(result, Err(Error::ArticleUnavailable { .. })));
    assert_eq!(server.connections_accepted(), accepted_before);
}

#[tokio::test]
async fn test_connections_are_reused() {
    let server = MockNntpServer::start().await;
    let payload = test_utils::segment_payload(5, 0, 1_000);
    server.add_article("<a@test>", &payload);
    server.add_article("<b@test>", &payload);

    let pool = pool_for(
        vec![provider_for(&server, 0, ProviderRole::Pool, 5)],
        limits(10, 5, 2),
    );
    let fetcher = ArticleFetcher::new(pool);
    let ctx = UsageContext::streaming("job");
    let cancel = CancellationToken::new();

    fetcher.fetch(&MsgId::new("a@test"), &ctx, &cancel).await.unwrap();
    fetcher.fetch(&MsgId::new("b@test"), &ctx, &cancel).await.unwrap();

    assert_eq!(server.connections_accepted(), 1);
}

#[tokio::test]
async fn test_pool_respects_provider_connection_cap() {
    let server = MockNntpServer::start().await;
    server.set_body_latency(Duration::from_millis(50));
    for i in 0..10 {
        server.add_article(
            format!("<s{i}@test>"),
            &test_utils::segment_payload(2, i, 1_000),
        );
    }

    let pool = pool_for(
        vec![provider_for(&server, 0, ProviderRole::Pool, 2)],
        limits(20, 5, 2),
    );
    let fetcher = ArticleFetcher::new(Arc::clone(&pool));
    let ctx = UsageContext::streaming("job");
    let cancel = CancellationToken::new();

    let mut tasks = Vec::new();
    for i in 0..10 {
        let fetcher = fetcher.clone();
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            fetcher
                .fetch(&MsgId::new(format!("s{i}@test")), &ctx, &cancel)
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    // At most two sessions served the entire burst.
    assert!(server.connections_accepted() <= 2);
    assert_eq!(pool.in_use(0), 0);
    assert!(pool.live_connections(0) <= 2);
}

#[tokio::test]
async fn test_queue_backlog_does_not_starve_streaming() {
    let server = MockNntpServer::start().await;
    server.set_body_latency(Duration::from_millis(200));
    for i in 0..20 {
        server.add_article(
            format!("<q{i}@test>"),
            &test_utils::segment_payload(4, i, 1_000),
        );
    }
    server.add_article("<urgent@test>", &test_utils::segment_payload(4, 99, 1_000));

    // Provider allows 10 connections; 6 are effectively reserved for
    // streaming by giving the queue class a budget of 4.
    let pool = pool_for(
        vec![provider_for(&server, 0, ProviderRole::Pool, 10)],
        limits(6, 4, 1),
    );
    let fetcher = ArticleFetcher::new(pool);
    let cancel = CancellationToken::new();

    // Saturate with 20 queue fetches.
    let mut queue_tasks = Vec::new();
    for i in 0..20 {
        let fetcher = fetcher.clone();
        let cancel = cancel.clone();
        queue_tasks.push(tokio::spawn(async move {
            fetcher
                .fetch(&MsgId::new(format!("q{i}@test")), &UsageContext::queue(), &cancel)
                .await
        }));
    }
    // Give the backlog a head start.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let start = Instant::now();
    let bytes = fetcher
        .fetch(
            &MsgId::new("urgent@test"),
            &UsageContext::streaming("job"),
            &cancel,
        )
        .await
        .unwrap();
    let elapsed = start.elapsed();
    assert_eq!(bytes.len(), 1_000);
    assert!(
        elapsed < Duration::from_millis(600),
        "streaming fetch took {elapsed:?} behind the queue backlog"
    );

    for task in queue_tasks {
        task.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_cancellation_while_waiting_for_pool() {
    let server = MockNntpServer::start().await;
    server.set_body_latency(Duration::from_millis(500));
    server.add_article("<slow@test>", &test_utils::segment_payload(6, 0, 1_000));
    server.add_article("<waiting@test>", &test_utils::segment_payload(6, 1, 1_000));

    let pool = pool_for(
        vec![provider_for(&server, 0, ProviderRole::Pool, 1)],
        limits(10, 5, 2),
    );
    let fetcher = ArticleFetcher::new(pool);

    // Occupy the only connection.
    let holder = {
        let fetcher = fetcher.clone();
        tokio::spawn(async move {
            fetcher
                .fetch(
                    &MsgId::new("slow@test"),
                    &UsageContext::streaming("job"),
                    &CancellationToken::new(),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let cancel = CancellationToken::new();
    let waiter = {
        let fetcher = fetcher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            fetcher
                .fetch(&MsgId::new("waiting@test"), &UsageContext::streaming("job"), &cancel)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let cancelled_at = Instant::now();
    cancel.cancel();
    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(
        cancelled_at.elapsed() < Duration::from_millis(100),
        "cancellation took {:?}",
        cancelled_at.elapsed()
    );

    holder.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_check_segments_all_present() {
    let server = MockNntpServer::start().await;
    let ids: Vec<MsgId> = (0..10)
        .map(|i| {
            let id = format!("<c{i}@test>");
            server.add_article(id.clone(), b"data");
            MsgId::new(id)
        })
        .collect();

    let pool = pool_for(
        vec![provider_for(&server, 0, ProviderRole::Pool, 5)],
        limits(10, 5, 4),
    );
    let fetcher = ArticleFetcher::new(pool);

    let outcome = fetcher
        .check_segments(&ids, 4, false, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, CheckOutcome::AllPresent);
}

#[tokio::test]
async fn test_check_segments_reports_first_missing() {
    let server = MockNntpServer::start().await;
    let ids: Vec<MsgId> = (0..10)
        .map(|i| {
            let id = format!("<c{i}@test>");
            server.add_article(id.clone(), b"data");
            MsgId::new(id)
        })
        .collect();
    server.mark_missing("<c7@test>");

    let pool = pool_for(
        vec![provider_for(&server, 0, ProviderRole::Pool, 5)],
        limits(10, 5, 4),
    );
    let fetcher = ArticleFetcher::new(pool);

    let outcome = fetcher
        .check_segments(&ids, 2, false, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CheckOutcome::Missing {
            msg_id: MsgId::new("c7@test")
        }
    );

    // HEAD probes agree.
    let outcome = fetcher
        .check_segments(&ids, 2, true, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CheckOutcome::Missing {
            msg_id: MsgId::new("c7@test")
        }
    );
}

#[tokio::test]
async fn test_verified_playback_classification_flows_through() {
    let server = MockNntpServer::start().await;
    server.add_article("<v@test>", &test_utils::segment_payload(8, 0, 1_000));

    let pool = pool_for(
        vec![provider_for(&server, 0, ProviderRole::Pool, 5)],
        limits(4, 2, 1),
    );
    let fetcher = ArticleFetcher::new(Arc::clone(&pool));
    fetcher.gate().verify("the-show");

    let ctx = UsageContext::streaming("the-show");
    assert_eq!(fetcher.gate().classify(&ctx), UsageKind::PlaybackVerified);

    // And an upgraded fetch succeeds end to end.
    fetcher
        .fetch(&MsgId::new("v@test"), &ctx, &CancellationToken::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_pool_shutdown_rejects_new_borrows() {
    let server = MockNntpServer::start().await;
    server.add_article("<a@test>", &test_utils::segment_payload(1, 0, 100));

    let pool = pool_for(
        vec![provider_for(&server, 0, ProviderRole::Pool, 5)],
        limits(10, 5, 2),
    );
    let fetcher = ArticleFetcher::new(Arc::clone(&pool));
    fetcher
        .fetch(
            &MsgId::new("a@test"),
            &UsageContext::streaming("job"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(pool.live_connections(0), 1);

    pool.shutdown().await;
    assert_eq!(pool.live_connections(0), 0);

    let result = fetcher
        .fetch(
            &MsgId::new("a@test"),
            &UsageContext::streaming("job"),
            &CancellationToken::new(),
        )
        .await;
    assert!(result.is_err());
}
