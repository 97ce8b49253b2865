use async_trait::async_trait;
use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use slog::{o, Drain};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_zookeeper_children::*;

fn logger() -> slog::Logger {
    let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, o!())
}

async fn start(
    zk: &memory::Ensemble,
    expiry: ExpiryPolicy,
) -> (
    ChildWatcher<memory::MemorySession>,
    mpsc::UnboundedReceiver<ChildUpdate>,
) {
    let mut builder = WatcherBuilder::default();
    builder.set_logger(logger());
    builder.set_expiry_policy(expiry);
    builder.start(zk.clone()).await.unwrap()
}

async fn next_update(updates: &mut mpsc::UnboundedReceiver<ChildUpdate>) -> ChildUpdate {
    tokio::time::timeout(Duration::from_secs(5), updates.next())
        .await
        .expect("no child update within 5s")
        .expect("watcher stopped")
}

async fn assert_quiet(updates: &mut mpsc::UnboundedReceiver<ChildUpdate>) {
    let next = tokio::time::timeout(Duration::from_millis(100), updates.next()).await;
    assert!(next.is_err(), "unexpected update: {:?}", next);
}

fn names(update: &ChildUpdate) -> Vec<String> {
    update.children.to_vec()
}

#[tokio::test]
async fn ephemeral_child_triggers_exactly_one_update() {
    let zk = memory::Ensemble::new(logger());
    let (watcher, mut updates) = start(&zk, ExpiryPolicy::default()).await;

    watcher
        .create("/root", b"", CreateMode::Persistent)
        .await
        .unwrap()
        .unwrap();

    let (tx, mut results) = mpsc::unbounded();
    watcher
        .refresh_async("/root", "ctx-1", move |r: ChildrenResult<&'static str>| {
            let _ = tx.unbounded_send(r);
        })
        .unwrap();
    watcher
        .create("/root/c1", b"", CreateMode::Ephemeral)
        .await
        .unwrap()
        .unwrap();

    let first = results.next().await.unwrap();
    assert_eq!(first.code(), 0);
    assert_eq!(first.context, "ctx-1");
    assert_eq!(first.path, "/root");
    assert!(first.children().unwrap().is_empty());

    let update = next_update(&mut updates).await;
    assert_eq!(update.path, "/root");
    assert_eq!(names(&update), vec!["c1"]);
    assert_eq!(update.stat.num_children, 1);
    assert_quiet(&mut updates).await;

    let (children, _) = watcher.refresh("/root").await.unwrap().unwrap();
    assert_eq!(children.to_vec(), vec!["c1"]);
    assert_eq!(watcher.view().get("/root"), Some(children));

    watcher.close().await.unwrap();
    assert!(!zk.exists("/root/c1"));
    assert!(zk.exists("/root"));
}

#[tokio::test]
async fn each_change_after_rearm_is_observed() {
    let zk = memory::Ensemble::new(logger());
    let (watcher, mut updates) = start(&zk, ExpiryPolicy::default()).await;

    let path = "/zk-book";
    watcher
        .create(path, b"", CreateMode::Persistent)
        .await
        .unwrap()
        .unwrap();
    watcher
        .create("/zk-book/c1", b"", CreateMode::Ephemeral)
        .await
        .unwrap()
        .unwrap();
    watcher
        .refresh_async(path, (), LoggingSink::new(logger()))
        .unwrap();

    for (child, expected) in vec![
        ("/zk-book/c2", vec!["c1", "c2"]),
        ("/zk-book/c3", vec!["c1", "c2", "c3"]),
    ] {
        // wait for the previous notification to be handled so the watch is armed again
        tokio::time::sleep(Duration::from_millis(20)).await;
        watcher
            .create(child, b"", CreateMode::Ephemeral)
            .await
            .unwrap()
            .unwrap();
        let update = next_update(&mut updates).await;
        assert_eq!(names(&update), expected);
    }

    watcher.close().await.unwrap();
}

#[tokio::test]
async fn changes_before_rearm_are_folded_into_one_update() {
    let zk = memory::Ensemble::new(logger());
    let (watcher, mut updates) = start(&zk, ExpiryPolicy::default()).await;
    watcher
        .create("/root", b"", CreateMode::Persistent)
        .await
        .unwrap()
        .unwrap();
    watcher.refresh("/root").await.unwrap().unwrap();

    // both land before the callback task gets to re-arm the watch
    let (other, _events) = zk.connect();
    other
        .create("/root/a", vec![], Acl::open_unsafe(), CreateMode::Persistent)
        .await
        .unwrap()
        .unwrap();
    other
        .create("/root/b", vec![], Acl::open_unsafe(), CreateMode::Persistent)
        .await
        .unwrap()
        .unwrap();

    let update = next_update(&mut updates).await;
    assert_eq!(names(&update), vec!["a", "b"]);
    assert_quiet(&mut updates).await;

    watcher.close().await.unwrap();
}

#[tokio::test]
async fn children_of_a_closed_session_disappear() {
    let zk = memory::Ensemble::new(logger());
    let (watcher, mut updates) = start(&zk, ExpiryPolicy::default()).await;
    watcher
        .create("/root", b"", CreateMode::Persistent)
        .await
        .unwrap()
        .unwrap();
    watcher.refresh("/root").await.unwrap().unwrap();

    let (other, _events) = zk.connect();
    other
        .create("/root/e", vec![], Acl::open_unsafe(), CreateMode::Ephemeral)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(names(&next_update(&mut updates).await), vec!["e"]);

    other.close().await.unwrap();
    let update = next_update(&mut updates).await;
    assert!(update.children.is_empty());
    assert_eq!(watcher.view().get("/root"), Some(ChildSet::default()));

    watcher.close().await.unwrap();
}

#[tokio::test]
async fn notifications_missed_while_disconnected_arrive_on_reconnect() {
    let zk = memory::Ensemble::new(logger());
    let (watcher, mut updates) = start(&zk, ExpiryPolicy::default()).await;
    watcher
        .create("/root", b"", CreateMode::Persistent)
        .await
        .unwrap()
        .unwrap();
    watcher.refresh("/root").await.unwrap().unwrap();

    let id = watcher.session().id();
    zk.disconnect(id);
    let (other, _events) = zk.connect();
    other
        .create("/root/late", vec![], Acl::open_unsafe(), CreateMode::Persistent)
        .await
        .unwrap()
        .unwrap();
    assert_quiet(&mut updates).await;
    assert_eq!(watcher.session().state(), SessionState::Disconnected);

    zk.reconnect(id);
    assert_eq!(names(&next_update(&mut updates).await), vec!["late"]);
    assert_eq!(watcher.session().state(), SessionState::Connected);

    watcher.close().await.unwrap();
}

#[tokio::test]
async fn expired_session_is_replaced_and_watches_rearmed() {
    let zk = memory::Ensemble::new(logger());
    let (watcher, mut updates) = start(&zk, ExpiryPolicy::Reinitialize).await;
    watcher
        .create("/root", b"", CreateMode::Persistent)
        .await
        .unwrap()
        .unwrap();
    watcher.refresh("/root").await.unwrap().unwrap();

    let old = watcher.session().id();
    zk.expire(old);

    // the re-initialization re-reads every known path
    let update = next_update(&mut updates).await;
    assert_eq!(update.path, "/root");
    assert!(update.children.is_empty());
    assert_ne!(watcher.session().id(), old);
    assert_eq!(zk.child_watch_count("/root"), 1);

    let (other, _events) = zk.connect();
    other
        .create("/root/x", vec![], Acl::open_unsafe(), CreateMode::Persistent)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(names(&next_update(&mut updates).await), vec!["x"]);

    watcher.close().await.unwrap();
}

#[tokio::test]
async fn expired_session_with_terminate_stops_watching() {
    let zk = memory::Ensemble::new(logger());
    let (watcher, mut updates) = start(&zk, ExpiryPolicy::Terminate).await;
    watcher
        .create("/root", b"", CreateMode::Persistent)
        .await
        .unwrap()
        .unwrap();
    watcher.refresh("/root").await.unwrap().unwrap();

    zk.expire(watcher.session().id());
    let end = tokio::time::timeout(Duration::from_secs(5), updates.next())
        .await
        .unwrap();
    assert!(end.is_none());
    assert_eq!(watcher.session().state(), SessionState::Expired);

    let err = watcher.refresh("/root").await.unwrap().unwrap_err();
    assert_eq!(err, error::GetChildren::SessionExpired);
    assert!(!err.is_transient());
    assert_eq!(watcher.view().get("/root"), Some(ChildSet::default()));

    watcher.close().await.unwrap();
}

#[tokio::test]
async fn panicking_sink_does_not_stop_delivery() {
    let zk = memory::Ensemble::new(logger());
    let (watcher, _updates) = start(&zk, ExpiryPolicy::default()).await;

    watcher
        .refresh_async("/", 1u32, |_: ChildrenResult<u32>| panic!("sink bug"))
        .unwrap();

    let (tx, mut results) = mpsc::unbounded();
    for ctx in 2..5u32 {
        let tx = tx.clone();
        watcher
            .refresh_async("/missing", ctx, move |r: ChildrenResult<u32>| {
                let _ = tx.unbounded_send((r.context, r.outcome.clone()));
            })
            .unwrap();
    }
    let mut seen = Vec::new();
    for _ in 2..5 {
        seen.push(results.next().await.unwrap());
    }
    seen.sort_by_key(|(ctx, _)| *ctx);
    assert_eq!(
        seen,
        vec![
            (2, Err(error::GetChildren::NoNode)),
            (3, Err(error::GetChildren::NoNode)),
            (4, Err(error::GetChildren::NoNode)),
        ]
    );

    watcher.close().await.unwrap();
}

/// A session whose first children reply arrives late.
struct Lagging {
    inner: memory::MemorySession,
    lagged: AtomicBool,
}

impl Coordinator for Lagging {
    fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        acl: &'static [Acl],
        mode: CreateMode,
    ) -> BoxFuture<'static, CreateReply> {
        self.inner.create(path, data, acl, mode)
    }

    fn delete(&self, path: &str, version: Option<i32>) -> BoxFuture<'static, DeleteReply> {
        self.inner.delete(path, version)
    }

    fn get_children(&self, path: &str, watch: bool) -> BoxFuture<'static, ChildrenReply> {
        let reply = self.inner.get_children(path, watch);
        if self.lagged.swap(true, Ordering::SeqCst) {
            return reply;
        }
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            reply.await
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'static, Result<(), failure::Error>> {
        self.inner.close()
    }

    fn session_id(&self) -> i64 {
        self.inner.session_id()
    }
}

struct LaggingConnector(memory::Ensemble);

#[async_trait]
impl Connector<Lagging> for LaggingConnector {
    async fn connect(
        &self,
    ) -> Result<(Lagging, mpsc::UnboundedReceiver<WatchedEvent>), failure::Error> {
        let (inner, events) = self.0.connect();
        let session = Lagging {
            inner,
            lagged: AtomicBool::new(false),
        };
        Ok((session, events))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_async_result_is_delivered_before_later_updates() {
    let zk = memory::Ensemble::new(logger());
    let mut builder = WatcherBuilder::default();
    builder.set_logger(logger());
    let (watcher, mut updates) = builder
        .start::<Lagging, _>(LaggingConnector(zk.clone()))
        .await
        .unwrap();
    watcher
        .create("/root", b"", CreateMode::Persistent)
        .await
        .unwrap()
        .unwrap();

    let (tx, mut results) = mpsc::unbounded();
    watcher
        .refresh_async("/root", "first", move |r: ChildrenResult<&'static str>| {
            let _ = tx.unbounded_send(r);
        })
        .unwrap();
    watcher
        .create("/root/c1", b"", CreateMode::Ephemeral)
        .await
        .unwrap()
        .unwrap();

    let update = next_update(&mut updates).await;
    assert_eq!(names(&update), vec!["c1"]);
    // the older read reached its sink before the update was published
    let first = results.try_next().unwrap().unwrap();
    assert_eq!(first.context, "first");
    assert!(first.children().unwrap().is_empty());
    assert_eq!(
        watcher.view().get("/root").map(|c| c.to_vec()),
        Some(vec!["c1".to_string()])
    );
    assert!(zk.exists("/root/c1"));

    watcher.close().await.unwrap();
}
