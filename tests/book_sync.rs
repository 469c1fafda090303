//! Book synchronization and best-depth fan-out against a scripted venue

mod common;

use common::{diff, eventually, settle, snapshot, FakeAdapter};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;

use sequex_connector::orderbook::BookSettings;
use sequex_connector::{
    BestDepth, BestDepthSubscription, BookManager, BookState, ConnectorError, ExchangeAdapter,
    PriceLevel, UpdateSpeed,
};

fn manager(adapter: &FakeAdapter) -> Arc<BookManager> {
    let adapter: Arc<dyn ExchangeAdapter> = Arc::new(adapter.clone());
    Arc::new(BookManager::new(adapter, BookSettings::default()))
}

fn best(ask: PriceLevel, bid: PriceLevel) -> BestDepth {
    BestDepth { ask, bid }
}

fn level(price: Decimal, size: Decimal) -> PriceLevel {
    PriceLevel::new(price, size)
}

type Ticks = Arc<Mutex<Vec<BestDepth>>>;

async fn record(books: &BookManager, symbol: &str) -> (Ticks, BestDepthSubscription) {
    let ticks: Ticks = Arc::new(Mutex::new(Vec::new()));
    let sink = ticks.clone();
    let subscription = books
        .subscribe_best_depth(symbol, move |depth| sink.lock().unwrap().push(depth))
        .await
        .unwrap();
    (ticks, subscription)
}

async fn tick_count(ticks: &Ticks, expected: usize) -> bool {
    let ticks = ticks.clone();
    eventually(|| {
        let ticks = ticks.clone();
        async move { ticks.lock().unwrap().len() >= expected }
    })
    .await
}

async fn synced_to(books: &BookManager, symbol: &str, next_id: u64) -> bool {
    eventually(move || async move {
        matches!(books.get_depth(symbol, 0).await, Ok(view) if view.last_update_id == next_id)
    })
    .await
}

/// Book seeded by snapshot 110: asks 10.0x2, bids 9.0x3
async fn seeded(adapter: &FakeAdapter, books: &BookManager, symbol: &str) {
    adapter.script_snapshot(symbol, Ok(snapshot(110, &[("10.0", "2")], &[("9.0", "3")])));
    assert!(books.create(symbol, UpdateSpeed::Ms100).await.unwrap());
    assert!(adapter.push(symbol, diff(symbol, 100, 105, &[], &[])));
    assert!(synced_to(books, symbol, 111).await);
}

#[tokio::test]
async fn test_first_diff_seeds_book_from_snapshot() {
    let adapter = FakeAdapter::new();
    let books = manager(&adapter);
    adapter.script_snapshot("BTCUSDT", Ok(snapshot(110, &[("10.0", "2")], &[("9.0", "3")])));

    assert!(books.create("btcusdt", UpdateSpeed::Ms100).await.unwrap());
    assert_eq!(books.state("BTCUSDT").await, Some(BookState::Fresh));
    let (ticks, _subscription) = record(&books, "BTCUSDT").await;

    assert!(adapter.push("BTCUSDT", diff("BTCUSDT", 100, 105, &[], &[])));
    assert!(synced_to(&books, "BTCUSDT", 111).await);

    let view = books.get_depth("BTCUSDT", 10).await.unwrap();
    assert_eq!(view.asks, vec![level(dec!(10.0), dec!(2))]);
    assert_eq!(view.bids, vec![level(dec!(9.0), dec!(3))]);
    assert_eq!(adapter.snapshot_requests(), 1);

    assert!(tick_count(&ticks, 1).await);
    assert_eq!(
        ticks.lock().unwrap()[0],
        best(level(dec!(10), dec!(2)), level(dec!(9), dec!(3)))
    );
}

#[tokio::test]
async fn test_contiguous_diff_moves_best_ask() {
    let adapter = FakeAdapter::new();
    let books = manager(&adapter);
    seeded(&adapter, &books, "BTCUSDT").await;
    let (ticks, _subscription) = record(&books, "BTCUSDT").await;

    assert!(adapter.push(
        "BTCUSDT",
        diff("BTCUSDT", 111, 112, &[("10", "0"), ("10.5", "4")], &[])
    ));
    assert!(synced_to(&books, "BTCUSDT", 113).await);
    assert_eq!(books.state("BTCUSDT").await, Some(BookState::Synced));

    assert!(tick_count(&ticks, 1).await);
    settle().await;
    assert_eq!(
        *ticks.lock().unwrap(),
        vec![best(level(dec!(10.5), dec!(4)), level(dec!(9), dec!(3)))]
    );
}

#[tokio::test]
async fn test_stale_diff_is_ignored() {
    let adapter = FakeAdapter::new();
    let books = manager(&adapter);
    seeded(&adapter, &books, "BTCUSDT").await;
    let (ticks, _subscription) = record(&books, "BTCUSDT").await;

    adapter.push("BTCUSDT", diff("BTCUSDT", 50, 60, &[("10.0", "0")], &[("9.5", "1")]));
    // Processed in order, so once this lands the stale one was handled
    adapter.push("BTCUSDT", diff("BTCUSDT", 111, 111, &[], &[]));
    assert!(synced_to(&books, "BTCUSDT", 112).await);
    settle().await;

    let view = books.get_depth("BTCUSDT", 10).await.unwrap();
    assert_eq!(view.asks, vec![level(dec!(10.0), dec!(2))]);
    assert_eq!(view.bids, vec![level(dec!(9.0), dec!(3))]);
    assert!(ticks.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_gap_with_failed_snapshot_leaves_book_unchanged() {
    let adapter = FakeAdapter::new();
    let books = manager(&adapter);
    seeded(&adapter, &books, "BTCUSDT").await;

    adapter.push("BTCUSDT", diff("BTCUSDT", 200, 201, &[("11", "1")], &[]));
    adapter.push("BTCUSDT", diff("BTCUSDT", 111, 111, &[], &[("9.1", "1")]));
    assert!(synced_to(&books, "BTCUSDT", 112).await);

    assert_eq!(adapter.snapshot_requests(), 2);
    let view = books.get_depth("BTCUSDT", 10).await.unwrap();
    assert_eq!(view.asks, vec![level(dec!(10.0), dec!(2))]);
    assert_eq!(view.bids[0], level(dec!(9.1), dec!(1)));
    assert!(books.contains("BTCUSDT").await);
}

#[tokio::test]
async fn test_gap_recovers_from_newer_snapshot() {
    let adapter = FakeAdapter::new();
    let books = manager(&adapter);
    seeded(&adapter, &books, "BTCUSDT").await;

    adapter.script_snapshot("BTCUSDT", Ok(snapshot(150, &[("10.4", "1")], &[("9.9", "1")])));
    adapter.push("BTCUSDT", diff("BTCUSDT", 140, 152, &[("10.3", "2")], &[]));
    assert!(synced_to(&books, "BTCUSDT", 153).await);

    let best = books.best_depth("BTCUSDT").await.unwrap().unwrap();
    assert_eq!(best.ask, level(dec!(10.3), dec!(2)));
    assert_eq!(best.bid, level(dec!(9.9), dec!(1)));
}

#[tokio::test]
async fn test_gap_with_older_snapshot_keeps_book() {
    let adapter = FakeAdapter::new();
    let books = manager(&adapter);
    seeded(&adapter, &books, "BTCUSDT").await;

    adapter.script_snapshot("BTCUSDT", Ok(snapshot(100, &[("12", "5")], &[("8", "5")])));
    adapter.push("BTCUSDT", diff("BTCUSDT", 200, 201, &[("11", "1")], &[]));
    adapter.push("BTCUSDT", diff("BTCUSDT", 111, 111, &[], &[("9.1", "1")]));
    assert!(synced_to(&books, "BTCUSDT", 112).await);

    assert_eq!(adapter.snapshot_requests(), 2);
    let view = books.get_depth("BTCUSDT", 10).await.unwrap();
    assert_eq!(view.asks, vec![level(dec!(10.0), dec!(2))]);
    assert_eq!(
        view.bids,
        vec![level(dec!(9.1), dec!(1)), level(dec!(9.0), dec!(3))]
    );
}

#[tokio::test]
async fn test_slow_subscribe_does_not_block_other_books() {
    let adapter = FakeAdapter::new();
    let books = manager(&adapter);
    seeded(&adapter, &books, "BTCUSDT").await;
    adapter.delay_subscribe("SLOWUSDT", Duration::from_secs(2));

    let creating = {
        let books = books.clone();
        tokio::spawn(async move { books.create("SLOWUSDT", UpdateSpeed::Ms100).await })
    };
    settle().await;

    let view = timeout(Duration::from_millis(300), books.get_depth("BTCUSDT", 5))
        .await
        .expect("get_depth stalled behind a pending create")
        .unwrap();
    assert_eq!(view.last_update_id, 111);
    timeout(Duration::from_millis(300), books.close("ETHUSDT"))
        .await
        .expect("close stalled behind a pending create")
        .unwrap();

    assert!(creating.await.unwrap().unwrap());
    assert!(books.contains("SLOWUSDT").await);
}

#[tokio::test]
async fn test_concurrent_create_keeps_one_subscription() {
    let adapter = FakeAdapter::new();
    let books = manager(&adapter);
    adapter.delay_subscribe("BTCUSDT", Duration::from_millis(100));

    let (first, second) = tokio::join!(
        books.create("BTCUSDT", UpdateSpeed::Ms100),
        books.create("BTCUSDT", UpdateSpeed::Ms100)
    );
    let created = [first.unwrap(), second.unwrap()];
    assert_eq!(created.iter().filter(|created| **created).count(), 1);

    assert_eq!(adapter.subscribes(), 2);
    assert_eq!(adapter.unsubscribes(), 1);
    assert_eq!(books.symbols().await, vec!["BTCUSDT".to_string()]);
    assert_eq!(books.state("BTCUSDT").await, Some(BookState::Fresh));
}

#[tokio::test]
async fn test_create_is_idempotent_and_validates() {
    let adapter = FakeAdapter::new();
    let books = manager(&adapter);

    assert!(books.create("ETHUSDT", UpdateSpeed::Ms100).await.unwrap());
    assert!(!books.create("ethusdt", UpdateSpeed::Ms100).await.unwrap());
    assert_eq!(adapter.subscribes(), 1);

    assert!(matches!(
        books.create("ETH/USDT", UpdateSpeed::Ms100).await,
        Err(ConnectorError::InvalidInput(_))
    ));
    assert!(matches!(
        books.get_depth("SOLUSDT", 5).await,
        Err(ConnectorError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_close_releases_subscription_once() {
    let adapter = FakeAdapter::new();
    let books = manager(&adapter);
    seeded(&adapter, &books, "BTCUSDT").await;

    books.close("BTCUSDT").await.unwrap();
    books.close("BTCUSDT").await.unwrap();

    assert_eq!(adapter.unsubscribes(), 1);
    assert!(!adapter.is_streaming("BTCUSDT"));
    assert!(matches!(
        books.get_depth("BTCUSDT", 5).await,
        Err(ConnectorError::NotFound(_))
    ));
    assert!(books.symbols().await.is_empty());
}

#[tokio::test]
async fn test_closing_one_book_leaves_others_running() {
    let adapter = FakeAdapter::new();
    let books = manager(&adapter);
    seeded(&adapter, &books, "BTCUSDT").await;
    seeded(&adapter, &books, "ETHUSDT").await;

    let (btc_ticks, _btc) = record(&books, "BTCUSDT").await;
    let (eth_ticks, _eth) = record(&books, "ETHUSDT").await;

    books.close("BTCUSDT").await.unwrap();
    assert!(!adapter.push("BTCUSDT", diff("BTCUSDT", 111, 111, &[("10.1", "1")], &[])));

    assert!(adapter.push("ETHUSDT", diff("ETHUSDT", 111, 111, &[("9.8", "1")], &[])));
    assert!(tick_count(&eth_ticks, 1).await);
    assert_eq!(eth_ticks.lock().unwrap()[0].ask, level(dec!(9.8), dec!(1)));
    assert!(btc_ticks.lock().unwrap().is_empty());
    assert_eq!(books.symbols().await, vec!["ETHUSDT".to_string()]);
}

#[tokio::test]
async fn test_stream_end_closes_book_and_allows_recreate() {
    let adapter = FakeAdapter::new();
    let books = manager(&adapter);
    seeded(&adapter, &books, "BTCUSDT").await;
    let (_ticks, subscription) = record(&books, "BTCUSDT").await;

    adapter.end_stream("BTCUSDT");
    let closed = eventually(|| {
        let books = books.clone();
        async move { books.state("BTCUSDT").await == Some(BookState::Closed) }
    })
    .await;
    assert!(closed);

    assert_eq!(adapter.unsubscribes(), 1);
    assert!(subscription.is_detached());
    assert!(matches!(
        books.get_depth("BTCUSDT", 5).await,
        Err(ConnectorError::Shutdown)
    ));

    assert!(books.create("BTCUSDT", UpdateSpeed::Ms100).await.unwrap());
    assert_eq!(adapter.subscribes(), 2);
    assert_eq!(books.state("BTCUSDT").await, Some(BookState::Fresh));
}

#[tokio::test]
async fn test_detached_subscriber_stops_receiving() {
    let adapter = FakeAdapter::new();
    let books = manager(&adapter);
    seeded(&adapter, &books, "BTCUSDT").await;
    let (kept, _kept_subscription) = record(&books, "BTCUSDT").await;
    let (dropped, subscription) = record(&books, "BTCUSDT").await;

    adapter.push("BTCUSDT", diff("BTCUSDT", 111, 111, &[("9.9", "1")], &[]));
    assert!(tick_count(&kept, 1).await);
    assert!(tick_count(&dropped, 1).await);

    subscription.detach();
    adapter.push("BTCUSDT", diff("BTCUSDT", 112, 112, &[("9.8", "1")], &[]));
    assert!(tick_count(&kept, 2).await);
    settle().await;
    assert_eq!(dropped.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unchanged_best_depth_is_not_republished() {
    let adapter = FakeAdapter::new();
    let books = manager(&adapter);
    seeded(&adapter, &books, "BTCUSDT").await;
    let (ticks, _subscription) = record(&books, "BTCUSDT").await;

    // Deeper levels only
    adapter.push("BTCUSDT", diff("BTCUSDT", 111, 111, &[("12", "1")], &[("8", "1")]));
    adapter.push("BTCUSDT", diff("BTCUSDT", 112, 112, &[("10.0", "5")], &[]));
    assert!(synced_to(&books, "BTCUSDT", 113).await);
    assert!(tick_count(&ticks, 1).await);
    settle().await;

    assert_eq!(
        *ticks.lock().unwrap(),
        vec![best(level(dec!(10), dec!(5)), level(dec!(9), dec!(3)))]
    );
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let adapter = FakeAdapter::new();
    let books = manager(&adapter);
    seeded(&adapter, &books, "BTCUSDT").await;
    seeded(&adapter, &books, "ETHUSDT").await;

    books.shutdown().await;

    assert!(books.is_shutdown());
    assert_eq!(adapter.unsubscribes(), 2);
    assert!(books.symbols().await.is_empty());
    assert!(matches!(
        books.create("BTCUSDT", UpdateSpeed::Ms100).await,
        Err(ConnectorError::Shutdown)
    ));
}
