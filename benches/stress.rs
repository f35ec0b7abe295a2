use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

use stationd::engine::{Engine, LedgerStore};
use stationd::model::OperatingHours;
use stationd::notify::NotifyHub;
use stationd::pool::{Pool, RateCard, Schedule, StaticDirectory, UnitCounts};
use stationd::wire;

const PASSWORD: &str = "stationd";
const UNITS: u32 = 10;

fn base_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
}

/// One-hour slot `i`: hour `i % 24` on day `i / 24`.
fn slot(i: u64) -> (NaiveDate, String, String) {
    let date = base_date() + Days::new(i / 24);
    let hour = i % 24;
    (
        date,
        format!("{hour:02}:00"),
        format!("{:02}:00", (hour + 1) % 24),
    )
}

fn insert_sql(pool_id: Ulid, unit: u32, i: u64) -> String {
    let (date, start, end) = slot(i);
    format!(
        r#"INSERT INTO reservations (pool_id, kind, unit_number, "date", start, "end") VALUES ('{pool_id}', 'generic', {unit}, '{date}', '{start}', '{end}')"#
    )
}

fn bench_pool() -> Pool {
    let midnight = "00:00".parse().unwrap();
    Pool {
        id: Ulid::new(),
        name: "Bench Arena".into(),
        manager_id: "bench-admin".into(),
        is_active: true,
        schedule: Schedule {
            default: Some(OperatingHours::new(midnight, midnight)),
            ..Schedule::default()
        },
        units: UnitCounts {
            generic: UNITS,
            consoles: HashMap::new(),
        },
        rates: RateCard {
            default_rate: 100.0,
            ..RateCard::default()
        },
    }
}

/// Serve a fresh engine, WAL-backed, on a loopback port.
async fn start_server(pools: Vec<Pool>) -> SocketAddr {
    let dir = std::env::temp_dir().join(format!("stationd_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let store = Arc::new(LedgerStore::open(&dir.join("reservations.wal")).unwrap());
    let directory = Arc::new(StaticDirectory::from_pools(pools).unwrap());
    let engine = Arc::new(Engine::new(store, directory, Arc::new(NotifyHub::new())));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, PASSWORD.into(), None).await;
            });
        }
    });
    addr
}

async fn connect(addr: SocketAddr, user: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("stationd")
        .user(user)
        .password(PASSWORD);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

async fn phase1_sequential(addr: SocketAddr, pool_id: Ulid) {
    let client = connect(addr, "player-seq").await;

    let n = 2000u64;
    let mut latencies = Vec::with_capacity(n as usize);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        client
            .batch_execute(&insert_sql(pool_id, 1, i))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} reservations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Many clients race for the same unit on the same slot, slot after slot.
/// Exactly one may win each race.
async fn phase2_contention(addr: SocketAddr, pool_id: Ulid) {
    let n_clients = 25;
    let n_slots = 40u64;

    let mut clients = Vec::with_capacity(n_clients);
    for c in 0..n_clients {
        clients.push(Arc::new(connect(addr, &format!("player-{c}")).await));
    }

    let start = Instant::now();
    let mut conflicts = 0usize;
    for i in 0..n_slots {
        let mut handles = Vec::with_capacity(n_clients);
        for client in &clients {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client.batch_execute(&insert_sql(pool_id, 2, i)).await
            }));
        }
        let mut winners = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(()) => winners += 1,
                Err(e) if e.code().is_some_and(|c| c.code() == "23P01") => conflicts += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(winners, 1, "slot {i} admitted {winners} writers");
    }

    let elapsed = start.elapsed();
    let total = n_clients as u64 * n_slots;
    println!(
        "  {n_clients} clients x {n_slots} slots = {total} attempts in {:.2}s, {conflicts} conflicts, one winner per slot",
        elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load(addr: SocketAddr, pool_id: Ulid) {
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5u32 {
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(addr, &format!("writer-{w}")).await;
            // Units 3..=7, one per writer, so writers never collide.
            let mut i = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let _ = client.batch_execute(&insert_sql(pool_id, 3 + w, i)).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500u64;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        reader_handles.push(tokio::spawn(async move {
            let client = connect(addr, &format!("reader-{r}")).await;
            let mut latencies = Vec::with_capacity(reads_per_reader as usize);
            for i in 0..reads_per_reader {
                let (date, start, end) = slot(i % 200);
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        r#"SELECT * FROM available_units WHERE pool_id = '{pool_id}' AND kind = 'generic' AND "date" = '{date}' AND start = '{start}' AND "end" = '{end}'"#
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("available_units query", &mut all_latencies);
}

async fn phase4_connection_storm(addr: SocketAddr, pool_id: Ulid) {
    let n_conns = 50u64;
    let ops_per_conn = 10u64;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for c in 0..n_conns {
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(addr, &format!("storm-{c}")).await;
            // Unit 8, on slots no other connection touches.
            for i in 0..ops_per_conn {
                client
                    .batch_execute(&insert_sql(pool_id, 8, 10_000 + c * ops_per_conn + i))
                    .await
                    .unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let pool = bench_pool();
    let pool_id = pool.id;
    let addr = start_server(vec![pool]).await;

    println!("=== stationd stress benchmark ===");
    println!("in-process server on {addr}, {UNITS} generic units\n");

    println!("[phase 1] sequential write throughput");
    phase1_sequential(addr, pool_id).await;

    println!("\n[phase 2] same-unit contention");
    phase2_contention(addr, pool_id).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(addr, pool_id).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(addr, pool_id).await;

    println!("\n=== benchmark complete ===");
}
