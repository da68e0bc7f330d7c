//! Load test against a running server started with `SLOTLOCK_POLICY_FILE=benches/policy.json`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const MINUTE: i64 = 60_000;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;
const WEEK: i64 = 7 * DAY;
// 2026-03-02, a Monday.
const MONDAY: i64 = 1_772_409_600_000;
/// 30-minute windows between 09:00 and 18:00.
const WINDOWS_PER_DAY: i64 = 18;

async fn connect(host: &str, port: u16, dbname: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(dbname)
        .user("slotlock")
        .password("slotlock");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn fresh_tenant() -> String {
    format!("bench_{}", Ulid::new())
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

/// A Monday at least a week out, so every hold gets the long timeout.
fn first_monday() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(MONDAY, |d| d.as_millis() as i64);
    MONDAY + ((now - MONDAY).div_euclid(WEEK) + 2) * WEEK
}

/// The `i`-th bookable 30-minute window, weekdays only.
fn window(base: i64, i: i64) -> (i64, i64) {
    let day = i / WINDOWS_PER_DAY;
    let start = base
        + (day / 5) * WEEK
        + (day % 5) * DAY
        + 9 * HOUR
        + (i % WINDOWS_PER_DAY) * 30 * MINUTE;
    (start, start + 30 * MINUTE)
}

fn hold_sql(pid: Ulid, (start, end): (i64, i64), reference: &str) -> String {
    format!(
        r#"INSERT INTO holds (professional_id, customer_id, start, "end", service_ids, payment_reference) VALUES ('{pid}', 'bench', {start}, {end}, 'std', '{reference}')"#
    )
}

async fn phase1_sequential(host: &str, port: u16, base: i64) {
    let client = connect(host, port, &fresh_tenant()).await;
    let pid = Ulid::new();

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        client
            .batch_execute(&hold_sql(pid, window(base, i as i64), &format!("seq_{i}")))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} holds in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("hold latency", &mut latencies);
}

async fn phase2_contention(host: &str, port: u16, base: i64) {
    let tenant = fresh_tenant();
    let pid = Ulid::new();
    let n_tasks = 20;
    let n_windows = 100;

    let won = Arc::new(AtomicUsize::new(0));
    let lost = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for task in 0..n_tasks {
        let host = host.to_string();
        let tenant = tenant.clone();
        let won = won.clone();
        let lost = lost.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            for i in 0..n_windows {
                let sql = hold_sql(pid, window(base, i), &format!("race_{task}_{i}"));
                match client.batch_execute(&sql).await {
                    Ok(()) => won.fetch_add(1, Ordering::Relaxed),
                    Err(_) => lost.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let won = won.load(Ordering::Relaxed);
    let lost = lost.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks racing for {n_windows} windows: {won} held, {lost} rejected in {:.2}s",
        elapsed.as_secs_f64()
    );
    if won != n_windows as usize {
        println!("  !! expected exactly {n_windows} holds");
    }
}

async fn phase3_search_under_load(host: &str, port: u16, base: i64) {
    let tenant = fresh_tenant();
    let stop = Arc::new(AtomicBool::new(false));

    // Writers keep placing holds for their own professionals.
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let host = host.to_string();
        let tenant = tenant.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let pid = Ulid::new();
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let _ = client
                    .batch_execute(&hold_sql(pid, window(base, i), &format!("w{w}_{i}")))
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();

    for r in 0..n_readers {
        let host = host.to_string();
        let tenant = tenant.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let pid = Ulid::new();
            // Every other window taken, so the search has gaps to find.
            for i in (0..WINDOWS_PER_DAY * 5).step_by(2) {
                client
                    .batch_execute(&hold_sql(pid, window(base, i), &format!("r{r}_{i}")))
                    .await
                    .unwrap();
            }

            let (from, to) = (base, base + WEEK);
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        r#"SELECT * FROM slots WHERE professional_id = '{pid}' AND start >= {from} AND "end" <= {to} AND duration = 30"#
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

    print_latency("slot search", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16, base: i64) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &fresh_tenant()).await;
            let pid = Ulid::new();
            for i in 0..ops_per_conn {
                client
                    .batch_execute(&hold_sql(pid, window(base, i), &format!("storm_{i}")))
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
        "  {n_conns} connections, {ops_per_conn} holds each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("SLOTLOCK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("SLOTLOCK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid SLOTLOCK_PORT");
    let base = first_monday();

    println!("=== slotlock stress benchmark ===");
    println!("target: {host}:{port}\n");

    // Each phase uses its own tenant to avoid interference

    println!("[phase 1] sequential hold throughput");
    phase1_sequential(&host, port, base).await;

    println!("\n[phase 2] contended holds on shared windows");
    phase2_contention(&host, port, base).await;

    println!("\n[phase 3] slot search latency under hold load");
    phase3_search_under_load(&host, port, base).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port, base).await;

    println!("\n=== benchmark complete ===");
}
