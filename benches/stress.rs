use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, Local, NaiveDate};
use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

async fn connect(host: &str, port: u16, dbname: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config.host(host).port(port).dbname(dbname).user("staylock");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn fresh_db() -> String {
    format!("bench_{}", Ulid::new())
}

fn day(n: u64) -> NaiveDate {
    Local::now().date_naive() + Days::new(1 + n)
}

fn insert_booking(guest: &str, property: &str, start: NaiveDate, end: NaiveDate) -> String {
    format!(
        "INSERT INTO bookings (guest_name, guest_email, property_id, start_date, end_date) \
         VALUES ('{guest}', 'bench@example.com', '{property}', '{start}', '{end}')"
    )
}

fn is_conflict(e: &tokio_postgres::Error) -> bool {
    e.code().map(|c| c.code()) == Some("23P01")
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

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port, &fresh_db()).await;

    // Single-day stays on consecutive days, so none of them conflict.
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n as u64 {
        let sql = insert_booking("Seq Guest", "seq-villa", day(i), day(i));
        let t = Instant::now();
        client.batch_execute(&sql).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_contention(host: &str, port: u16) {
    // Every task races for the same stays on the same property.
    let db = fresh_db();
    let n_tasks = 20;
    let n_stays = 100u64;

    let won = Arc::new(AtomicUsize::new(0));
    let lost = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for t in 0..n_tasks {
        let host = host.to_string();
        let db = db.clone();
        let won = won.clone();
        let lost = lost.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &db).await;
            let guest = format!("Guest {t}");
            for s in 0..n_stays {
                let sql = insert_booking(&guest, "hot-villa", day(s * 3), day(s * 3 + 1));
                match client.batch_execute(&sql).await {
                    Ok(()) => won.fetch_add(1, Ordering::Relaxed),
                    Err(e) if is_conflict(&e) => lost.fetch_add(1, Ordering::Relaxed),
                    Err(e) => panic!("unexpected error: {e}"),
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
        "  {n_tasks} tasks x {n_stays} stays in {:.2}s: {won} booked, {lost} conflicts",
        elapsed.as_secs_f64()
    );
    assert_eq!(won as u64, n_stays, "each stay must be booked exactly once");
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let db = fresh_db();

    let setup_client = connect(host, port, &db).await;
    for i in 0..200u64 {
        setup_client
            .batch_execute(&insert_booking("Reader Guest", "read-villa", day(i * 2), day(i * 2)))
            .await
            .unwrap();
    }
    drop(setup_client);

    // Writers keep adding to other properties in the same tenant.
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let host = host.to_string();
        let db = db.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &db).await;
            let property = format!("write-villa-{w}");
            let mut i = 0u64;
            while !stop.load(Ordering::Relaxed) && i < 3000 {
                let _ = client
                    .batch_execute(&insert_booking("Writer", &property, day(i), day(i)))
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
        let db = db.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &db).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let sql = if (r + i) % 2 == 0 {
                    "SELECT * FROM bookings WHERE property_id = 'read-villa'"
                } else {
                    "SELECT * FROM bookings WHERE guest_name = 'reader guest'"
                };
                let t = Instant::now();
                client.simple_query(sql).await.unwrap();
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

    print_latency("booking reads", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10u64;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for c in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &fresh_db()).await;
            let property = format!("storm-{c}");
            for i in 0..ops_per_conn {
                client
                    .batch_execute(&insert_booking("Storm", &property, day(i), day(i)))
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
    let host = std::env::var("STAYLOCK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("STAYLOCK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid STAYLOCK_PORT");

    println!("=== staylock stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential write throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] overlapping writes on one property");
    phase2_contention(&host, port).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
