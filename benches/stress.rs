use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Days, Local, NaiveDate, NaiveTime};
use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

struct Target {
    host: String,
    port: u16,
    customer_password: String,
    supervisor_password: String,
}

async fn connect(target: &Target, user: String, password: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(&target.host)
        .port(target.port)
        .dbname("bayslot")
        .user(&user)
        .password(password);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

async fn supervisor(target: &Target) -> tokio_postgres::Client {
    connect(target, format!("supervisor:{}", Ulid::new()), &target.supervisor_password).await
}

async fn customer(target: &Target) -> tokio_postgres::Client {
    connect(target, format!("customer:{}", Ulid::new()), &target.customer_password).await
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

fn day(offset: u64) -> NaiveDate {
    Local::now().date_naive() + Days::new(offset + 1)
}

/// Create a slot in an unused window. Windows are derived from a fresh
/// ULID so repeated runs against one server do not collide.
async fn create_slot(client: &tokio_postgres::Client, capacity: u32) -> Ulid {
    let id = Ulid::new();
    let minute = (id.random() % (20 * 60)) as u32;
    let start = NaiveTime::from_hms_opt(minute / 60, minute % 60, 0).unwrap();
    let end = start + chrono::Duration::minutes(1);
    client
        .batch_execute(&format!(
            "INSERT INTO slots (id, start_time, end_time, capacity, note) VALUES ('{id}', '{}', '{}', {capacity}, 'bench')",
            start.format("%H:%M"),
            end.format("%H:%M"),
        ))
        .await
        .unwrap();
    id
}

fn book_sql(slot: Ulid, date: NaiveDate) -> String {
    format!(
        "INSERT INTO bookings (id, slot_id, date, package_id, vehicle_type, custom_vehicle_type, address, contact_number) \
         VALUES ('{}', '{slot}', '{date}', '{}', 'suv', NULL, '1 Bench St', '0400000000')",
        Ulid::new(),
        Ulid::new()
    )
}

async fn phase1_sequential(target: &Target) {
    let sup = supervisor(target).await;
    let slot = create_slot(&sup, 32_000).await;
    let client = customer(target).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        client
            .batch_execute(&book_sql(slot, day(i as u64)))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Many customers race for the same slot and date. Admissions must equal capacity.
async fn phase2_contention(target: Arc<Target>) {
    let capacity = 25u32;
    let n_tasks = 50;
    let n_per_task = 20;

    let sup = supervisor(&target).await;
    let slot = create_slot(&sup, capacity).await;
    let date = day(0);

    let admitted = Arc::new(AtomicUsize::new(0));
    let rejected = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let target = target.clone();
        let admitted = admitted.clone();
        let rejected = rejected.clone();
        handles.push(tokio::spawn(async move {
            let client = customer(&target).await;
            for _ in 0..n_per_task {
                match client.batch_execute(&book_sql(slot, date)).await {
                    Ok(()) => admitted.fetch_add(1, Ordering::Relaxed),
                    Err(_) => rejected.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ok = admitted.load(Ordering::Relaxed);
    println!(
        "  {total} attempts in {:.2}s: {ok} admitted, {} rejected (capacity {capacity})",
        elapsed.as_secs_f64(),
        rejected.load(Ordering::Relaxed)
    );
    if ok != capacity as usize {
        println!("  !! OVERSOLD OR UNDERFILLED: expected exactly {capacity} admissions");
    }
}

async fn phase3_read_under_load(target: Arc<Target>) {
    let sup = supervisor(&target).await;
    let slot = create_slot(&sup, 32_000).await;

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5u64 {
        let target = target.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = customer(&target).await;
            let mut i = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let _ = client.batch_execute(&book_sql(slot, day((w * 40 + i) % 200))).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();

    for r in 0..n_readers {
        let target = target.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = customer(&target).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let date = day(((r * reads_per_reader + i) % 200) as u64);
                let t = Instant::now();
                client
                    .simple_query(&format!("SELECT * FROM open_slots WHERE date = '{date}'"))
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

    print_latency("open slots query", &mut all_latencies);
}

async fn phase4_connection_storm(target: Arc<Target>) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let sup = supervisor(&target).await;
    let slot = create_slot(&sup, 10_000).await;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let target = target.clone();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = customer(&target).await;
            for i in 0..ops_per_conn {
                client.batch_execute(&book_sql(slot, day(i))).await.unwrap();
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
    let env = |key: &str, default: &str| std::env::var(key).unwrap_or_else(|_| default.into());
    let target = Arc::new(Target {
        host: env("BAYSLOT_HOST", "127.0.0.1"),
        port: env("BAYSLOT_PORT", "5433").parse().expect("invalid BAYSLOT_PORT"),
        customer_password: env("BAYSLOT_CUSTOMER_PASSWORD", "customer"),
        supervisor_password: env("BAYSLOT_SUPERVISOR_PASSWORD", "supervisor"),
    });

    println!("=== bayslot stress benchmark ===");
    println!("target: {}:{}\n", target.host, target.port);

    println!("[phase 1] sequential reservation throughput");
    phase1_sequential(&target).await;

    println!("\n[phase 2] contention on a single slot and date");
    phase2_contention(target.clone()).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(target.clone()).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(target).await;

    println!("\n=== done ===");
}
