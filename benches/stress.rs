use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

use quotad::tenant::TenantManager;
use quotad::wire;

const HOUR: i64 = 3_600_000;
const DAY: i64 = 86_400_000;
// 2024-01-01T00:00:00Z — bench bookings spread forward from here.
const BASE: i64 = 1_704_067_200_000;

async fn start_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("quotad_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 100_000, 63_072_000_000));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "quotad".to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: std::net::SocketAddr) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(format!("bench_{}", Ulid::new()))
        .user("quotad")
        .password("quotad");

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
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

async fn setup(client: &tokio_postgres::Client, subjects: usize) -> Vec<Ulid> {
    let mut ids = Vec::with_capacity(subjects);
    for _ in 0..subjects {
        let sid = Ulid::new();
        client
            .batch_execute(&format!("INSERT INTO subjects (id) VALUES ('{sid}')"))
            .await
            .unwrap();
        // Generous caps so the insert path measures admission, not rejection.
        client
            .batch_execute(&format!(
                "INSERT INTO booking_limits (subject_id, per_day, per_week) VALUES ('{sid}', 100, 500)"
            ))
            .await
            .unwrap();
        ids.push(sid);
    }
    println!("  created {} subjects", ids.len());
    ids
}

#[tokio::main]
async fn main() {
    let addr = start_server().await;
    let client = connect(addr).await;

    println!("quotad stress bench");

    let subjects = setup(&client, 10).await;

    // Phase 1: booking inserts, spread so caps never reject.
    let inserts = 2_000;
    let mut latencies = Vec::with_capacity(inserts);
    for i in 0..inserts {
        let sid = subjects[i % subjects.len()];
        let day = (i / (subjects.len() * 50)) as i64;
        let hour = ((i / subjects.len()) % 50) as i64 % 24;
        let start = BASE + day * DAY + hour * HOUR + (i as i64 % 2) * 1_800_000;
        let sql = format!(
            r#"INSERT INTO bookings (id, subject_id, start, "end") VALUES ('{}', '{sid}', {start}, {})"#,
            Ulid::new(),
            start + 1_500_000
        );
        let t = Instant::now();
        client.batch_execute(&sql).await.unwrap();
        latencies.push(t.elapsed());
    }
    print_latency("booking insert", &mut latencies);

    // Phase 2: usage queries.
    let queries = 2_000;
    let mut latencies = Vec::with_capacity(queries);
    for i in 0..queries {
        let sid = subjects[i % subjects.len()];
        let ts = BASE + ((i % 40) as i64) * DAY + 12 * HOUR;
        let sql = format!("SELECT * FROM usage WHERE subject_id = '{sid}' AND ts = {ts}");
        let t = Instant::now();
        client.simple_query(&sql).await.unwrap();
        latencies.push(t.elapsed());
    }
    print_latency("usage query", &mut latencies);

    // Phase 3: limit replacements (validate + wholesale upsert).
    let replacements = 1_000;
    let mut latencies = Vec::with_capacity(replacements);
    for i in 0..replacements {
        let sid = subjects[i % subjects.len()];
        let cap = 100 + (i % 50) as u32;
        let sql = format!(
            "INSERT INTO booking_limits (subject_id, per_day, per_week) VALUES ('{sid}', {cap}, {})",
            cap * 5
        );
        let t = Instant::now();
        client.batch_execute(&sql).await.unwrap();
        latencies.push(t.elapsed());
    }
    print_latency("limit replace", &mut latencies);
}
