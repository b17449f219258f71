use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use quotad::tenant::TenantManager;
use quotad::wire;

const HOUR: i64 = 3_600_000;
const DAY: i64 = 86_400_000;
// 2024-03-15T00:00:00Z.
const MAR15: i64 = 1_710_460_800_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("quotad_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, 63_072_000_000));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "quotad".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect_db(addr: SocketAddr, dbname: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("quotad")
        .password("quotad");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    connect_db(addr, "test").await
}

fn data_rows(messages: &[SimpleQueryMessage]) -> Vec<&tokio_postgres::SimpleQueryRow> {
    messages
        .iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn subject_crud_roundtrip() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let sid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO subjects (id, name) VALUES ('{sid}', 'alice')"
        ))
        .await
        .unwrap();

    let messages = client.simple_query("SELECT * FROM subjects").await.unwrap();
    let rows = data_rows(&messages);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(0), Some(sid.to_string().as_str()));
    assert_eq!(rows[0].get(1), Some("alice"));

    client
        .batch_execute(&format!("UPDATE subjects SET name = 'bob' WHERE id = '{sid}'"))
        .await
        .unwrap();
    let messages = client.simple_query("SELECT * FROM subjects").await.unwrap();
    assert_eq!(data_rows(&messages)[0].get(1), Some("bob"));

    client
        .batch_execute(&format!("DELETE FROM subjects WHERE id = '{sid}'"))
        .await
        .unwrap();
    let messages = client.simple_query("SELECT * FROM subjects").await.unwrap();
    assert!(data_rows(&messages).is_empty());
}

#[tokio::test]
async fn descending_limits_rejected() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let sid = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO subjects (id) VALUES ('{sid}')"))
        .await
        .unwrap();

    let err = client
        .batch_execute(&format!(
            "INSERT INTO booking_limits (subject_id, per_day, per_week) VALUES ('{sid}', 5, 1)"
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("ascending"), "unexpected error: {err}");

    // The rejected write stored nothing.
    let messages = client
        .simple_query(&format!(
            "SELECT * FROM booking_limits WHERE subject_id = '{sid}'"
        ))
        .await
        .unwrap();
    assert!(data_rows(&messages).is_empty());
}

#[tokio::test]
async fn limits_select_in_rank_order() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let sid = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO subjects (id) VALUES ('{sid}')"))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO booking_limits (subject_id, per_year, per_day) VALUES ('{sid}', 50, 2)"
        ))
        .await
        .unwrap();

    let messages = client
        .simple_query(&format!(
            "SELECT * FROM booking_limits WHERE subject_id = '{sid}'"
        ))
        .await
        .unwrap();
    let rows = data_rows(&messages);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get(0), Some("PER_DAY"));
    assert_eq!(rows[0].get(1), Some("2"));
    assert_eq!(rows[1].get(0), Some("PER_YEAR"));
    assert_eq!(rows[1].get(1), Some("50"));
}

#[tokio::test]
async fn booking_cap_enforced_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let sid = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO subjects (id) VALUES ('{sid}')"))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO booking_limits (subject_id, per_day) VALUES ('{sid}', 2)"
        ))
        .await
        .unwrap();

    for hour in [9, 11] {
        let start = MAR15 + hour * HOUR;
        let end = start + HOUR;
        client
            .batch_execute(&format!(
                r#"INSERT INTO bookings (id, subject_id, start, "end") VALUES ('{}', '{sid}', {start}, {end})"#,
                Ulid::new()
            ))
            .await
            .unwrap();
    }

    // Third booking the same day trips the cap.
    let start = MAR15 + 14 * HOUR;
    let err = client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, subject_id, start, "end") VALUES ('{}', '{sid}', {start}, {})"#,
            Ulid::new(),
            start + HOUR
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("booking limit reached"), "unexpected error: {err}");

    // The next day is open.
    let start = MAR15 + DAY + 9 * HOUR;
    client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, subject_id, start, "end") VALUES ('{}', '{sid}', {start}, {})"#,
            Ulid::new(),
            start + HOUR
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn batch_insert_is_atomic_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let sid = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO subjects (id) VALUES ('{sid}')"))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO booking_limits (subject_id, per_day) VALUES ('{sid}', 2)"
        ))
        .await
        .unwrap();

    let s1 = MAR15 + 9 * HOUR;
    let s2 = MAR15 + 11 * HOUR;
    let s3 = MAR15 + 14 * HOUR;
    let err = client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, subject_id, start, "end") VALUES ('{}', '{sid}', {s1}, {}), ('{}', '{sid}', {s2}, {}), ('{}', '{sid}', {s3}, {})"#,
            Ulid::new(),
            s1 + HOUR,
            Ulid::new(),
            s2 + HOUR,
            Ulid::new(),
            s3 + HOUR
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("booking limit reached"));

    let messages = client
        .simple_query(&format!("SELECT * FROM bookings WHERE subject_id = '{sid}'"))
        .await
        .unwrap();
    assert!(data_rows(&messages).is_empty());
}

#[tokio::test]
async fn usage_rows_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let sid = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO subjects (id) VALUES ('{sid}')"))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO booking_limits (subject_id, per_day) VALUES ('{sid}', 3)"
        ))
        .await
        .unwrap();

    let start = MAR15 + 9 * HOUR;
    client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, subject_id, start, "end") VALUES ('{}', '{sid}', {start}, {})"#,
            Ulid::new(),
            start + HOUR
        ))
        .await
        .unwrap();

    let ts = MAR15 + 12 * HOUR;
    let messages = client
        .simple_query(&format!(
            "SELECT * FROM usage WHERE subject_id = '{sid}' AND ts = {ts}"
        ))
        .await
        .unwrap();
    let rows = data_rows(&messages);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(0), Some("booking"));
    assert_eq!(rows[0].get(1), Some("PER_DAY"));
    assert_eq!(rows[0].get(2), Some(MAR15.to_string().as_str()));
    assert_eq!(rows[0].get(3), Some((MAR15 + DAY).to_string().as_str()));
    assert_eq!(rows[0].get(4), Some("1"));
    assert_eq!(rows[0].get(5), Some("3"));
}

#[tokio::test]
async fn limits_replaced_wholesale_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let sid = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO subjects (id) VALUES ('{sid}')"))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO booking_limits (subject_id, per_day, per_week) VALUES ('{sid}', 2, 5)"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO booking_limits (subject_id, per_month) VALUES ('{sid}', 10)"
        ))
        .await
        .unwrap();

    let messages = client
        .simple_query(&format!(
            "SELECT * FROM booking_limits WHERE subject_id = '{sid}'"
        ))
        .await
        .unwrap();
    let rows = data_rows(&messages);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(0), Some("PER_MONTH"));
}

#[tokio::test]
async fn duration_limits_enforced_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let sid = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO subjects (id) VALUES ('{sid}')"))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO duration_limits (subject_id, per_day) VALUES ('{sid}', 90)"
        ))
        .await
        .unwrap();

    let start = MAR15 + 9 * HOUR;
    client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, subject_id, start, "end") VALUES ('{}', '{sid}', {start}, {})"#,
            Ulid::new(),
            start + HOUR
        ))
        .await
        .unwrap();

    // Another hour would put the day at 120 booked minutes, over the 90 cap.
    let start = MAR15 + 11 * HOUR;
    let err = client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, subject_id, start, "end") VALUES ('{}', '{sid}', {start}, {})"#,
            Ulid::new(),
            start + HOUR
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("duration limit reached"), "unexpected error: {err}");
}

#[tokio::test]
async fn tenants_are_isolated() {
    let (addr, _tm) = start_test_server().await;
    let client_a = connect_db(addr, "tenant_a").await;
    let client_b = connect_db(addr, "tenant_b").await;

    let sid = Ulid::new();
    for client in [&client_a, &client_b] {
        client
            .batch_execute(&format!("INSERT INTO subjects (id) VALUES ('{sid}')"))
            .await
            .unwrap();
    }
    client_a
        .batch_execute(&format!(
            "INSERT INTO booking_limits (subject_id, per_day) VALUES ('{sid}', 1)"
        ))
        .await
        .unwrap();

    // Tenant A's cap binds only tenant A.
    let messages = client_b
        .simple_query(&format!(
            "SELECT * FROM booking_limits WHERE subject_id = '{sid}'"
        ))
        .await
        .unwrap();
    assert!(data_rows(&messages).is_empty());

    let start = MAR15 + 9 * HOUR;
    client_a
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, subject_id, start, "end") VALUES ('{}', '{sid}', {start}, {})"#,
            Ulid::new(),
            start + HOUR
        ))
        .await
        .unwrap();
    let start2 = MAR15 + 11 * HOUR;
    let err = client_a
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, subject_id, start, "end") VALUES ('{}', '{sid}', {start2}, {})"#,
            Ulid::new(),
            start2 + HOUR
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("booking limit reached"));

    // Tenant B records freely at the same instant.
    for offset in [9, 11, 14] {
        let s = MAR15 + offset * HOUR;
        client_b
            .batch_execute(&format!(
                r#"INSERT INTO bookings (id, subject_id, start, "end") VALUES ('{}', '{sid}', {s}, {})"#,
                Ulid::new(),
                s + HOUR
            ))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn listen_registration_accepted() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let sid = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO subjects (id) VALUES ('{sid}')"))
        .await
        .unwrap();

    client
        .batch_execute(&format!("LISTEN subject_{sid}"))
        .await
        .unwrap();
    client
        .batch_execute(&format!("UNLISTEN subject_{sid}"))
        .await
        .unwrap();

    // A malformed channel is rejected.
    let err = client.batch_execute("LISTEN bookings_42").await.unwrap_err();
    assert!(err.to_string().contains("invalid channel"));
}
