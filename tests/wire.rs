use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use slotguard::config::EngineConfig;
use slotguard::tenant::TenantManager;
use slotguard::wire;

const HOUR: i64 = 3_600_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotguard_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, EngineConfig::default()));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "slotguard".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect(addr: SocketAddr, db: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(db)
        .user("slotguard")
        .password("slotguard");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn query(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    rows(client.simple_query(sql).await.unwrap())
}

/// SQLSTATE of a failed statement.
async fn error_code(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.err().expect("statement should fail");
    err.as_db_error()
        .map(|db| db.code().code().to_string())
        .unwrap_or_else(|| panic!("not a server error: {err}"))
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

/// Tomorrow, on the hour.
fn tomorrow() -> i64 {
    (now_ms() / HOUR + 24) * HOUR
}

async fn register(client: &Client) -> (Ulid, Ulid) {
    let staff = Ulid::new();
    let subject = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO staff (id, name) VALUES ('{staff}', 'Dr. Vega'); \
             INSERT INTO subjects (id, name) VALUES ('{subject}', 'Case 1042')"
        ))
        .await
        .unwrap();
    (staff, subject)
}

async fn book(client: &Client, staff: Ulid, subject: Ulid, start: i64, end: i64) -> Ulid {
    let r = query(
        client,
        &format!(
            r#"INSERT INTO bookings (staff_id, subject_id, start, "end") VALUES ('{staff}', '{subject}', {start}, {end})"#
        ),
    )
    .await;
    assert_eq!(r.len(), 1);
    r[0].get("id").unwrap().parse().unwrap()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn register_and_list_resources() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "directory").await;

    let (staff, _) = register(&client).await;

    let listed = query(&client, "SELECT * FROM staff").await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("id"), Some(staff.to_string().as_str()));
    assert_eq!(listed[0].get("name"), Some("Dr. Vega"));
    assert_eq!(listed[0].get("booked"), Some("0"));

    let dup = format!("INSERT INTO staff (id) VALUES ('{staff}')");
    assert_eq!(error_code(&client, &dup).await, "23505");
}

#[tokio::test]
async fn insert_returns_scheduled_row() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "insert_row").await;
    let (staff, subject) = register(&client).await;
    let start = tomorrow() + 9 * HOUR;

    let r = query(
        &client,
        &format!(
            r#"INSERT INTO bookings (staff_id, subject_id, start, "end", kind, notes) VALUES ('{staff}', '{subject}', {start}, {}, 'therapy', 'bring forms')"#,
            start + HOUR / 2
        ),
    )
    .await;
    assert_eq!(r.len(), 1);
    assert_eq!(r[0].get("status"), Some("scheduled"));
    assert_eq!(r[0].get("kind"), Some("therapy"));
    assert_eq!(r[0].get("notes"), Some("bring forms"));
    assert_eq!(r[0].get("start"), Some(start.to_string().as_str()));

    let id = r[0].get("id").unwrap();
    let fetched = query(&client, &format!("SELECT * FROM bookings WHERE id = '{id}'")).await;
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].get("staff_id"), Some(staff.to_string().as_str()));
}

#[tokio::test]
async fn overlapping_booking_is_a_conflict() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "conflict").await;
    let (staff, subject) = register(&client).await;
    let other_subject = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO cases (id) VALUES ('{other_subject}')"))
        .await
        .unwrap();

    let t = tomorrow() + 10 * HOUR;
    let first = book(&client, staff, subject, t, t + HOUR / 2).await;

    let clash = format!(
        r#"INSERT INTO bookings (staff_id, subject_id, start, "end") VALUES ('{staff}', '{other_subject}', {}, {})"#,
        t + HOUR / 4,
        t + HOUR
    );
    let err = client.simple_query(&clash).await.err().unwrap();
    let db = err.as_db_error().unwrap();
    assert_eq!(db.code().code(), "23P01");
    assert!(db.message().contains(&first.to_string()));

    // Back to back is fine.
    book(&client, staff, other_subject, t + HOUR / 2, t + HOUR).await;
}

#[tokio::test]
async fn update_cancel_and_frozen() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "lifecycle").await;
    let (staff, subject) = register(&client).await;
    let t = tomorrow() + 14 * HOUR;
    let id = book(&client, staff, subject, t, t + HOUR).await;

    let moved = query(
        &client,
        &format!(
            r#"UPDATE bookings SET start = {}, "end" = {} WHERE id = '{id}'"#,
            t + HOUR,
            t + 2 * HOUR
        ),
    )
    .await;
    assert_eq!(moved[0].get("start"), Some((t + HOUR).to_string().as_str()));

    let done = query(&client, &format!("UPDATE bookings SET status = 'completed' WHERE id = '{id}'")).await;
    assert_eq!(done[0].get("status"), Some("completed"));

    let frozen = format!("UPDATE bookings SET start = {t} WHERE id = '{id}'");
    assert_eq!(error_code(&client, &frozen).await, "55000");

    let cancel = format!("UPDATE bookings SET status = 'cancelled' WHERE id = '{id}'");
    assert_eq!(error_code(&client, &cancel).await, "55000");

    let second = book(&client, staff, subject, t + 3 * HOUR, t + 4 * HOUR).await;
    for _ in 0..2 {
        let r = query(&client, &format!("UPDATE bookings SET status = 'cancelled' WHERE id = '{second}'")).await;
        assert_eq!(r[0].get("status"), Some("cancelled"));
    }
}

#[tokio::test]
async fn references_block_delete() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "refs").await;
    let (staff, subject) = register(&client).await;
    let t = tomorrow() + 8 * HOUR;
    let id = book(&client, staff, subject, t, t + HOUR).await;
    let note = Ulid::new();

    client
        .batch_execute(&format!("INSERT INTO booking_refs (booking_id, ref_id) VALUES ('{id}', '{note}')"))
        .await
        .unwrap();
    let delete = format!("DELETE FROM bookings WHERE id = '{id}'");
    assert_eq!(error_code(&client, &delete).await, "23503");

    client
        .batch_execute(&format!("DELETE FROM booking_refs WHERE booking_id = '{id}' AND ref_id = '{note}'"))
        .await
        .unwrap();
    client.batch_execute(&delete).await.unwrap();
    assert_eq!(
        error_code(&client, &format!("SELECT * FROM bookings WHERE id = '{id}'")).await,
        "P0002"
    );
}

#[tokio::test]
async fn availability_and_listing() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "availability").await;
    let (staff, subject) = register(&client).await;
    let day = tomorrow();
    book(&client, staff, subject, day + 10 * HOUR, day + 11 * HOUR).await;

    let slots = query(
        &client,
        &format!(
            r#"SELECT * FROM availability WHERE staff_id = '{staff}' AND subject_id = '{subject}' AND start >= {} AND "end" <= {} AND duration = {}"#,
            day + 9 * HOUR,
            day + 12 * HOUR,
            HOUR
        ),
    )
    .await;
    let got: Vec<(String, String)> = slots
        .iter()
        .map(|r| (r.get("start").unwrap().to_string(), r.get("end").unwrap().to_string()))
        .collect();
    assert_eq!(
        got,
        vec![
            ((day + 9 * HOUR).to_string(), (day + 10 * HOUR).to_string()),
            ((day + 11 * HOUR).to_string(), (day + 12 * HOUR).to_string()),
        ]
    );

    let listed = query(
        &client,
        &format!("SELECT * FROM bookings WHERE resource_id = '{subject}' AND status = 'scheduled'"),
    )
    .await;
    assert_eq!(listed.len(), 1);

    let in_range = query(
        &client,
        &format!(r#"SELECT * FROM bookings WHERE start >= {day} AND "end" <= {}"#, day + 24 * HOUR),
    )
    .await;
    assert_eq!(in_range.len(), 1);
}

#[tokio::test]
async fn listing_by_status_across_resources() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "by_status").await;
    let day = tomorrow();
    let (s1, c1) = register(&client).await;
    let (s2, c2) = register(&client).await;
    book(&client, s1, c1, day + 9 * HOUR, day + 10 * HOUR).await;
    book(&client, s2, c2, day + 9 * HOUR, day + 10 * HOUR).await;
    let dropped = book(&client, s1, c1, day + 14 * HOUR, day + 15 * HOUR).await;
    query(&client, &format!("UPDATE bookings SET status = 'cancelled' WHERE id = '{dropped}'")).await;

    let scheduled = query(&client, "SELECT * FROM bookings WHERE status = 'scheduled'").await;
    assert_eq!(scheduled.len(), 2);
    assert!(scheduled.iter().all(|r| r.get("status") == Some("scheduled")));

    let cancelled = query(&client, "SELECT * FROM bookings WHERE status = 'cancelled'").await;
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].get("id"), Some(dropped.to_string().as_str()));

    assert_eq!(query(&client, "SELECT * FROM bookings").await.len(), 3);

    let extreme = r#"SELECT * FROM bookings WHERE start >= -9000000000000000000 AND "end" <= 9000000000000000000"#;
    assert_eq!(error_code(&client, extreme).await, "22023");
}

#[tokio::test]
async fn bad_input_maps_to_sqlstates() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "errors").await;
    let (staff, subject) = register(&client).await;
    let t = tomorrow();

    // Empty interval.
    let empty = format!(
        r#"INSERT INTO bookings (staff_id, subject_id, start, "end") VALUES ('{staff}', '{subject}', {t}, {t})"#
    );
    assert_eq!(error_code(&client, &empty).await, "22023");

    // Unknown staff member.
    let ghost = format!(
        r#"INSERT INTO bookings (staff_id, subject_id, start, "end") VALUES ('{}', '{subject}', {t}, {})"#,
        Ulid::new(),
        t + HOUR
    );
    assert_eq!(error_code(&client, &ghost).await, "P0002");

    assert_eq!(error_code(&client, "SELECT * FROM rooms").await, "42601");
}

#[tokio::test]
async fn tenants_are_isolated() {
    let (addr, tm) = start_test_server().await;
    let a = connect(addr, "clinic_a").await;
    let b = connect(addr, "clinic_b").await;

    register(&a).await;
    assert_eq!(query(&a, "SELECT * FROM staff").await.len(), 1);
    assert!(query(&b, "SELECT * FROM staff").await.is_empty());
    assert_eq!(tm.tenant_count(), 2);
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "extended").await;
    let (staff, subject) = register(&client).await;
    let t = tomorrow() + 15 * HOUR;
    let id = book(&client, staff, subject, t, t + HOUR).await;

    let n = client
        .execute(
            "DELETE FROM booking_refs WHERE booking_id = $1 AND ref_id = $2",
            &[&id.to_string(), &Ulid::new().to_string()],
        )
        .await;
    // Nothing attached, so the detach is rejected with not-found.
    let err = n.err().unwrap();
    assert_eq!(err.as_db_error().unwrap().code().code(), "P0002");

    let affected = client
        .execute("DELETE FROM bookings WHERE id = $1", &[&id.to_string()])
        .await
        .unwrap();
    assert_eq!(affected, 1);
}
