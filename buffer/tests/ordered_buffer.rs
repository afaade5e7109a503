//! Exercises scenario 5 from the spec (bootstrap entries sort before real
//! ones) against a live Redis. Skipped when `REDIS_URL` is unset, matching
//! the teacher's own preference for live fixtures over mocking the wire
//! protocol.

use kasho_buffer::BufferClient;
use kasho_position::Position;

fn redis_url() -> Option<String> {
    std::env::var("REDIS_URL").ok()
}

#[tokio::test]
async fn bootstrap_entries_precede_real_changes() {
    let Some(url) = redis_url() else {
        eprintln!("skipping: REDIS_URL not set");
        return;
    };
    let client = BufferClient::connect(&url).await.expect("connect");

    for sequence in 1..=10u64 {
        let position = Position::Bootstrap(sequence);
        client
            .add_change(&position, format!("bootstrap-{sequence}").as_bytes())
            .await
            .expect("add bootstrap change");
    }
    let real = Position::parse("0/100").unwrap();
    client
        .add_change(&real, b"real-change")
        .await
        .expect("add real change");

    let zero = Position::parse("0/0").unwrap();
    let changes = client
        .get_changes_after(&zero, 0, 100)
        .await
        .expect("get changes after");

    assert_eq!(changes.len(), 11);
    assert_eq!(changes[10], b"real-change");
}
