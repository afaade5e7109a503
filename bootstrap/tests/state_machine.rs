//! Scenario 6: from STREAMING, StartBootstrap is rejected and no state
//! change is persisted. Skipped when `REDIS_URL` is unset.

use std::sync::Arc;

use kasho_bootstrap::{BootstrapError, BootstrapState, StateMachine};
use kasho_buffer::BufferClient;

fn redis_url() -> Option<String> {
    std::env::var("REDIS_URL").ok()
}

#[tokio::test]
async fn start_bootstrap_from_streaming_is_illegal() {
    let Some(url) = redis_url() else {
        eprintln!("skipping: REDIS_URL not set");
        return;
    };
    let buffer = Arc::new(BufferClient::connect(&url).await.expect("connect"));
    let machine = StateMachine::load(buffer).await.expect("load");

    machine
        .start_bootstrap("0/500".to_string())
        .await
        .expect("start bootstrap");
    machine.complete_bootstrap().await.expect("complete bootstrap");
    assert_eq!(machine.current().await.state, BootstrapState::Streaming);

    let err = machine
        .start_bootstrap("0/500".to_string())
        .await
        .expect_err("must reject StartBootstrap while STREAMING");
    match err {
        BootstrapError::IllegalTransition { previous, current } => {
            assert_eq!(previous, BootstrapState::Streaming);
            assert_eq!(current, BootstrapState::Streaming);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(machine.current().await.state, BootstrapState::Streaming);
}
