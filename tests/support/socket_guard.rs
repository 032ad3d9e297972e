//! Localhost availability guard for wiremock-backed tests.
//!
//! Set `MEDIAFETCH_REQUIRE_SOCKET_TESTS=1` in CI so a sandbox without
//! loopback fails loudly instead of skipping.

use std::net::TcpListener;
use std::panic::Location;

use wiremock::MockServer;

const REQUIRE_SOCKET_TESTS_VAR: &str = "MEDIAFETCH_REQUIRE_SOCKET_TESTS";

/// Value a skipped test returns, so both `()` and `Result` tests can skip.
pub trait SkipValue {
    fn skipped() -> Self;
}

impl SkipValue for () {
    fn skipped() -> Self {}
}

impl<E> SkipValue for Result<(), E> {
    fn skipped() -> Self {
        Ok(())
    }
}

#[must_use]
pub fn socket_skip_return<T: SkipValue>() -> T {
    T::skipped()
}

fn sockets_required() -> bool {
    std::env::var(REQUIRE_SOCKET_TESTS_VAR)
        .is_ok_and(|value| matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

#[track_caller]
fn loopback_blocked() -> bool {
    if TcpListener::bind("127.0.0.1:0").is_ok() {
        return false;
    }
    let caller = Location::caller();
    let message = format!(
        "[socket-bound-test] loopback bind refused at {}:{}",
        caller.file(),
        caller.line()
    );
    assert!(
        !sockets_required(),
        "{message}; {REQUIRE_SOCKET_TESTS_VAR} is set"
    );
    eprintln!("{message}; skipping");
    true
}

/// Starts a mock server unless the sandbox forbids loopback sockets.
pub async fn start_mock_server_or_skip() -> Option<MockServer> {
    if loopback_blocked() {
        return None;
    }
    Some(MockServer::start().await)
}

/// True when a plain loopback listener can be bound.
#[must_use]
pub fn loopback_available() -> bool {
    !loopback_blocked()
}
