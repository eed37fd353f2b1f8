#![allow(dead_code)]

use std::sync::Arc;

use chrono::Duration;
use rampart::{
    Clock, InMemoryRepositoryProvider, ManualClock, Rampart, RampartBuilder, RepositoryProvider,
};
use rampart_core::crypto::SecretSealer;

pub const START: i64 = 1_700_000_000;

pub fn secret_key() -> String {
    SecretSealer::generate_key().unwrap()
}

pub async fn memory_rampart() -> (Rampart<InMemoryRepositoryProvider>, ManualClock) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let clock = ManualClock::at_unix(START);
    let rampart = RampartBuilder::new()
        .with_memory()
        .with_secret_key(secret_key())
        .with_clock(Arc::new(clock.clone()))
        .build()
        .await
        .unwrap();
    (rampart, clock)
}

/// The TOTP code for the clock's current step.
pub fn current_code<R: RepositoryProvider>(rampart: &Rampart<R>, secret: &str) -> String {
    rampart
        .two_factor()
        .engine()
        .generate_current_code(secret)
        .unwrap()
}

/// A six digit code that no step inside the accepted drift window produces.
pub fn wrong_code<R: RepositoryProvider>(
    rampart: &Rampart<R>,
    clock: &ManualClock,
    secret: &str,
) -> String {
    let engine = rampart.two_factor().engine();
    let secs = clock.now().timestamp() as u64;
    let valid: Vec<String> = [secs - 30, secs, secs + 30]
        .iter()
        .map(|t| engine.generate_code_at(secret, *t).unwrap())
        .collect();
    ["000000", "111111", "222222", "333333"]
        .into_iter()
        .find(|candidate| !valid.iter().any(|v| v == candidate))
        .unwrap()
        .to_string()
}

pub fn one_step() -> Duration {
    Duration::seconds(30)
}
