//! Helpers shared by unit tests.

use std::time::Duration;

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn eventually<F>(condition: F)
where
    F: Fn() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}
