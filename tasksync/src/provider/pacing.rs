use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Spaces consecutive calls to a provider at least `delay` apart.
pub struct Pacer {
    delay: Duration,
    last: Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.delay {
                tokio::time::sleep(self.delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}
