use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::time::{sleep, Instant, Sleep};

/// Resettable deadline used for the round timeout and the sync retry tick.
/// Reset re-arms exactly once; missed fires never accumulate.
pub struct Timer {
    duration: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl Timer {
    pub fn new(duration_ms: u64) -> Self {
        let duration = Duration::from_millis(duration_ms);
        Timer {
            duration,
            sleep: Box::pin(sleep(duration)),
        }
    }

    pub fn reset(&mut self) {
        self.sleep.as_mut().reset(Instant::now() + self.duration);
    }
}

impl Future for Timer {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.sleep.as_mut().poll(cx)
    }
}
