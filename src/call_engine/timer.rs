//! Gesprächsdauer-Timer
//!
//! Läuft ab dem Eintritt in `Connected` und meldet die verbundene Zeit im
//! eingestellten Takt. Gehört allein dem Controller.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

#[derive(Debug, Default)]
pub struct CallTimer {
    ticker: Option<JoinHandle<()>>,
}

impl CallTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Startet den Timer neu. `on_tick` bekommt die Zeit seit `since`.
    pub fn start<F>(&mut self, period: Duration, since: std::time::Instant, on_tick: F)
    where
        F: Fn(Duration) + Send + 'static,
    {
        self.clear();

        let mut ticks = interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.ticker = Some(tokio::spawn(async move {
            loop {
                ticks.tick().await;
                on_tick(since.elapsed());
            }
        }));
    }

    /// Stoppt den Timer. `true` wenn er lief.
    pub fn clear(&mut self) -> bool {
        match self.ticker.take() {
            Some(ticker) => {
                ticker.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticker.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for CallTimer {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_ticks_until_cleared() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let mut timer = CallTimer::new();

        timer.start(Duration::from_millis(10), std::time::Instant::now(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timer.is_running());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(timer.clear());
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected ticks, got {seen}");

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
        assert!(!timer.is_running());
        assert!(!timer.clear());
    }

    #[tokio::test]
    async fn test_elapsed_is_measured_from_start() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut timer = CallTimer::new();
        let since = std::time::Instant::now() - Duration::from_secs(5);

        timer.start(Duration::from_millis(5), since, move |elapsed| {
            let _ = tx.send(elapsed);
        });

        let elapsed = rx.recv().await.unwrap();
        assert!(elapsed >= Duration::from_secs(5));
    }
}
