//! Dynamic connection-pool sizing policies (spec.md §4.2).
//!
//! Pure, side-effect-free decision logic so it can be unit-tested without
//! spinning up any I/O — the Peer task owns the timer and the mutation of
//! the actual pool.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizingMethod {
    Static,
    Queue,
    Aps,
    Combined,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resize {
    Grow,
    Shrink,
    Unchanged,
}

pub struct PoolSizer {
    method: SizingMethod,
    alpha: f64,
    backlog_filter: f64,
    high_watermark: f64,
    low_watermark: f64,
    prev_articles_per_period: f64,
    aps_threshold: f64,
}

impl PoolSizer {
    pub fn new(method: SizingMethod, alpha: f64, high_watermark: f64, low_watermark: f64, aps_threshold: f64) -> Self {
        Self {
            method,
            alpha,
            backlog_filter: 0.0,
            high_watermark,
            low_watermark,
            prev_articles_per_period: 0.0,
            aps_threshold,
        }
    }

    /// Called once per resize period.
    pub fn decide(&mut self, queued_len: usize, highwater: usize, articles_this_period: u64, recent_accept_ratio: f64) -> Resize {
        match self.method {
            SizingMethod::Static => Resize::Unchanged,
            SizingMethod::Queue => self.decide_queue(queued_len, highwater),
            SizingMethod::Aps => self.decide_aps(articles_this_period),
            SizingMethod::Combined => {
                let q = self.decide_queue(queued_len, highwater);
                let a = self.decide_aps(articles_this_period);
                combine(q, a, recent_accept_ratio)
            }
        }
    }

    fn decide_queue(&mut self, queued_len: usize, highwater: usize) -> Resize {
        let highwater = highwater.max(1) as f64;
        let ratio = queued_len as f64 / highwater;
        // entries above the high-water mark are penalised so the filter
        // doesn't lock the peer just below it (spec.md §4.2).
        let contribution = if ratio > 1.0 { (ratio + 1.0) / 2.0 } else { ratio };
        self.backlog_filter = self.alpha * self.backlog_filter + (1.0 - self.alpha) * contribution;

        if self.backlog_filter > self.high_watermark {
            Resize::Grow
        } else if self.backlog_filter < self.low_watermark {
            Resize::Shrink
        } else {
            Resize::Unchanged
        }
    }

    fn decide_aps(&mut self, articles_this_period: u64) -> Resize {
        let rate = articles_this_period as f64;
        let diff = rate - self.prev_articles_per_period;
        self.prev_articles_per_period = rate;
        if diff > self.aps_threshold {
            Resize::Grow
        } else if diff < -self.aps_threshold {
            Resize::Shrink
        } else {
            Resize::Unchanged
        }
    }
}

/// Blends the queue-based and aps-based signals, weighting the aps signal
/// by the square of the peer's recent accept percentage: a peer accepting
/// almost everything trusts its throughput trend more than its backlog.
fn combine(queue: Resize, aps: Resize, recent_accept_ratio: f64) -> Resize {
    let aps_weight = recent_accept_ratio.clamp(0.0, 1.0).powi(2);
    if aps_weight >= 0.5 {
        if aps != Resize::Unchanged {
            aps
        } else {
            queue
        }
    } else if queue != Resize::Unchanged {
        queue
    } else {
        aps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_never_resizes() {
        let mut s = PoolSizer::new(SizingMethod::Static, 0.5, 0.8, 0.2, 1.0);
        assert_eq!(s.decide(1000, 10, 500, 1.0), Resize::Unchanged);
    }

    #[test]
    fn queue_grows_under_sustained_backlog() {
        let mut s = PoolSizer::new(SizingMethod::Queue, 0.5, 0.8, 0.2, 1.0);
        let mut last = Resize::Unchanged;
        for _ in 0..10 {
            last = s.decide(50, 5, 0, 0.0);
        }
        assert_eq!(last, Resize::Grow);
    }

    #[test]
    fn queue_shrinks_when_empty() {
        let mut s = PoolSizer::new(SizingMethod::Queue, 0.5, 0.8, 0.2, 1.0);
        let mut last = Resize::Unchanged;
        for _ in 0..10 {
            last = s.decide(0, 5, 0, 0.0);
        }
        assert_eq!(last, Resize::Shrink);
    }
}
