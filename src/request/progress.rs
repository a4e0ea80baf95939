//! Progress estimation for network requests
//!
//! Progress combines four weighted parts: waiting to connect, sending the
//! body, waiting for the response, and receiving the body. Byte counts with
//! an unknown total approach but never reach completion. When a total becomes
//! known the displayed value is held steady so progress never goes backwards.

use crate::transport::TransferMetrics;
use tokio::time::Instant;

const ESTIMATED_UPLOAD_BYTES: f64 = 8192.0;
const ESTIMATED_DOWNLOAD_BYTES: f64 = 65536.0;
const ESTIMATED_CONNECT_SECS: f64 = 2.5;
const ESTIMATED_RESPONSE_SECS: f64 = 1.2;

/// Highest value reported before the request completes
const IN_FLIGHT_CEILING: f64 = 1.0 - f64::EPSILON;

#[derive(Debug, Clone)]
struct TaskProgress {
    completed: f64,
    actual_total: Option<f64>,
    estimated_total: f64,
}

impl TaskProgress {
    fn new(estimated_total: f64) -> Self {
        Self {
            completed: 0.0,
            actual_total: None,
            estimated_total,
        }
    }

    fn fraction_done(&self) -> f64 {
        match self.actual_total {
            Some(total) if total > 0.0 => (self.completed / total).min(1.0),
            Some(_) => 1.0,
            None => (1.0 - 2f64.powf(-2.0 * self.completed / self.estimated_total))
                .min(IN_FLIGHT_CEILING),
        }
    }

    fn complete(&mut self) {
        let total = self.actual_total.unwrap_or(self.completed).max(1.0);
        self.actual_total = Some(total);
        self.completed = total;
    }
}

/// Progress over time spent waiting, started on the first tick
#[derive(Debug, Clone)]
struct WaitingProgress {
    progress: TaskProgress,
    started: Option<Instant>,
}

impl WaitingProgress {
    fn new(estimated_secs: f64) -> Self {
        Self {
            progress: TaskProgress::new(estimated_secs),
            started: None,
        }
    }

    fn tick(&mut self) {
        if self.progress.actual_total.is_some() {
            return;
        }
        let started = *self.started.get_or_insert_with(Instant::now);
        self.progress.completed = started.elapsed().as_secs_f64();
    }

    fn complete(&mut self) {
        self.progress.complete();
    }

    fn fraction_done(&self) -> f64 {
        self.progress.fraction_done()
    }
}

/// Estimated progress of one network request
#[derive(Debug, Clone)]
pub(crate) struct RequestProgress {
    connect: WaitingProgress,
    upload: TaskProgress,
    response: WaitingProgress,
    download: TaskProgress,
    upload_weight: f64,
    adjustment: f64,
    last_reported: f64,
}

impl RequestProgress {
    pub(crate) fn new(is_get: bool) -> Self {
        Self {
            connect: WaitingProgress::new(ESTIMATED_CONNECT_SECS),
            upload: TaskProgress::new(ESTIMATED_UPLOAD_BYTES),
            response: WaitingProgress::new(ESTIMATED_RESPONSE_SECS),
            download: TaskProgress::new(ESTIMATED_DOWNLOAD_BYTES),
            upload_weight: if is_get { 0.0 } else { 1.0 },
            adjustment: 1.0,
            last_reported: 0.0,
        }
    }

    fn raw_fraction_done(&self) -> f64 {
        let parts = [
            (self.connect.fraction_done(), 0.3),
            (self.upload.fraction_done(), self.upload_weight),
            (self.response.fraction_done(), 0.3),
            (self.download.fraction_done(), 1.0),
        ];
        let total_weight: f64 = parts.iter().map(|(_, weight)| weight).sum();
        parts
            .iter()
            .map(|(fraction, weight)| fraction * weight)
            .sum::<f64>()
            / total_weight
    }

    fn adjusted_fraction_done(&self) -> f64 {
        1.0 - (1.0 - self.raw_fraction_done()) * self.adjustment
    }

    /// Apply a change without moving the displayed fraction
    fn hold_constant(&mut self, change: impl FnOnce(&mut Self)) {
        let before = self.adjusted_fraction_done();
        change(self);
        let raw_after = self.raw_fraction_done();
        if raw_after < 1.0 {
            self.adjustment = (1.0 - before) / (1.0 - raw_after);
        }
    }

    /// Fold in the latest transport counters
    pub(crate) fn update(&mut self, metrics: TransferMetrics) {
        let upload_total = metrics.request_bytes_total.map(|n| n as f64);
        let download_total = metrics.response_bytes_total.map(|n| n as f64);
        if upload_total != self.upload.actual_total || download_total != self.download.actual_total
        {
            self.hold_constant(|progress| {
                progress.upload.actual_total = upload_total;
                progress.download.actual_total = download_total;
            });
        }

        self.upload.completed = metrics.request_bytes_sent as f64;
        self.download.completed = metrics.response_bytes_received as f64;

        let request_started = metrics.request_bytes_sent > 0;
        let response_started = metrics.response_bytes_received > 0;
        let request_sent = upload_total.is_none_or(|total| metrics.request_bytes_sent as f64 >= total);

        if request_started || response_started {
            self.connect.complete();
        } else {
            self.connect.tick();
        }

        if response_started {
            self.response.complete();
        } else if request_sent {
            self.response.tick();
        }
    }

    /// Current estimate in [0, 1), never lower than a previous report.
    /// Only completion of the request itself reports 1.
    pub(crate) fn fraction_done(&mut self) -> f64 {
        let fraction = self.adjusted_fraction_done().clamp(0.0, IN_FLIGHT_CEILING);
        self.last_reported = self.last_reported.max(fraction);
        self.last_reported
    }
}
