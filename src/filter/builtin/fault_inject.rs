//! Delays the headers phase of a share of streams.
//!
//! The filter halts the chain and resumes it from a tokio timer task, so the
//! resumption arrives from another task, possibly on another worker thread.

use std::time::Duration;

use crate::config::schema::FaultInjectConfig;
use crate::filter::status::HeadersStatus;
use crate::filter::StreamFilter;
use crate::stream::handle::FilterHandle;
use crate::stream::payload::HeaderMap;

pub struct FaultInjectFilter {
    percentage: f64,
    delay: Duration,
    handle: Option<FilterHandle>,
}

impl FaultInjectFilter {
    pub fn new(config: &FaultInjectConfig) -> Self {
        Self {
            percentage: config.percentage,
            delay: Duration::from_millis(config.delay_ms),
            handle: None,
        }
    }

    fn selected(&self) -> bool {
        self.percentage >= 100.0 || fastrand::f64() * 100.0 < self.percentage
    }
}

impl StreamFilter for FaultInjectFilter {
    fn set_callbacks(&mut self, handle: FilterHandle) {
        self.handle = Some(handle);
    }

    fn on_headers(&mut self, _headers: &mut HeaderMap, _end_stream: bool) -> HeadersStatus {
        if !self.selected() {
            return HeadersStatus::Continue;
        }
        let Some(handle) = self.handle.clone() else {
            return HeadersStatus::Continue;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("No tokio runtime, fault injection skipped");
            return HeadersStatus::Continue;
        };

        let delay = self.delay;
        tracing::debug!(
            stream_id = ?handle.stream_id(),
            delay_ms = delay.as_millis() as u64,
            "Injecting delay"
        );
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = handle.resume() {
                tracing::trace!(error = %err, "Stream ended before injected delay elapsed");
            }
        });
        HeadersStatus::Stop
    }

    fn name(&self) -> &'static str {
        "fault_inject"
    }
}
