//! Test data builders for creating test objects

use campipe::config::PipelineConfig;
use campipe::pipeline::{CaptureRequest, RequestParams, SelectPolicy};
use campipe::types::{Rect, StreamKind};

/// Builder for session configurations with test-friendly timings
pub struct ConfigBuilder {
    config: PipelineConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        let mut config = PipelineConfig::default();
        config.pipeline.pacing_timeout_ms = 20;
        config.pipeline.poll_interval_ms = 10;
        config.pipeline.flush_timeout_ms = 300;
        config.pipeline.capture_timeout_ms = 500;
        Self { config }
    }

    pub fn dual() -> Self {
        let mut builder = Self::new();
        let base = builder.config.pipeline.clone();
        builder.config = PipelineConfig::dual();
        builder.config.pipeline = base;
        builder.config.dual.settling_window = 1;
        builder
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.pipeline.batch_size = batch_size;
        self
    }

    pub fn settle_frames(mut self, frames: u64) -> Self {
        self.config.pipeline.settle_frames = frames;
        self
    }

    pub fn hold_count(mut self, hold_count: usize) -> Self {
        self.config.selector.hold_count = hold_count;
        self
    }

    pub fn flush_timeout_ms(mut self, ms: u64) -> Self {
        self.config.pipeline.flush_timeout_ms = ms;
        self
    }

    /// Fast monitor: fatal after a handful of short ticks
    pub fn eager_monitor(mut self) -> Self {
        self.config.monitor.interval_ms = 20;
        self.config.monitor.stage_stall_ticks = 5;
        self.config.monitor.result_stall_ticks = 10;
        self
    }

    pub fn face_detection(mut self) -> Self {
        self.config.features.face_detection = true;
        self
    }

    pub fn build(self) -> PipelineConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for capture requests
pub struct RequestBuilder {
    streams: Vec<StreamKind>,
    params: RequestParams,
}

impl RequestBuilder {
    pub fn preview() -> Self {
        Self {
            streams: vec![StreamKind::Preview],
            params: RequestParams::default(),
        }
    }

    pub fn stream(mut self, stream: StreamKind) -> Self {
        self.streams.push(stream);
        self
    }

    pub fn zoom(mut self, zoom_ratio: f32) -> Self {
        self.params.zoom_ratio = zoom_ratio;
        self
    }

    pub fn crop(mut self, crop: Rect) -> Self {
        self.params.crop = Some(crop);
        self
    }

    pub fn policy(mut self, policy: SelectPolicy) -> Self {
        self.params.capture = policy;
        self
    }

    pub fn build(self) -> CaptureRequest {
        CaptureRequest::new(self.streams).with_params(self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = RequestBuilder::preview()
            .stream(StreamKind::Still)
            .zoom(2.0)
            .build();

        assert!(request.wants(StreamKind::Preview));
        assert!(request.wants(StreamKind::Still));
        assert_eq!(request.params.zoom_ratio, 2.0);
    }

    #[test]
    fn test_config_builder_is_valid() {
        assert!(ConfigBuilder::new().batch_size(2).build().validate().is_ok());
        assert!(ConfigBuilder::dual().build().validate().is_ok());
    }
}
