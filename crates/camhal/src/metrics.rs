use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram},
};

/// Pipeline instruments. No-ops until a meter provider is installed.
#[derive(Clone)]
pub struct PipelineMetrics {
    pub frames_delivered: Counter<u64>,
    pub frames_dropped: Counter<u64>,
    pub would_block: Counter<u64>,
    pub decode_failures: Counter<u64>,
    pub forced_resets: Counter<u64>,
    pub convert_duration: Histogram<f64>,
    camera: KeyValue,
}

impl PipelineMetrics {
    pub fn new(camera_id: u32) -> Self {
        let meter = global::meter("camhal");
        let buckets = [0.0005, 0.001, 0.002, 0.005, 0.01, 0.02, 0.05, 0.1];
        Self {
            frames_delivered: meter
                .u64_counter("camhal_frames_delivered_total")
                .with_description("Frames handed to the subscriber")
                .build(),
            frames_dropped: meter
                .u64_counter("camhal_frames_dropped_total")
                .with_description("Frames requeued without delivery")
                .build(),
            would_block: meter
                .u64_counter("camhal_would_block_total")
                .with_description("Dequeue attempts that found no frame")
                .build(),
            decode_failures: meter
                .u64_counter("camhal_decode_failures_total")
                .with_description("Compressed frames that failed to decode")
                .build(),
            forced_resets: meter
                .u64_counter("camhal_forced_resets_total")
                .with_description("Stream restarts triggered by error recovery")
                .build(),
            convert_duration: meter
                .f64_histogram("camhal_convert_duration_seconds")
                .with_description("Time to convert one frame")
                .with_unit("s")
                .with_boundaries(buckets.to_vec())
                .build(),
            camera: KeyValue::new("camera", camera_id as i64),
        }
    }

    pub fn attrs(&self) -> [KeyValue; 1] {
        [self.camera.clone()]
    }
}
