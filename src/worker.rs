//! Component D: the per-job worker loop.
//!
//! Pops jobs off a private queue until it sees the `"end"` sentinel,
//! dispatching each one to the HDF5 reader + renderer pipeline (or, for
//! a legacy `.tif`/`.tiff` source file, straight to the TIFF renderer).

use crate::hdf5_reader::{ImageBufferCache, RawFrame};
use crate::metadata::MetadataExtractor;
use crate::queue::QueueClient;
use crate::render::{self, ContrastWindow, RenderImage, ViewRect};
use crate::request::{JobType, RequestDescriptor};
use anyhow::Result;
use log::{debug, warn};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const END_SENTINEL: &str = "end";

/// Render context shared by every worker in a supervisor's pool: the
/// per-master-file HDF5 cache and the (internally mutex-serialized)
/// metadata extractor. Workers themselves stay stateless across jobs.
pub struct WorkerContext {
    pub buffers: Arc<ImageBufferCache>,
    pub metadata: Arc<MetadataExtractor>,
}

/// Run one worker's loop against `private_key` until the sentinel
/// arrives or the queue connection fails. A malformed or unrecognized
/// job is logged and skipped — it never terminates the loop.
pub fn run(
    queue: &dyn QueueClient,
    private_key: &str,
    ctx: &WorkerContext,
    sink: &dyn ResultSink,
) -> Result<()> {
    loop {
        let raw = match queue.brpop(private_key, Duration::from_secs(0))? {
            Some(raw) => raw,
            None => {
                // Real BRPOP blocks until an element arrives; the
                // in-memory test double returns immediately instead, so
                // guard against spinning hot while waiting for one.
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
        };
        if raw == END_SENTINEL {
            debug!("worker on {} received end sentinel, exiting", private_key);
            return Ok(());
        }

        let request = match RequestDescriptor::from_json_str(&raw) {
            Ok(r) => r,
            Err(e) => {
                warn!("dropping malformed job on {}: {}", private_key, e);
                continue;
            }
        };

        match request.job_type() {
            Some(JobType::Jpeg) => {
                if let Err(e) = handle_jpeg(&request, ctx, sink) {
                    warn!("jpeg job failed for {}: {}", request.filename, e);
                }
            }
            Some(JobType::Profile) => {
                if let Err(e) = handle_profile(&request, ctx, sink) {
                    warn!("profile job failed for {}: {}", request.filename, e);
                }
            }
            None => {
                warn!("unknown job type '{}', skipping", request.job_type_raw);
            }
        }
    }
}

/// Where a worker hands off a finished render, plus the metadata object
/// accompanying it (populated for HDF5 sources; a minimal `{"fn": ...}`
/// object for legacy TIFF sources, which carry no frame-range or
/// detector-property metadata of their own).
pub trait ResultSink {
    fn send_jpeg(&self, request: &RequestDescriptor, jpeg: Vec<u8>, meta: Value) -> Result<()>;
    fn send_profile(&self, request: &RequestDescriptor, xml: String, meta: Value) -> Result<()>;
}

fn is_legacy_tiff(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    lower.ends_with(".tif") || lower.ends_with(".tiff")
}

enum Source {
    Hdf5 { image: RenderImage, meta: Value },
    Tiff { image: RenderImage, meta: Value },
}

fn load_source(request: &RequestDescriptor, ctx: &WorkerContext) -> Result<Source> {
    if is_legacy_tiff(&request.filename) {
        let image = render::read_tiff(&request.filename)?;
        let meta = json!({ "fn": request.filename });
        return Ok(Source::Tiff { image, meta });
    }

    let buffers = ctx.buffers.get_or_open(&request.filename);
    let frame = buffers.read_frame(request.frame)?;
    let image = frame_to_tiff_image(&frame);

    let mut meta = ctx
        .metadata
        .extract(&request.filename)
        .unwrap_or_else(|e| {
            warn!(
                "metadata extraction failed for {}: {} (continuing with frame info only)",
                request.filename, e
            );
            Value::Object(serde_json::Map::new())
        });
    if let Value::Object(map) = &mut meta {
        map.insert("frame".to_string(), Value::from(request.frame));
        map.insert("first_frame".to_string(), Value::from(frame.first_frame));
        map.insert("last_frame".to_string(), Value::from(frame.last_frame));
    }
    Ok(Source::Hdf5 { image, meta })
}

fn handle_jpeg(request: &RequestDescriptor, ctx: &WorkerContext, sink: &dyn ResultSink) -> Result<()> {
    let (image, meta) = match load_source(request, ctx)? {
        Source::Hdf5 { image, meta } => (image, meta),
        Source::Tiff { image, meta } => (image, meta),
    };
    let view = ViewRect {
        x: request.x,
        y: request.y,
        width: request.width,
        height: request.height,
    };
    let window = ContrastWindow {
        wval: request.wval,
        contrast: request.contrast,
    };
    let jpeg = render::render_jpeg(&image, view, request.xsize, request.ysize, window)?;
    sink.send_jpeg(request, jpeg, meta)
}

fn handle_profile(request: &RequestDescriptor, ctx: &WorkerContext, sink: &dyn ResultSink) -> Result<()> {
    let (image, meta) = match load_source(request, ctx)? {
        Source::Hdf5 { image, meta } => (image, meta),
        Source::Tiff { image, meta } => (image, meta),
    };
    let xml = render::render_profile(&image, request.pax, request.pay, request.pbx, request.pby)?;
    sink.send_profile(request, xml, meta)
}

fn frame_to_tiff_image(frame: &RawFrame) -> RenderImage {
    RenderImage {
        width: frame.width,
        height: frame.height,
        data: frame.data.iter().map(|v| *v as u16).collect(),
    }
}

/// A [`ResultSink`] that pushes the rendered bytes (and metadata) back
/// onto a result queue key derived from the request's `pid`.
pub struct QueueResultSink {
    queue: Arc<dyn QueueClient>,
}

impl QueueResultSink {
    pub fn new(queue: Arc<dyn QueueClient>) -> Self {
        Self { queue }
    }
}

impl ResultSink for QueueResultSink {
    fn send_jpeg(&self, request: &RequestDescriptor, jpeg: Vec<u8>, meta: Value) -> Result<()> {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(jpeg);
        let payload = json!({ "jpeg_base64": encoded, "meta": meta });
        self.queue
            .lpush(&format!("result:{}", request.pid), &payload.to_string())
    }

    fn send_profile(&self, request: &RequestDescriptor, xml: String, meta: Value) -> Result<()> {
        let payload = json!({ "profile_xml": xml, "meta": meta });
        self.queue
            .lpush(&format!("result:{}", request.pid), &payload.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryQueueClient;
    use std::sync::Mutex;

    struct CapturingSink {
        jpegs: Mutex<Vec<(Vec<u8>, Value)>>,
        profiles: Mutex<Vec<(String, Value)>>,
    }

    impl CapturingSink {
        fn new() -> Self {
            Self {
                jpegs: Mutex::new(Vec::new()),
                profiles: Mutex::new(Vec::new()),
            }
        }
    }

    impl ResultSink for CapturingSink {
        fn send_jpeg(&self, _request: &RequestDescriptor, jpeg: Vec<u8>, meta: Value) -> Result<()> {
            self.jpegs.lock().unwrap().push((jpeg, meta));
            Ok(())
        }
        fn send_profile(&self, _request: &RequestDescriptor, xml: String, meta: Value) -> Result<()> {
            self.profiles.lock().unwrap().push((xml, meta));
            Ok(())
        }
    }

    fn test_ctx() -> WorkerContext {
        WorkerContext {
            buffers: Arc::new(ImageBufferCache::new()),
            metadata: Arc::new(MetadataExtractor::new()),
        }
    }

    #[test]
    fn end_sentinel_terminates_the_loop() {
        let queue = InMemoryQueueClient::new();
        queue.push_shared("worker:1", "end");
        let ctx = test_ctx();
        let sink = CapturingSink::new();
        let result = run(&queue, "worker:1", &ctx, &sink);
        assert!(result.is_ok());
    }

    #[test]
    fn malformed_job_is_skipped_not_fatal() {
        let queue = InMemoryQueueClient::new();
        queue.push_shared("worker:2", "{not json");
        queue.push_shared("worker:2", "end");
        let ctx = test_ctx();
        let sink = CapturingSink::new();
        let result = run(&queue, "worker:2", &ctx, &sink);
        assert!(result.is_ok());
    }

    #[test]
    fn unknown_job_type_is_skipped_case_insensitively_checked() {
        let queue = InMemoryQueueClient::new();
        queue.push_shared(
            "worker:3",
            r#"{"pid":"p","esaf":1,"type":"bogus","filename":"x","frame":1}"#,
        );
        queue.push_shared("worker:3", "end");
        let ctx = test_ctx();
        let sink = CapturingSink::new();
        let result = run(&queue, "worker:3", &ctx, &sink);
        assert!(result.is_ok());
    }

    #[test]
    fn jpeg_job_against_missing_master_file_is_logged_and_skipped() {
        let queue = InMemoryQueueClient::new();
        queue.push_shared(
            "worker:4",
            r#"{"pid":"p","esaf":1,"type":"jpeg","filename":"/nonexistent.h5","frame":1,
                "width":8.0,"height":8.0,"xsize":8,"ysize":8,"wval":0,"contrast":65535}"#,
        );
        queue.push_shared("worker:4", "end");
        let ctx = test_ctx();
        let sink = CapturingSink::new();
        let result = run(&queue, "worker:4", &ctx, &sink);
        assert!(result.is_ok());
        assert!(sink.jpegs.lock().unwrap().is_empty());
    }

    #[test]
    fn legacy_tiff_filename_is_recognized() {
        assert!(is_legacy_tiff("frame.tif"));
        assert!(is_legacy_tiff("frame.TIFF"));
        assert!(!is_legacy_tiff("master.h5"));
    }
}
