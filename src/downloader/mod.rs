pub mod engine;
pub mod extractor;
pub mod http;
pub mod naming;
pub mod observer;
pub mod part;
pub mod probe;
pub mod record;
pub mod speed;
pub mod storage;
pub mod stream;
pub mod throttle;

#[cfg(test)]
pub(crate) mod test_support;

pub use engine::{DownloadEngine, EngineBuilder, SharedRecord, TaskHandle};
pub use extractor::{ExtractOptions, ExtractorError, MediaExtractor};
pub use observer::{BroadcastObserver, DownloadObserver, EngineEvent, ObserverId};
pub use probe::{ProbeResult, ResumeProbe};
pub use record::{
    DownloadKind, DownloadRecord, DownloadStatus, FailureReason, PartRange, VideoFormat,
    VideoInfo,
};
pub use speed::{SpeedMeter, SpeedSnapshot};
pub use stream::{StreamOutcome, StreamTaskAdapter};
