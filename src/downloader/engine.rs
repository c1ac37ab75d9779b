//! 下载引擎
//!
//! 引擎持有两张列表：进行中（active）与已完成（finished）。每个处于下载状态的记录
//! 对应一个后台会话任务（supervisor），会话内部按分片并发运行 `PartWorker`，
//! 定时汇总速度、剩余时间并推送快照、保存记录。
//!
//! 暂停、删除都通过取消令牌完成：调用方设置停止意图后取消令牌，会话在所有分片
//! 停止写盘后按意图收尾，再通过 `settled` 通知等待者。

use super::extractor::{ExtractOptions, ExtractorError, MediaExtractor};
use super::http::{build_client, RequestHeaders};
use super::naming::{file_name_from_url, resolve_collision, sanitize_file_name};
use super::observer::{DownloadObserver, NotificationHub, ObserverId};
use super::part::{PartFailure, PartOutcome, PartRequest, PartWorker};
use super::probe::{ProbeResult, ResumeProbe};
use super::record::{
    DownloadKind, DownloadRecord, DownloadStatus, FailureReason, VideoFormat, VideoInfo,
};
use super::speed::SpeedMeter;
use super::storage::{available_space, sha256_file};
use super::stream::{StreamOutcome, StreamTaskAdapter};
use crate::config::DownloadSettings;
use crate::error::{EngineError, EngineResult};
use crate::network::{AlwaysOnline, NetworkMonitor};
use crate::persistence::{MemoryRecordStore, RecordStore};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 共享的下载记录
pub type SharedRecord = Arc<Mutex<DownloadRecord>>;

/// 会话停止后的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopIntent {
    /// 暂停，记录保留
    Pause,
    /// 删除/清除，由调用方负责移除记录
    Remove,
}

struct ActiveTask {
    cancel: CancellationToken,
    intent: Arc<Mutex<StopIntent>>,
    settled: watch::Receiver<bool>,
}

/// 正在运行的下载会话句柄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    pub record_id: String,
    pub status: DownloadStatus,
    pub part_count: usize,
    /// 已请求停止，正在等待分片退出
    pub is_stopping: bool,
}

/// 会话结果
#[derive(Debug)]
enum SessionOutcome {
    Completed,
    Stopped,
    Failed(FailureReason),
}

/// 分片任务结果
#[derive(Debug)]
enum PartResult {
    Done,
    Stopped,
    Fatal(FailureReason),
}

/// 引擎构建器
pub struct EngineBuilder {
    settings: DownloadSettings,
    store: Option<Arc<dyn RecordStore>>,
    network: Option<Arc<dyn NetworkMonitor>>,
    extractor: Option<Arc<dyn MediaExtractor>>,
    snapshot_interval: Duration,
}

impl EngineBuilder {
    pub fn new(settings: DownloadSettings) -> Self {
        Self {
            settings,
            store: None,
            network: None,
            extractor: None,
            snapshot_interval: Duration::from_millis(3000),
        }
    }

    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn network(mut self, network: Arc<dyn NetworkMonitor>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn MediaExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// 下载过程中保存记录快照的间隔
    pub fn snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = interval;
        self
    }

    /// 创建引擎（需在 tokio 运行时内调用）
    ///
    /// 配置了存储时，在 `initialize` 完成前 `is_initializing` 为 true。
    pub fn build(self) -> DownloadEngine {
        let has_store = self.store.is_some();
        let inner = EngineInner {
            active: RwLock::new(Vec::new()),
            finished: RwLock::new(Vec::new()),
            tasks: Mutex::new(HashMap::new()),
            reserved_paths: Mutex::new(HashSet::new()),
            admission: tokio::sync::Mutex::new(()),
            store: self
                .store
                .unwrap_or_else(|| Arc::new(MemoryRecordStore::new())),
            network: self.network.unwrap_or_else(|| Arc::new(AlwaysOnline)),
            extractor: self.extractor,
            hub: NotificationHub::new(),
            default_settings: RwLock::new(self.settings),
            snapshot_interval: self.snapshot_interval,
            initializing: AtomicBool::new(has_store),
        };
        DownloadEngine {
            inner: Arc::new(inner),
        }
    }
}

struct EngineInner {
    active: RwLock<Vec<SharedRecord>>,
    finished: RwLock<Vec<SharedRecord>>,
    tasks: Mutex<HashMap<String, ActiveTask>>,
    /// 已分配给记录的目标路径（文件可能尚未创建）
    reserved_paths: Mutex<HashSet<PathBuf>>,
    /// 串行化新任务的重名检查与入列
    admission: tokio::sync::Mutex<()>,
    store: Arc<dyn RecordStore>,
    network: Arc<dyn NetworkMonitor>,
    extractor: Option<Arc<dyn MediaExtractor>>,
    hub: NotificationHub,
    default_settings: RwLock<DownloadSettings>,
    snapshot_interval: Duration,
    initializing: AtomicBool,
}

/// 下载引擎
#[derive(Clone)]
pub struct DownloadEngine {
    inner: Arc<EngineInner>,
}

impl DownloadEngine {
    /// 使用默认组件创建引擎（内存存储、始终在线、无提取工具）
    pub fn new(settings: DownloadSettings) -> Self {
        EngineBuilder::new(settings).build()
    }

    pub fn builder(settings: DownloadSettings) -> EngineBuilder {
        EngineBuilder::new(settings)
    }

    /// 从存储恢复记录
    ///
    /// 已完成的记录进入完成列表，已关闭的记录直接清理，
    /// 其余记录统一修正为暂停状态，等待调用方恢复。
    pub async fn initialize(&self) -> EngineResult<usize> {
        self.inner.initializing.store(true, Ordering::SeqCst);
        let loaded = self.inner.store.load_all_records().await;
        let records = match loaded {
            Ok(records) => records,
            Err(e) => {
                self.inner.initializing.store(false, Ordering::SeqCst);
                error!("加载下载记录失败: {:#}", e);
                return Err(EngineError::Persistence(e));
            }
        };

        let mut restored = 0usize;
        for mut record in records {
            if self.inner.find_any(&record.id).is_some() {
                debug!("记录已在内存中，跳过: {}", record.id);
                continue;
            }

            match record.status {
                DownloadStatus::Close => {
                    info!("清理已关闭的记录: {}", record.id);
                    if let Err(e) = self.inner.store.delete_record_file(&record.id).await {
                        warn!("删除记录文件失败: {} ({:#})", record.id, e);
                    }
                    continue;
                }
                DownloadStatus::Complete => {
                    record.normalize_after_load();
                    self.inner.finished.write().push(Arc::new(Mutex::new(record)));
                }
                previous => {
                    record.normalize_after_load();
                    if record.status != previous {
                        info!(
                            "恢复中断的任务: {} ({} -> {})",
                            record.id, previous, record.status
                        );
                        self.inner.persist(&record).await;
                    }
                    self.inner
                        .reserved_paths
                        .lock()
                        .insert(record.destination_path());
                    self.inner.active.write().push(Arc::new(Mutex::new(record)));
                }
            }
            restored += 1;
        }

        self.inner.initializing.store(false, Ordering::SeqCst);
        info!("✓ 下载记录恢复完成: {} 条", restored);
        Ok(restored)
    }

    pub fn is_initializing(&self) -> bool {
        self.inner.initializing.load(Ordering::SeqCst)
    }

    /// 创建 HTTP 下载记录（不加入引擎），文件名缺省时从地址推断
    pub fn new_record(
        &self,
        url: &str,
        file_name: Option<&str>,
        directory: impl Into<PathBuf>,
    ) -> DownloadRecord {
        let name = match file_name {
            Some(name) if !name.trim().is_empty() => sanitize_file_name(name),
            _ => file_name_from_url(url),
        };
        DownloadRecord::new(url, name, directory, self.default_settings())
    }

    /// 创建流媒体下载记录（不加入引擎）
    pub fn new_stream_record(
        &self,
        video_info: VideoInfo,
        video_format: Option<VideoFormat>,
        file_name: &str,
        directory: impl Into<PathBuf>,
    ) -> DownloadRecord {
        DownloadRecord::new_stream(
            video_info,
            video_format,
            sanitize_file_name(file_name),
            directory,
            self.default_settings(),
        )
    }

    pub fn default_settings(&self) -> DownloadSettings {
        self.inner.default_settings.read().clone()
    }

    /// 更新新任务使用的默认参数（已有任务不受影响）
    pub fn update_default_settings(&self, settings: DownloadSettings) -> EngineResult<()> {
        settings
            .validate()
            .map_err(|e| EngineError::InvalidRecord(format!("{:#}", e)))?;
        *self.inner.default_settings.write() = settings;
        Ok(())
    }

    /// 添加下载任务并立即开始
    ///
    /// 返回加入引擎时的记录快照（文件名已处理重名）。
    pub async fn add_download(&self, mut record: DownloadRecord) -> EngineResult<DownloadRecord> {
        // 1. 基本校验
        if record.file_url.trim().is_empty() {
            return Err(EngineError::InvalidRecord("下载地址为空".to_string()));
        }
        if record.status != DownloadStatus::Queued {
            return Err(EngineError::InvalidRecord(format!(
                "新任务状态必须为 queued，实际为 {}",
                record.status
            )));
        }
        record
            .settings
            .validate()
            .map_err(|e| EngineError::InvalidRecord(format!("{:#}", e)))?;
        if self.inner.find_any(&record.id).is_some() {
            return Err(EngineError::DuplicateId(record.id));
        }

        record.file_name = sanitize_file_name(&record.file_name);
        if record.file_name.is_empty() {
            record.file_name = file_name_from_url(&record.file_url);
        }

        match record.kind {
            DownloadKind::Http => {
                reqwest::Url::parse(&record.file_url).map_err(|e| {
                    EngineError::InvalidRecord(format!("无效的下载地址 {}: {}", record.file_url, e))
                })?;
                // 2. 探测断点续传能力并规划分片
                let client = build_client(&record.settings)
                    .map_err(|e| EngineError::InvalidRecord(format!("{:#}", e)))?;
                let probe = ResumeProbe::new(client, probe_timeout(&record.settings))
                    .probe(&record.file_url, &request_headers(&record))
                    .await;
                apply_probe(&mut record, &probe);
                // 调用方未指定文件名时采用服务器给出的名字
                if let Some(name) = probe.file_name.as_ref() {
                    if record.file_name == file_name_from_url(&record.file_url) {
                        debug!("使用服务器提供的文件名: {} -> {}", record.file_name, name);
                        record.file_name = name.clone();
                    }
                }
            }
            DownloadKind::Stream => {
                if self.inner.extractor.is_none() {
                    return Err(EngineError::InvalidRecord(
                        "未配置媒体提取工具，无法添加流媒体任务".to_string(),
                    ));
                }
            }
        }

        // 3. 重名处理并入列
        let shared = {
            let _guard = self.inner.admission.lock().await;
            if self.inner.find_any(&record.id).is_some() {
                return Err(EngineError::DuplicateId(record.id));
            }
            {
                let mut reserved = self.inner.reserved_paths.lock();
                let resolved = resolve_collision(&record.file_directory, &record.file_name, |p| {
                    reserved.contains(p) || p.exists()
                });
                if resolved != record.file_name {
                    info!("文件名冲突，重命名: {} -> {}", record.file_name, resolved);
                    record.file_name = resolved;
                }
                reserved.insert(record.destination_path());
            }
            let shared = Arc::new(Mutex::new(record));
            self.inner.active.write().push(shared.clone());
            shared
        };

        let snapshot = shared.lock().clone();
        info!(
            "新建下载任务: id={}, 文件={}, 大小={}, 分片数={}",
            snapshot.id,
            snapshot.file_name,
            snapshot.file_size,
            snapshot.part_count()
        );
        self.inner.persist(&snapshot).await;
        self.inner.hub.changed(&snapshot);

        // 4. 启动会话
        self.inner.start_session(&shared).await?;
        Ok(snapshot)
    }

    /// 暂停任务
    ///
    /// 只发出停止请求，不等待分片退出；对已暂停、已失败或排队中的任务无效果。
    pub fn pause_download(&self, id: &str) -> EngineResult<()> {
        let record = self
            .inner
            .find_active(id)
            .ok_or_else(|| self.inner.not_found_or_finished(id))?;
        let status = record.lock().status;

        match status {
            DownloadStatus::Downloading => {
                if let Some(task) = self.inner.tasks.lock().get(id) {
                    if !task.cancel.is_cancelled() {
                        info!("暂停下载任务: {}", id);
                        *task.intent.lock() = StopIntent::Pause;
                        task.cancel.cancel();
                    }
                }
                Ok(())
            }
            DownloadStatus::Paused | DownloadStatus::Failed | DownloadStatus::Queued => Ok(()),
            status => Err(EngineError::InvalidState {
                id: id.to_string(),
                status,
            }),
        }
    }

    /// 恢复暂停或失败的任务
    pub async fn resume_download(&self, id: &str) -> EngineResult<()> {
        let record = self
            .inner
            .find_active(id)
            .ok_or_else(|| self.inner.not_found_or_finished(id))?;

        // 上一次会话仍在停止中时先等它结束
        let pending = self
            .inner
            .tasks
            .lock()
            .get(id)
            .map(|task| (task.cancel.is_cancelled(), task.settled.clone()));
        match pending {
            Some((false, _)) => {
                debug!("任务已在下载中: {}", id);
                return Ok(());
            }
            Some((true, settled)) => wait_settled(settled).await,
            None => {}
        }

        {
            let mut r = record.lock();
            match r.status {
                DownloadStatus::Paused | DownloadStatus::Failed => {}
                DownloadStatus::Downloading => return Ok(()),
                status => {
                    return Err(EngineError::InvalidState {
                        id: id.to_string(),
                        status,
                    })
                }
            }

            let reresolve_source = if r.is_file_url_expired && self.inner.extractor.is_some() {
                r.video_info.as_ref().map(|v| v.source_url.clone())
            } else {
                None
            };
            if let Some(source) = reresolve_source {
                info!("视频直链已失效，重新解析: {}", id);
                r.kind = DownloadKind::Stream;
                r.file_url = source;
                r.plan_parts(None, 1);
            } else if !r.is_resume_supported || r.kind == DownloadKind::Stream {
                info!("任务不支持断点续传，从头开始: {}", id);
                r.reset_progress();
            }
        }

        info!("恢复下载任务: {}", id);
        self.inner.start_session(&record).await
    }

    /// 暂停所有下载中的任务，返回发出暂停请求的数量
    pub fn pause_all_downloads(&self) -> usize {
        let ids: Vec<String> = self
            .inner
            .active
            .read()
            .iter()
            .filter_map(|r| {
                let r = r.lock();
                (r.status == DownloadStatus::Downloading).then(|| r.id.clone())
            })
            .collect();

        let mut count = 0;
        for id in &ids {
            if self.pause_download(id).is_ok() {
                count += 1;
            }
        }
        info!("暂停全部任务: {} 个", count);
        count
    }

    /// 删除任务及已下载的文件
    pub async fn delete_download(&self, id: &str) -> EngineResult<()> {
        self.inner.remove_record(id, true).await
    }

    /// 移除任务记录，保留已下载的文件
    pub async fn clear_download(&self, id: &str) -> EngineResult<()> {
        self.inner.remove_record(id, false).await
    }

    /// 查询正在运行的会话
    pub fn search_active_download_task_with(&self, id: &str) -> Option<TaskHandle> {
        let is_stopping = self.inner.tasks.lock().get(id)?.cancel.is_cancelled();
        let record = self.inner.find_active(id)?;
        let r = record.lock();
        Some(TaskHandle {
            record_id: r.id.clone(),
            status: r.status,
            part_count: r.part_count(),
            is_stopping,
        })
    }

    /// 进行中的记录快照
    pub fn active_download_data_models(&self) -> Vec<DownloadRecord> {
        self.inner
            .active
            .read()
            .iter()
            .map(|r| r.lock().clone())
            .collect()
    }

    /// 已完成的记录快照
    pub fn finished_download_data_models(&self) -> Vec<DownloadRecord> {
        self.inner
            .finished
            .read()
            .iter()
            .map(|r| r.lock().clone())
            .collect()
    }

    /// 按ID查询记录（进行中或已完成）
    pub fn get_record(&self, id: &str) -> Option<DownloadRecord> {
        self.inner.find_any(id).map(|r| r.lock().clone())
    }

    pub fn register_observer(&self, observer: Arc<dyn DownloadObserver>) -> ObserverId {
        self.inner.hub.register(observer)
    }

    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        self.inner.hub.unregister(id)
    }

    /// 等待任务当前的会话结束（没有会话时立即返回）
    pub async fn wait_until_idle(&self, id: &str) {
        let settled = self.inner.tasks.lock().get(id).map(|t| t.settled.clone());
        if let Some(settled) = settled {
            wait_settled(settled).await;
        }
    }

    /// 暂停全部任务并等待会话结束
    pub async fn shutdown(&self) {
        info!("正在停止下载引擎...");
        self.pause_all_downloads();
        let pending: Vec<watch::Receiver<bool>> = self
            .inner
            .tasks
            .lock()
            .values()
            .map(|t| t.settled.clone())
            .collect();
        for settled in pending {
            wait_settled(settled).await;
        }
        info!("✓ 下载引擎已停止");
    }
}

impl EngineInner {
    fn find_in(list: &RwLock<Vec<SharedRecord>>, id: &str) -> Option<SharedRecord> {
        list.read().iter().find(|r| r.lock().id == id).cloned()
    }

    fn find_active(&self, id: &str) -> Option<SharedRecord> {
        Self::find_in(&self.active, id)
    }

    fn find_finished(&self, id: &str) -> Option<SharedRecord> {
        Self::find_in(&self.finished, id)
    }

    fn find_any(&self, id: &str) -> Option<SharedRecord> {
        self.find_active(id).or_else(|| self.find_finished(id))
    }

    fn not_found_or_finished(&self, id: &str) -> EngineError {
        if self.find_finished(id).is_some() {
            EngineError::InvalidState {
                id: id.to_string(),
                status: DownloadStatus::Complete,
            }
        } else {
            EngineError::NotFound(id.to_string())
        }
    }

    async fn persist(&self, record: &DownloadRecord) {
        if let Err(e) = self.store.save_record(record).await {
            warn!("保存下载记录失败: {} ({:#})", record.id, e);
        }
    }

    /// 切换到下载状态并启动会话
    async fn start_session(self: &Arc<Self>, record: &SharedRecord) -> EngineResult<()> {
        let (settled_tx, settled_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let intent = Arc::new(Mutex::new(StopIntent::Pause));

        let snapshot = {
            let mut tasks = self.tasks.lock();
            let mut r = record.lock();
            if tasks.contains_key(&r.id) {
                return Err(EngineError::InvalidState {
                    id: r.id.clone(),
                    status: r.status,
                });
            }
            r.transition(DownloadStatus::Downloading)
                .map_err(|e| EngineError::InvalidState {
                    id: r.id.clone(),
                    status: e.from,
                })?;
            tasks.insert(
                r.id.clone(),
                ActiveTask {
                    cancel: cancel.clone(),
                    intent: intent.clone(),
                    settled: settled_rx,
                },
            );
            r.clone()
        };

        self.persist(&snapshot).await;
        self.hub.changed(&snapshot);

        let inner = self.clone();
        let record = record.clone();
        tokio::spawn(async move {
            inner.supervise(record, cancel, intent, settled_tx).await;
        });
        Ok(())
    }

    async fn supervise(
        self: Arc<Self>,
        record: SharedRecord,
        cancel: CancellationToken,
        intent: Arc<Mutex<StopIntent>>,
        settled: watch::Sender<bool>,
    ) {
        let (id, kind) = {
            let r = record.lock();
            (r.id.clone(), r.kind)
        };
        debug!("下载会话开始: {} ({:?})", id, kind);

        let outcome = match kind {
            DownloadKind::Http => self.run_http_session(&record, &cancel).await,
            DownloadKind::Stream => self.run_stream_session(&record, &cancel).await,
        };
        let intent = *intent.lock();
        self.finish_session(&record, outcome, intent).await;

        self.tasks.lock().remove(&id);
        let _ = settled.send(true);
        debug!("下载会话结束: {}", id);
    }

    async fn run_http_session(
        self: &Arc<Self>,
        record: &SharedRecord,
        cancel: &CancellationToken,
    ) -> SessionOutcome {
        let (id, settings, url, headers, directory, destination) = {
            let r = record.lock();
            (
                r.id.clone(),
                r.settings.clone(),
                r.file_url.clone(),
                request_headers(&r),
                r.file_directory.clone(),
                r.destination_path(),
            )
        };

        // 1. 创建客户端
        let client = match build_client(&settings) {
            Ok(client) => client,
            Err(e) => {
                return SessionOutcome::Failed(FailureReason::ClientSetup {
                    message: format!("{:#}", e),
                })
            }
        };

        // 2. 续传前确认服务器上的文件没有变化
        let needs_revalidation = {
            let r = record.lock();
            r.downloaded_byte > 0 && r.is_resume_supported
        };
        if needs_revalidation {
            let probe = ResumeProbe::new(client.clone(), probe_timeout(&settings))
                .probe(&url, &headers)
                .await;
            let mut r = record.lock();
            let size_changed = !r.is_unknown_file_size
                && probe.content_length.is_some_and(|len| len != r.file_size);
            if probe.status.is_some()
                && (size_changed
                    || probe.validator_changed(r.etag.as_deref(), r.last_modified.as_deref()))
            {
                warn!("服务器文件已变化，从头下载: {}", id);
                apply_probe(&mut r, &probe);
            }
        }

        // 3. 准备目标文件
        if let Err(e) = tokio::fs::create_dir_all(&directory).await {
            return SessionOutcome::Failed(FailureReason::FileAccess {
                message: format!("创建目录失败 {:?}: {}", directory, e),
            });
        }
        if record.lock().downloaded_byte > 0 && !destination.exists() {
            warn!("已下载的文件丢失，从头下载: {:?}", destination);
            record.lock().reset_progress();
        }

        let (fresh, file_size, unknown_size, remaining) = {
            let r = record.lock();
            (
                r.downloaded_byte == 0,
                r.file_size,
                r.is_unknown_file_size,
                r.file_size.saturating_sub(r.downloaded_byte),
            )
        };

        if !unknown_size {
            let required = remaining + settings.min_free_space_margin;
            if let Some(available) = available_space(&directory) {
                if available < required {
                    return SessionOutcome::Failed(FailureReason::InsufficientStorage {
                        required,
                        available,
                    });
                }
            }
        }

        if let Err(e) = prepare_file(&destination, fresh, (!unknown_size).then_some(file_size)).await
        {
            return SessionOutcome::Failed(FailureReason::FileAccess {
                message: format!("{:?}: {}", destination, e),
            });
        }

        // 4. 并发下载各分片
        let meter = Arc::new(Mutex::new(SpeedMeter::new(settings.max_speed)));
        meter.lock().sample_now(0);
        let part_cancel = cancel.child_token();
        let part_count = record.lock().part_count();
        let ctx = Arc::new(PartContext {
            engine: self.clone(),
            record: record.clone(),
            meter: meter.clone(),
            worker: PartWorker::new(client),
            url,
            headers,
            destination: destination.clone(),
            settings: settings.clone(),
            part_count,
            cancel: part_cancel.clone(),
        });

        let mut parts = JoinSet::new();
        for index in 0..part_count {
            if !record.lock().is_part_done(index) {
                parts.spawn(run_part(ctx.clone(), index));
            }
        }
        info!(
            "开始下载: id={}, 分片数={}, 待下载分片={}",
            id,
            part_count,
            parts.len()
        );

        let mut ticker =
            tokio::time::interval(Duration::from_millis(settings.progress_interval_ms.max(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_snapshot = Instant::now();
        let mut fatal: Option<FailureReason> = None;

        loop {
            tokio::select! {
                joined = parts.join_next() => match joined {
                    None => break,
                    Some(Ok(PartResult::Done)) | Some(Ok(PartResult::Stopped)) => {}
                    Some(Ok(PartResult::Fatal(reason))) => {
                        if fatal.is_none() {
                            error!("分片下载失败，停止其余分片: {} ({})", id, reason.describe());
                            fatal = Some(reason);
                            part_cancel.cancel();
                        }
                    }
                    Some(Err(e)) => {
                        error!("分片任务异常退出: {} ({})", id, e);
                        if fatal.is_none() {
                            fatal = Some(FailureReason::Interrupted);
                            part_cancel.cancel();
                        }
                    }
                },
                _ = ticker.tick() => {
                    let snapshot = refresh_speed(record, &meter);
                    self.hub.changed(&snapshot);
                    if last_snapshot.elapsed() >= self.snapshot_interval {
                        last_snapshot = Instant::now();
                        self.persist(&snapshot).await;
                    }
                }
            }
        }
        refresh_speed(record, &meter);

        // 5. 汇总结果
        if let Some(reason) = fatal {
            return SessionOutcome::Failed(reason);
        }
        if !record.lock().all_parts_done() {
            if cancel.is_cancelled() {
                return SessionOutcome::Stopped;
            }
            return SessionOutcome::Failed(FailureReason::Interrupted);
        }

        match verify_download(record, &destination).await {
            Ok(()) => SessionOutcome::Completed,
            Err(reason) => SessionOutcome::Failed(reason),
        }
    }

    async fn run_stream_session(
        self: &Arc<Self>,
        record: &SharedRecord,
        cancel: &CancellationToken,
    ) -> SessionOutcome {
        let Some(extractor) = self.extractor.clone() else {
            return SessionOutcome::Failed(FailureReason::Extractor {
                message: "未配置媒体提取工具".to_string(),
                login_required: false,
            });
        };

        let (id, source, options, settings, directory) = {
            let r = record.lock();
            let source = r
                .video_info
                .as_ref()
                .map(|v| v.source_url.clone())
                .unwrap_or_else(|| r.file_url.clone());
            (
                r.id.clone(),
                source,
                extract_options(&r),
                r.settings.clone(),
                r.file_directory.clone(),
            )
        };

        if let Err(e) = tokio::fs::create_dir_all(&directory).await {
            return SessionOutcome::Failed(FailureReason::FileAccess {
                message: format!("创建目录失败 {:?}: {}", directory, e),
            });
        }

        // 1. 优先解析直链，走普通分片下载
        let resolved = tokio::select! {
            _ = cancel.cancelled() => return SessionOutcome::Stopped,
            resolved = extractor.resolve_direct_url(&source, &options) => resolved,
        };
        match resolved {
            Ok(direct_url) => {
                info!("已解析视频直链: {}", id);
                let client = match build_client(&settings) {
                    Ok(client) => client,
                    Err(e) => {
                        return SessionOutcome::Failed(FailureReason::ClientSetup {
                            message: format!("{:#}", e),
                        })
                    }
                };
                let headers = request_headers(&record.lock());
                let probe = ResumeProbe::new(client, probe_timeout(&settings))
                    .probe(&direct_url, &headers)
                    .await;
                {
                    let mut r = record.lock();
                    r.file_url = direct_url;
                    r.kind = DownloadKind::Http;
                    apply_probe(&mut r, &probe);
                }
                let snapshot = record.lock().clone();
                self.persist(&snapshot).await;
                return self.run_http_session(record, cancel).await;
            }
            Err(ExtractorError::Unsupported) => {
                debug!("无法解析直链，由提取工具下载: {}", id);
            }
            Err(ExtractorError::Cancelled) => return SessionOutcome::Stopped,
            Err(ExtractorError::LoginRequired(message)) => {
                return SessionOutcome::Failed(FailureReason::Extractor {
                    message,
                    login_required: true,
                })
            }
            Err(ExtractorError::Failed(message)) => {
                let login_required = super::stream::looks_like_login_required(&message);
                return SessionOutcome::Failed(FailureReason::Extractor {
                    message,
                    login_required,
                });
            }
        }

        // 2. 由提取工具自行下载
        record.lock().reset_progress();
        let adapter = StreamTaskAdapter::new(
            extractor,
            Duration::from_millis(settings.progress_interval_ms),
        );
        let hub = &self.hub;
        let outcome = adapter
            .run(record, &options, cancel, |snapshot| hub.changed(snapshot))
            .await;

        match outcome {
            StreamOutcome::Completed => {
                let destination = record.lock().destination_path();
                match verify_download(record, &destination).await {
                    Ok(()) => SessionOutcome::Completed,
                    Err(reason) => SessionOutcome::Failed(reason),
                }
            }
            StreamOutcome::Cancelled => SessionOutcome::Stopped,
            StreamOutcome::Failed(reason) => SessionOutcome::Failed(reason),
        }
    }

    async fn finish_session(
        self: &Arc<Self>,
        record: &SharedRecord,
        outcome: SessionOutcome,
        intent: StopIntent,
    ) {
        match outcome {
            SessionOutcome::Completed => {
                let snapshot = {
                    let mut r = record.lock();
                    if let Err(e) = r.transition(DownloadStatus::Complete) {
                        warn!("任务状态异常，无法标记完成: {} ({})", r.id, e);
                        return;
                    }
                    r.clone()
                };
                self.persist(&snapshot).await;

                self.active.write().retain(|r| !Arc::ptr_eq(r, record));
                self.finished.write().push(record.clone());
                self.reserved_paths
                    .lock()
                    .remove(&snapshot.destination_path());

                self.hub.changed(&snapshot);
                self.hub.moved_to_finished(&snapshot);
                info!(
                    "✓ 下载完成: id={}, 文件={}, 大小={}, 耗时={}ms",
                    snapshot.id, snapshot.file_name, snapshot.file_size, snapshot.time_spent
                );
            }
            SessionOutcome::Stopped => match intent {
                StopIntent::Pause => {
                    let snapshot = {
                        let mut r = record.lock();
                        if let Err(e) = r.transition(DownloadStatus::Paused) {
                            warn!("任务状态异常，无法暂停: {} ({})", r.id, e);
                            return;
                        }
                        r.clone()
                    };
                    self.persist(&snapshot).await;
                    self.hub.changed(&snapshot);
                    info!(
                        "任务已暂停: id={}, 已下载={}/{}",
                        snapshot.id, snapshot.downloaded_byte, snapshot.file_size
                    );
                }
                StopIntent::Remove => {
                    record.lock().checkpoint_time_spent();
                }
            },
            SessionOutcome::Failed(reason) => {
                if intent == StopIntent::Remove {
                    return;
                }
                let snapshot = {
                    let mut r = record.lock();
                    if let Err(e) = r.mark_failed(reason) {
                        warn!("任务状态异常，无法标记失败: {} ({})", r.id, e);
                        return;
                    }
                    r.clone()
                };
                self.persist(&snapshot).await;
                self.hub.changed(&snapshot);
                error!("下载失败: id={}, 原因={}", snapshot.id, snapshot.status_info);
            }
        }
    }

    async fn remove_record(self: &Arc<Self>, id: &str, delete_file: bool) -> EngineResult<()> {
        // 1. 停止会话并等待分片退出
        let pending = self.tasks.lock().get(id).map(|task| {
            *task.intent.lock() = StopIntent::Remove;
            task.cancel.cancel();
            task.settled.clone()
        });
        if let Some(settled) = pending {
            wait_settled(settled).await;
        }

        // 2. 关闭并移出列表
        let (record, was_active) = match self.find_active(id) {
            Some(record) => (record, true),
            None => match self.find_finished(id) {
                Some(record) => (record, false),
                None => return Err(EngineError::NotFound(id.to_string())),
            },
        };

        let snapshot = {
            let mut r = record.lock();
            if was_active {
                if let Err(e) = r.transition(DownloadStatus::Close) {
                    warn!("关闭任务失败: {} ({})", id, e);
                }
            }
            r.clone()
        };
        if was_active {
            self.hub.changed(&snapshot);
            self.active.write().retain(|r| !Arc::ptr_eq(r, &record));
            self.reserved_paths
                .lock()
                .remove(&snapshot.destination_path());
        } else {
            self.finished.write().retain(|r| !Arc::ptr_eq(r, &record));
        }

        // 3. 清理持久化记录与文件
        if let Err(e) = self.store.delete_record_file(id).await {
            warn!("删除记录文件失败: {} ({:#})", id, e);
        }
        if delete_file {
            let path = snapshot.destination_path();
            match tokio::fs::remove_file(&path).await {
                Ok(()) => info!("已删除下载文件: {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    self.hub.removed(id);
                    return Err(EngineError::Io(e));
                }
            }
        }

        self.hub.removed(id);
        info!("任务已移除: id={}, 删除文件={}", id, delete_file);
        Ok(())
    }
}

/// 分片任务共享的上下文
struct PartContext {
    engine: Arc<EngineInner>,
    record: SharedRecord,
    meter: Arc<Mutex<SpeedMeter>>,
    worker: PartWorker,
    url: String,
    headers: RequestHeaders,
    destination: PathBuf,
    settings: DownloadSettings,
    part_count: usize,
    cancel: CancellationToken,
}

/// 单个分片的重试循环
async fn run_part(ctx: Arc<PartContext>, index: usize) -> PartResult {
    let mut attempts = 0u32;

    loop {
        if ctx.cancel.is_cancelled() {
            return PartResult::Stopped;
        }
        let (start, end) = {
            let r = ctx.record.lock();
            if r.is_part_done(index) {
                return PartResult::Done;
            }
            (r.part_resume_offset(index), r.part_ranges[index].end)
        };

        let request = PartRequest {
            index,
            url: &ctx.url,
            start,
            end,
            headers: &ctx.headers,
            buffer_size: ctx.settings.buffer_size,
            read_timeout: Duration::from_secs(ctx.settings.read_timeout_secs),
        };
        let record = ctx.record.clone();
        let meter = ctx.meter.clone();
        let outcome = ctx
            .worker
            .run(request, &ctx.destination, &ctx.cancel, move |bytes| {
                record.lock().add_part_bytes(index, bytes);
                meter.lock().sample_now(bytes)
            })
            .await;

        let failure = match outcome {
            PartOutcome::Completed { .. } => {
                let mut r = ctx.record.lock();
                if r.part_ranges[index].end.is_none() {
                    if r.downloaded_byte == 0 {
                        return PartResult::Fatal(FailureReason::EmptyBody);
                    }
                    r.settle_unknown_size();
                }
                return PartResult::Done;
            }
            PartOutcome::Cancelled => return PartResult::Stopped,
            PartOutcome::Failed(failure) => failure,
        };

        match failure {
            // 单分片任务降级为不续传，从头重新请求
            PartFailure::RangeNotHonored if ctx.part_count == 1 => {
                attempts += 1;
                if attempts > ctx.settings.max_retries {
                    return PartResult::Fatal(FailureReason::RangeNotHonored);
                }
                warn!("服务器忽略 Range 请求，改为从头下载: 分片 #{}", index);
                let mut r = ctx.record.lock();
                r.is_resume_supported = false;
                r.is_multi_thread_supported = false;
                r.reset_part(index);
            }
            failure if !failure.is_retryable() => {
                return PartResult::Fatal(fatal_reason(failure));
            }
            failure => {
                let message = failure.message();
                if !ctx.engine.network.is_online() {
                    if !wait_for_network(&ctx).await {
                        return PartResult::Stopped;
                    }
                    continue;
                }

                attempts += 1;
                if attempts > ctx.settings.max_retries {
                    return PartResult::Fatal(FailureReason::RetriesExhausted {
                        part: index,
                        message,
                    });
                }
                {
                    let mut r = ctx.record.lock();
                    r.total_connection_retries += 1;
                    if !r.is_resume_supported {
                        r.reset_part(index);
                    }
                }

                let delay = Duration::from_millis(ctx.settings.retry_delay_ms * attempts as u64);
                warn!(
                    "分片 #{} 下载失败，{}ms 后第 {} 次重试: {}",
                    index,
                    delay.as_millis(),
                    attempts,
                    message
                );
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return PartResult::Stopped,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// 等待网络恢复，被取消时返回 false
async fn wait_for_network(ctx: &PartContext) -> bool {
    let snapshot = {
        let mut r = ctx.record.lock();
        if r.is_waiting_for_network {
            None
        } else {
            r.is_waiting_for_network = true;
            Some(r.clone())
        }
    };
    if let Some(snapshot) = snapshot {
        info!("网络不可用，等待恢复: {}", snapshot.id);
        ctx.engine.hub.changed(&snapshot);
    }

    let poll = Duration::from_millis(ctx.settings.network_poll_interval_ms.max(10));
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return false,
            _ = tokio::time::sleep(poll) => {}
        }
        if ctx.engine.network.is_online() {
            break;
        }
    }

    let snapshot = {
        let mut r = ctx.record.lock();
        let changed = r.is_waiting_for_network;
        r.is_waiting_for_network = false;
        changed.then(|| r.clone())
    };
    if let Some(snapshot) = snapshot {
        info!("网络已恢复: {}", snapshot.id);
        ctx.engine.hub.changed(&snapshot);
    }
    true
}

fn fatal_reason(failure: PartFailure) -> FailureReason {
    match failure {
        PartFailure::Permanent { status } if matches!(status, 401 | 403 | 404 | 410) => {
            FailureReason::UrlExpired { status }
        }
        PartFailure::Permanent { status } => FailureReason::HttpStatus { status },
        PartFailure::RangeNotHonored => FailureReason::RangeNotHonored,
        PartFailure::Storage(message) => FailureReason::FileAccess { message },
        PartFailure::Transient(message) => FailureReason::RetriesExhausted { part: 0, message },
    }
}

/// 汇总速度与剩余时间，返回记录快照
fn refresh_speed(record: &SharedRecord, meter: &Mutex<SpeedMeter>) -> DownloadRecord {
    let mut r = record.lock();
    let mut m = meter.lock();
    m.sample_now(0);
    let speed = m.snapshot();
    r.realtime_speed = speed.realtime;
    r.average_speed = speed.average;
    r.max_speed = speed.max;
    r.remaining_time = if r.is_unknown_file_size {
        None
    } else {
        m.eta_for(r.file_size.saturating_sub(r.downloaded_byte))
    };
    r.checkpoint_time_spent();
    r.clone()
}

/// 打开目标文件，新下载时截断，已知大小时预分配
async fn prepare_file(path: &Path, truncate: bool, size: Option<u64>) -> std::io::Result<()> {
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(truncate)
        .open(path)
        .await?;
    if let Some(size) = size {
        file.set_len(size).await?;
    }
    Ok(())
}

/// 完成前校验文件大小与校验和
async fn verify_download(record: &SharedRecord, destination: &Path) -> Result<(), FailureReason> {
    let (file_size, expected, verify) = {
        let r = record.lock();
        (
            r.file_size,
            r.expected_checksum.clone(),
            r.settings.verify_checksum,
        )
    };

    let actual_size = tokio::fs::metadata(destination)
        .await
        .map_err(|e| FailureReason::FileAccess {
            message: format!("{:?}: {}", destination, e),
        })?
        .len();
    if actual_size != file_size {
        return Err(FailureReason::FileAccess {
            message: format!("文件大小不一致: 期望 {}, 实际 {}", file_size, actual_size),
        });
    }

    if verify || expected.is_some() {
        let path = destination.to_path_buf();
        let digest = tokio::task::spawn_blocking(move || sha256_file(&path))
            .await
            .map_err(|e| FailureReason::FileAccess {
                message: format!("校验任务异常: {}", e),
            })?
            .map_err(|e| FailureReason::FileAccess {
                message: format!("{:#}", e),
            })?;

        if let Some(expected) = expected {
            if !expected.eq_ignore_ascii_case(&digest) {
                return Err(FailureReason::ChecksumMismatch {
                    expected,
                    actual: digest,
                });
            }
            debug!("校验通过: {}", digest);
        }
        record.lock().checksum = Some(digest);
    }
    Ok(())
}

async fn wait_settled(mut settled: watch::Receiver<bool>) {
    let _ = settled.wait_for(|done| *done).await;
}

fn probe_timeout(settings: &DownloadSettings) -> Duration {
    Duration::from_secs(settings.connect_timeout_secs + settings.read_timeout_secs)
}

fn request_headers(record: &DownloadRecord) -> RequestHeaders {
    RequestHeaders {
        cookie: record.site_cookie_string.clone(),
        referrer: record.site_referrer.clone(),
        user_agent: Some(record.settings.user_agent.clone()),
    }
}

fn extract_options(record: &DownloadRecord) -> ExtractOptions {
    ExtractOptions {
        format_id: record.video_format.as_ref().map(|f| f.format_id.clone()),
        cookies: record.site_cookie_string.clone(),
        user_agent: Some(record.settings.user_agent.clone()),
        referrer: record.site_referrer.clone(),
        proxy: record.settings.proxy.clone(),
    }
}

/// 把探测结果写入记录并重新规划分片
fn apply_probe(record: &mut DownloadRecord, probe: &ProbeResult) {
    record.is_resume_supported = probe.supports_range;
    record.is_multi_thread_supported = probe.multi_thread_supported();
    record.etag = probe.etag.clone();
    record.last_modified = probe.last_modified.clone();

    let parts = record
        .settings
        .part_count_for(probe.content_length, record.is_multi_thread_supported);
    record.plan_parts(probe.content_length, parts);
    debug!(
        "探测结果: 续传={}, 大小={:?}, 分片数={}",
        probe.supports_range,
        probe.content_length,
        record.part_count()
    );
}
