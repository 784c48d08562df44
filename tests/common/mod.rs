//! テスト共通ユーティリティ
//!
//! 記録型のモックホスト（イベントループ用キュー・ディスパッチャ、
//! デコーダ/エンコーダ・コールバック）と、返すステータスを
//! スクリプトで指定できるモックプラグインを提供します。

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use veil_dso::dso::{
    DestroyReason, DsoRegistry, HttpPlugin, HttpRequest, PluginCapabilities, PluginStatus,
};
use veil_dso::http::{
    capi, Buffer, DecoderFilterCallbacks, Dispatcher, EncoderFilterCallbacks, Filter, FilterConfig,
    FilterConfigPerRoute, FilterFactory, HeaderMap, LocalReply, SharedHeaderMap, Task,
};

pub const PLUGIN_ID: &str = "mock";

// ====================
// イベントループ
// ====================

/// 投稿されたタスクを溜めておき、テストから明示的に実行するディスパッチャ
///
/// 生成したスレッドをイベントループのスレッドとみなします。
pub struct QueueDispatcher {
    loop_thread: ThreadId,
    queue: Mutex<VecDeque<Task>>,
}

impl QueueDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            loop_thread: thread::current().id(),
            queue: Mutex::new(VecDeque::new()),
        })
    }

    pub fn loop_thread(&self) -> ThreadId {
        self.loop_thread
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// キューが空になるまでタスクを実行し、実行数を返す
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let task = self.queue.lock().unwrap().pop_front();
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

impl Dispatcher for QueueDispatcher {
    fn post(&self, task: Task) {
        self.queue.lock().unwrap().push_back(task);
    }

    fn is_thread_safe(&self) -> bool {
        thread::current().id() == self.loop_thread
    }
}

// ====================
// モックホスト
// ====================

/// ホストが受けたコールバックの記録
#[derive(Debug, Default)]
pub struct HostLog {
    pub continue_decoding: usize,
    pub continue_encoding: usize,
    pub injected_decoded: Vec<(Vec<u8>, bool)>,
    pub injected_encoded: Vec<(Vec<u8>, bool)>,
    pub added_decoded: Vec<u8>,
    pub added_encoded: Vec<u8>,
    pub decoder_replies: Vec<LocalReply>,
    pub encoder_replies: Vec<LocalReply>,
    pub decoder_above_high: usize,
    pub decoder_below_low: usize,
    pub route_cache_cleared: usize,
    pub metadata: HashMap<(String, String), String>,
    /// 各コールバックが呼ばれたスレッド
    pub threads: Vec<ThreadId>,
}

pub struct MockHost {
    pub dispatcher: Arc<QueueDispatcher>,
    pub log: Mutex<HostLog>,
    pub routes: Mutex<Vec<Arc<FilterConfigPerRoute>>>,
    pub buffer_limit: u32,
    pub route_name: Option<String>,
}

impl MockHost {
    pub fn new(buffer_limit: u32) -> Arc<Self> {
        Arc::new(Self {
            dispatcher: QueueDispatcher::new(),
            log: Mutex::new(HostLog::default()),
            routes: Mutex::new(Vec::new()),
            buffer_limit,
            route_name: Some("default-route".to_string()),
        })
    }

    pub fn log(&self) -> std::sync::MutexGuard<'_, HostLog> {
        self.log.lock().unwrap()
    }

    fn record(&self) -> std::sync::MutexGuard<'_, HostLog> {
        let mut log = self.log.lock().unwrap();
        log.threads.push(thread::current().id());
        log
    }

    /// 全コールバックがイベントループ上で呼ばれたか
    pub fn all_on_loop(&self) -> bool {
        let loop_thread = self.dispatcher.loop_thread();
        self.log().threads.iter().all(|t| *t == loop_thread)
    }
}

impl DecoderFilterCallbacks for MockHost {
    fn dispatcher(&self) -> Arc<dyn Dispatcher> {
        self.dispatcher.clone()
    }

    fn continue_decoding(&self) {
        self.record().continue_decoding += 1;
    }

    fn inject_decoded_data(&self, data: &mut Buffer, end_stream: bool) {
        let bytes = data.take().as_slice().to_vec();
        self.record().injected_decoded.push((bytes, end_stream));
    }

    fn add_decoded_data(&self, data: &mut Buffer) {
        let bytes = data.take();
        self.record().added_decoded.extend_from_slice(bytes.as_slice());
    }

    fn send_local_reply(&self, reply: LocalReply) {
        self.record().decoder_replies.push(reply);
    }

    fn decoder_buffer_limit(&self) -> u32 {
        self.buffer_limit
    }

    fn on_decoder_above_write_buffer_high_watermark(&self) {
        self.record().decoder_above_high += 1;
    }

    fn on_decoder_below_write_buffer_low_watermark(&self) {
        self.record().decoder_below_low += 1;
    }

    fn clear_route_cache(&self) {
        self.record().route_cache_cleared += 1;
    }

    fn route_configs(&self) -> Vec<Arc<FilterConfigPerRoute>> {
        self.routes.lock().unwrap().clone()
    }

    fn route_name(&self) -> Option<String> {
        self.route_name.clone()
    }

    fn protocol(&self) -> Option<String> {
        Some("HTTP/1.1".to_string())
    }

    fn dynamic_metadata(&self, namespace: &str, key: &str) -> Option<String> {
        self.log()
            .metadata
            .get(&(namespace.to_string(), key.to_string()))
            .cloned()
    }

    fn set_dynamic_metadata(&self, namespace: &str, key: &str, value: &str) {
        self.record()
            .metadata
            .insert((namespace.to_string(), key.to_string()), value.to_string());
    }
}

impl EncoderFilterCallbacks for MockHost {
    fn continue_encoding(&self) {
        self.record().continue_encoding += 1;
    }

    fn inject_encoded_data(&self, data: &mut Buffer, end_stream: bool) {
        let bytes = data.take().as_slice().to_vec();
        self.record().injected_encoded.push((bytes, end_stream));
    }

    fn add_encoded_data(&self, data: &mut Buffer) {
        let bytes = data.take();
        self.record().added_encoded.extend_from_slice(bytes.as_slice());
    }

    fn send_local_reply(&self, reply: LocalReply) {
        self.record().encoder_replies.push(reply);
    }

    fn encoder_buffer_limit(&self) -> u32 {
        self.buffer_limit
    }
}

// ====================
// モックプラグイン
// ====================

/// プラグインが受けた呼び出し
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginEvent {
    Header {
        phase: u64,
        end_stream: bool,
        header_count: u64,
    },
    Data {
        phase: u64,
        end_stream: bool,
        body: Vec<u8>,
    },
    Destroy(DestroyReason),
    YieldReady,
}

type Hook = Box<dyn Fn(&HttpRequest, &PluginEvent) + Send + Sync>;

/// ステータスをキューから順に返すプラグイン（空なら Continue）
pub struct ScriptedPlugin {
    statuses: Mutex<VecDeque<u64>>,
    events: Mutex<Vec<PluginEvent>>,
    last_request: Mutex<Option<HttpRequest>>,
    hook: Option<Hook>,
    capabilities: PluginCapabilities,
    next_config: AtomicU64,
}

impl ScriptedPlugin {
    pub fn new(statuses: &[PluginStatus]) -> Self {
        Self::with_raw(&statuses.iter().map(|s| s.as_raw()).collect::<Vec<_>>())
    }

    pub fn with_raw(statuses: &[u64]) -> Self {
        Self {
            statuses: Mutex::new(statuses.iter().copied().collect()),
            events: Mutex::new(Vec::new()),
            last_request: Mutex::new(None),
            hook: None,
            capabilities: PluginCapabilities::all(),
            next_config: AtomicU64::new(0),
        }
    }

    /// 各呼び出しの中で（ステータスを返す前に）実行する処理
    pub fn with_hook(mut self, hook: impl Fn(&HttpRequest, &PluginEvent) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn with_capabilities(mut self, capabilities: PluginCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn push_status(&self, status: PluginStatus) {
        self.statuses.lock().unwrap().push_back(status.as_raw());
    }

    pub fn events(&self) -> Vec<PluginEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn header_calls(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, PluginEvent::Header { .. }))
            .count()
    }

    pub fn data_calls(&self) -> Vec<Vec<u8>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                PluginEvent::Data { body, .. } => Some(body),
                _ => None,
            })
            .collect()
    }

    pub fn destroy_calls(&self) -> Vec<DestroyReason> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                PluginEvent::Destroy(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn last_request(&self) -> HttpRequest {
        self.last_request.lock().unwrap().expect("plugin was never called")
    }

    fn respond(&self, req: &HttpRequest, event: PluginEvent) -> u64 {
        *self.last_request.lock().unwrap() = Some(*req);
        self.events.lock().unwrap().push(event.clone());
        if let Some(hook) = &self.hook {
            hook(req, &event);
        }
        self.statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(PluginStatus::Continue.as_raw())
    }
}

impl HttpPlugin for ScriptedPlugin {
    fn name(&self) -> &str {
        PLUGIN_ID
    }

    fn capabilities(&self) -> PluginCapabilities {
        self.capabilities
    }

    fn new_config(&self, _config: &[u8]) -> u64 {
        self.next_config.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn merge_config(&self, _parent_id: u64, child_id: u64) -> u64 {
        child_id
    }

    fn on_header(&self, req: &HttpRequest, end_stream: bool, header_count: u64, _header_bytes: u64) -> u64 {
        self.respond(
            req,
            PluginEvent::Header {
                phase: req.phase,
                end_stream,
                header_count,
            },
        )
    }

    fn on_data(&self, req: &HttpRequest, end_stream: bool, buffer_id: u64, length: u64) -> u64 {
        // 本体はアクセサ経由で読む（実プラグインと同じ経路）
        let mut body = vec![0u8; length as usize];
        let status = capi::get_buffer(req, buffer_id, &mut body);
        assert!(status.is_ok(), "get_buffer failed: {:?}", status);
        self.respond(
            req,
            PluginEvent::Data {
                phase: req.phase,
                end_stream,
                body,
            },
        )
    }

    fn on_destroy(&self, _req: &HttpRequest, reason: DestroyReason) {
        self.events.lock().unwrap().push(PluginEvent::Destroy(reason));
    }

    fn on_yield_ready(&self, _req: &HttpRequest) {
        self.events.lock().unwrap().push(PluginEvent::YieldReady);
    }
}

// ====================
// ハーネス
// ====================

pub struct Harness {
    pub registry: Arc<DsoRegistry>,
    pub plugin: Arc<ScriptedPlugin>,
    pub host: Arc<MockHost>,
    pub factory: FilterFactory,
    pub filter: Arc<Filter>,
}

impl Harness {
    pub fn new(plugin: ScriptedPlugin) -> Self {
        Self::with_limit(plugin, 0)
    }

    pub fn with_limit(plugin: ScriptedPlugin, buffer_limit: u32) -> Self {
        let registry = Arc::new(DsoRegistry::new());
        let plugin = Arc::new(plugin);
        assert!(registry.publish_plugin(PLUGIN_ID, plugin.clone()));
        let host = MockHost::new(buffer_limit);
        let factory = FilterFactory::new(Arc::new(filter_config(&registry, PLUGIN_ID)));
        let filter = factory.create_filter(host.clone(), host.clone());
        Self {
            registry,
            plugin,
            host,
            factory,
            filter,
        }
    }

    pub fn run_pending(&self) -> usize {
        self.host.dispatcher.run_pending()
    }
}

pub fn filter_config(registry: &Arc<DsoRegistry>, so_id: &str) -> FilterConfig {
    let content = format!(
        r#"
so_id = "{}"
plugin_name = "mock"

[plugin_config]
type_url = "type.example/Mock"
value = {{ greeting = "hi" }}
"#,
        so_id
    );
    FilterConfig::from_toml(&content, registry.clone()).unwrap()
}

pub fn request_headers() -> SharedHeaderMap {
    HeaderMap::from_pairs([(":method", "POST"), (":path", "/upload"), ("host", "example.com")]).into_shared()
}

pub fn response_headers() -> SharedHeaderMap {
    HeaderMap::from_pairs([(":status", "200"), ("content-type", "text/plain")]).into_shared()
}
